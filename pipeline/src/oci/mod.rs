//! OCI image support.
//!
//! Images move through the pipeline as OCI image layouts:
//!
//! ```text
//! image/
//! ├── oci-layout           (OCI layout marker)
//! ├── index.json           (Image index)
//! └── blobs/
//!     └── sha256/
//!         ├── <manifest>   (Image manifest)
//!         ├── <config>     (Image configuration)
//!         └── <layers>     (Filesystem layers)
//! ```
//!
//! Builders write layouts, the [`ImageStore`] keeps them under local
//! references, and a [`RegistryClient`] pushes them.

pub mod layout;
pub mod reference;
pub mod registry;
pub mod store;

pub use layout::{
    Descriptor, ImageConfig, ImageManifest, LayoutWriter, OciLayout, RuntimeConfig,
};
pub use reference::ImageReference;
pub use registry::{OciRegistryClient, RegistryAuth, RegistryClient};
pub use store::{ImageStore, StoredImage};
