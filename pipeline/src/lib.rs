//! Dockyard pipeline engine.
//!
//! Builds application images into a local OCI store, publishes them to
//! container registries and manages registry lifecycle policies.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod lifecycle;
pub mod oci;
pub mod publish;

// Re-export common types
pub use build::{BuildOrchestrator, BuildSpec, BuiltImage, DockerBackend, NativeBackend};
pub use lifecycle::{
    ApplyOutcome, AwsCliBackend, ExpiringImage, InMemoryBackend, LifecycleBackend,
    LifecycleManager, LifecyclePolicy, PolicyState, RemoteImage,
};
pub use oci::{ImageReference, ImageStore, OciLayout, OciRegistryClient, RegistryAuth, RegistryClient, StoredImage};
pub use publish::{Destination, PublishOptions, PublishReport, Publisher, PushedImage, RetryPolicy};

/// Dockyard pipeline version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
