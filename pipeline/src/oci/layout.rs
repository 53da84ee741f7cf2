//! OCI image layout reading and writing.
//!
//! A layout directory holds one image:
//!
//! ```text
//! image/
//! ├── oci-layout           (layout version marker)
//! ├── index.json           (points at the manifest)
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>
//!     └── <layers>
//! ```
//!
//! Manifest and config documents are plain serde structs with a fixed field
//! order and `BTreeMap`s, so serializing the same image always yields the
//! same bytes and therefore the same digest.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use dockyard_core::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation carrying the tag inside `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: String, size: u64) -> Self {
        Self {
            media_type: media_type.to_string(),
            digest,
            size,
            platform: None,
            annotations: None,
        }
    }
}

/// Target platform of a manifest in an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// Image index (`index.json` or a nested index blob).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

/// Image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_MANIFEST.to_string()),
            config,
            layers,
            annotations: None,
        }
    }
}

/// Image configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub config: RuntimeConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

/// Execution parameters stored in the image config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Layer chain of the image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One build step in the image history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// An image stored as an OCI layout on disk.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
    manifest_digest: String,
    manifest_bytes: Vec<u8>,
    manifest: ImageManifest,
}

impl OciLayout {
    /// Open the layout at `root`, resolving nested indexes to a single manifest.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.join("oci-layout").is_file() {
            return Err(PipelineError::OciImageError(format!(
                "Not an OCI image layout (missing oci-layout): {}",
                root.display()
            )));
        }

        let index_data = std::fs::read(root.join("index.json")).map_err(|e| {
            PipelineError::OciImageError(format!(
                "Failed to read index.json in {}: {}",
                root.display(),
                e
            ))
        })?;
        let index: ImageIndex = serde_json::from_slice(&index_data)?;

        let mut descriptor = select_manifest(&index).ok_or_else(|| {
            PipelineError::OciImageError(format!(
                "No manifests in index.json of {}",
                root.display()
            ))
        })?;

        // Follow nested indexes (docker buildx exports one) down to a manifest.
        while is_index_media_type(&descriptor.media_type) {
            let nested: ImageIndex = serde_json::from_slice(&read_blob_at(&root, &descriptor.digest)?)?;
            descriptor = select_manifest(&nested).ok_or_else(|| {
                PipelineError::OciImageError(format!(
                    "Nested index {} has no manifests",
                    descriptor.digest
                ))
            })?;
        }

        let manifest_bytes = read_blob_at(&root, &descriptor.digest)?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        Ok(Self {
            root,
            manifest_digest: descriptor.digest,
            manifest_bytes,
            manifest,
        })
    }

    /// Layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Digest of the manifest: the identity of the image content.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Raw manifest bytes as stored.
    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest_bytes
    }

    /// Path of a blob inside this layout.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        blob_path_at(&self.root, digest)
    }

    /// Read a blob and verify it against its digest.
    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        read_blob_at(&self.root, digest)
    }

    /// Parse the image configuration blob.
    pub fn config(&self) -> Result<ImageConfig> {
        let data = self.read_blob(&self.manifest.config.digest)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Size of manifest, config and layers.
    pub fn content_size(&self) -> u64 {
        self.manifest_bytes.len() as u64
            + self.manifest.config.size
            + self.manifest.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

/// Writes a new OCI layout: blobs first, then the manifest and `index.json`.
#[derive(Debug)]
pub struct LayoutWriter {
    root: PathBuf,
}

impl LayoutWriter {
    /// Create the layout skeleton at `root`.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("blobs").join("sha256")).map_err(|e| {
            PipelineError::OciImageError(format!(
                "Failed to create layout directory {}: {}",
                root.display(),
                e
            ))
        })?;
        std::fs::write(root.join("oci-layout"), OCI_LAYOUT_MARKER)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store bytes as a blob, returning `(digest, size)`.
    pub fn write_blob(&self, data: &[u8]) -> Result<(String, u64)> {
        let digest = sha256_digest(data);
        let path = blob_path_at(&self.root, &digest);
        if !path.exists() {
            std::fs::write(&path, data)?;
        }
        Ok((digest, data.len() as u64))
    }

    /// Copy a file in as a blob, returning `(digest, size)`.
    pub fn import_blob(&self, source: &Path) -> Result<(String, u64)> {
        let digest = sha256_file(source)?;
        let path = blob_path_at(&self.root, &digest);
        if !path.exists() {
            std::fs::copy(source, &path)?;
        }
        let size = std::fs::metadata(&path)?.len();
        Ok((digest, size))
    }

    /// Serialize the config as a blob and return its descriptor.
    pub fn write_config(&self, config: &ImageConfig) -> Result<Descriptor> {
        let data = serde_json::to_vec(config)?;
        let (digest, size) = self.write_blob(&data)?;
        Ok(Descriptor::new(MEDIA_TYPE_CONFIG, digest, size))
    }

    /// Write the manifest and `index.json`, then reopen the finished layout.
    pub fn finish(self, manifest: &ImageManifest, tag: Option<&str>) -> Result<OciLayout> {
        let manifest_data = serde_json::to_vec(manifest)?;
        let (digest, size) = self.write_blob(&manifest_data)?;

        let mut descriptor = Descriptor::new(MEDIA_TYPE_MANIFEST, digest, size);
        if let Some(tag) = tag {
            let mut annotations = BTreeMap::new();
            annotations.insert(ANNOTATION_REF_NAME.to_string(), tag.to_string());
            descriptor.annotations = Some(annotations);
        }

        let index = ImageIndex {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_INDEX.to_string()),
            manifests: vec![descriptor],
        };
        std::fs::write(
            self.root.join("index.json"),
            serde_json::to_vec_pretty(&index)?,
        )?;

        OciLayout::open(&self.root)
    }
}

/// `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// `sha256:<hex>` digest of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        PipelineError::OciImageError(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

fn blob_path_at(root: &Path, digest: &str) -> PathBuf {
    root.join("blobs").join("sha256").join(digest_hex(digest))
}

fn read_blob_at(root: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = blob_path_at(root, digest);
    let data = std::fs::read(&path).map_err(|e| {
        PipelineError::OciImageError(format!("Failed to read blob {}: {}", digest, e))
    })?;
    let actual = sha256_digest(&data);
    if actual != digest {
        return Err(PipelineError::OciImageError(format!(
            "Blob {} is corrupt (content hashes to {})",
            digest, actual
        )));
    }
    Ok(data)
}

fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_INDEX || media_type == MEDIA_TYPE_DOCKER_LIST
}

/// Pick the manifest for a linux host of this architecture, else the first one.
fn select_manifest(index: &ImageIndex) -> Option<Descriptor> {
    let arch = host_architecture();
    index
        .manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .or_else(|| index.manifests.first())
        .cloned()
}

/// OCI architecture name of the host.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
