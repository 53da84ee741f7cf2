//! Local image store.
//!
//! Keeps built and pulled images as OCI layouts under `sha256/<manifest>/`,
//! with an in-memory reference index backed by a persistent `index.json`.
//! Several references may point at the same layout directory (tags).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dockyard_core::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::layout::OciLayout;
use super::reference::ImageReference;

/// Metadata for a stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredImage {
    /// Full reference string (e.g., "myapp:latest")
    pub reference: String,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Content size in bytes
    pub size_bytes: u64,
    /// When the reference was written to the store
    pub created_at: DateTime<Utc>,
    /// Path to the OCI image layout on disk
    pub path: PathBuf,
}

impl StoredImage {
    /// Parsed form of [`StoredImage::reference`].
    pub fn image_reference(&self) -> Result<ImageReference> {
        ImageReference::parse(&self.reference)
    }

    /// Open the image layout.
    pub fn layout(&self) -> Result<OciLayout> {
        OciLayout::open(&self.path)
    }
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with an in-memory index.
pub struct ImageStore {
    /// Root directory for image storage
    store_dir: PathBuf,
    /// In-memory index: reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
    /// Serializes layout imports and index writes
    writer: Mutex<()>,
}

impl ImageStore {
    /// Open (creating if needed) the store at `store_dir`.
    pub fn new(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            PipelineError::OciImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = load_index(store_dir)?;
        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
            writer: Mutex::new(()),
        })
    }

    /// Get a stored image by reference.
    pub async fn get(&self, reference: &ImageReference) -> Option<StoredImage> {
        let key = index_key(reference);
        self.index.read().await.get(&key).cloned()
    }

    /// Get a stored image by reference, failing with a hint when absent.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<StoredImage> {
        self.get(reference).await.ok_or_else(|| {
            PipelineError::OciImageError(format!(
                "Image '{}' not found locally. Build it first.",
                reference
            ))
        })
    }

    /// Import the layout at `source_dir` under `reference`.
    ///
    /// The layout is copied to `sha256/<manifest hex>/` unless that content is
    /// already present. An existing entry for `reference` is replaced.
    pub async fn put(&self, reference: &ImageReference, source_dir: &Path) -> Result<StoredImage> {
        let layout = OciLayout::open(source_dir)?;
        let digest = layout.manifest_digest().to_string();
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(&digest);
        let blobs_dir = self.store_dir.join("sha256");
        let target_dir = blobs_dir.join(digest_hex);

        let _writer = self.writer.lock().await;
        if !target_dir.exists() {
            std::fs::create_dir_all(&blobs_dir)?;
            let staging = tempfile::Builder::new()
                .prefix(&format!("{}.", digest_hex))
                .suffix(".tmp")
                .tempdir_in(&blobs_dir)?;
            copy_dir_recursive(source_dir, staging.path()).map_err(|e| {
                PipelineError::OciImageError(format!("Failed to copy image to store: {}", e))
            })?;
            std::fs::rename(staging.path(), &target_dir)?;
        }

        let stored = StoredImage {
            reference: index_key(reference),
            digest,
            size_bytes: layout.content_size(),
            created_at: Utc::now(),
            path: target_dir,
        };
        self.commit(stored.clone()).await?;

        tracing::debug!(
            reference = %stored.reference,
            digest = %stored.digest,
            "Stored image"
        );
        Ok(stored)
    }

    /// Bind `target` to the content of `source` without copying.
    pub async fn tag(&self, source: &ImageReference, target: &ImageReference) -> Result<StoredImage> {
        let _writer = self.writer.lock().await;
        let image = self.resolve(source).await?;
        let tagged = StoredImage {
            reference: index_key(target),
            created_at: Utc::now(),
            ..image
        };
        self.commit(tagged.clone()).await?;
        Ok(tagged)
    }

    /// List all stored images, sorted by reference.
    pub async fn list(&self) -> Vec<StoredImage> {
        let index = self.index.read().await;
        let mut images: Vec<StoredImage> = index.values().cloned().collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));
        images
    }

    /// Get the store directory path.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    /// Write the index with `image` added, then publish it in memory.
    ///
    /// Callers hold `writer`, so disk and memory change together.
    async fn commit(&self, image: StoredImage) -> Result<()> {
        let mut index = self.index.write().await;
        let mut images: Vec<StoredImage> = index
            .values()
            .filter(|existing| existing.reference != image.reference)
            .cloned()
            .chain(std::iter::once(image.clone()))
            .collect();
        images.sort_by(|a, b| a.reference.cmp(&b.reference));

        save_index(&self.store_dir, &StoreIndex { images })?;
        index.insert(image.reference.clone(), image);
        Ok(())
    }
}

impl std::fmt::Debug for ImageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageStore")
            .field("store_dir", &self.store_dir)
            .finish()
    }
}

/// Index key: the reference without any digest pin.
fn index_key(reference: &ImageReference) -> String {
    let mut unpinned = reference.clone();
    unpinned.digest = None;
    unpinned.full_reference()
}

fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
    let index_path = store_dir.join("index.json");
    if !index_path.exists() {
        return Ok(HashMap::new());
    }

    let data = std::fs::read_to_string(&index_path).map_err(|e| {
        PipelineError::OciImageError(format!(
            "Failed to read image store index {}: {}",
            index_path.display(),
            e
        ))
    })?;
    let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
        PipelineError::OciImageError(format!("Failed to parse image store index: {}", e))
    })?;

    // Entries whose layout vanished from disk are dropped.
    Ok(store_index
        .images
        .into_iter()
        .filter(|image| image.path.exists())
        .map(|image| (image.reference.clone(), image))
        .collect())
}

/// Persist the index atomically (unique temp file, then rename).
fn save_index(store_dir: &Path, index: &StoreIndex) -> Result<()> {
    use std::io::Write;

    let data = serde_json::to_vec_pretty(index)?;
    let index_path = store_dir.join("index.json");
    let write_err = |e: std::io::Error| {
        PipelineError::OciImageError(format!(
            "Failed to write image store index {}: {}",
            index_path.display(),
            e
        ))
    };

    let mut tmp = tempfile::NamedTempFile::new_in(store_dir).map_err(write_err)?;
    tmp.write_all(&data).map_err(write_err)?;
    tmp.persist(&index_path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Recursively copy a directory.
fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::{Descriptor, ImageConfig, ImageManifest, LayoutWriter, MEDIA_TYPE_LAYER_GZIP};
    use tempfile::TempDir;

    fn create_layout(dir: &Path, layer: &[u8]) -> String {
        let writer = LayoutWriter::create(dir).unwrap();
        let (digest, size) = writer.write_blob(layer).unwrap();
        let config = writer.write_config(&ImageConfig::default()).unwrap();
        let manifest = ImageManifest::new(
            config,
            vec![Descriptor::new(MEDIA_TYPE_LAYER_GZIP, digest, size)],
        );
        writer.finish(&manifest, None).unwrap().manifest_digest().to_string()
    }

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_new_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("images");
        let store = ImageStore::new(&store_dir).unwrap();
        assert!(store_dir.exists());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let digest = create_layout(&source, b"layer");

        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        let stored = store.put(&reference("myapp:latest"), &source).await.unwrap();

        assert_eq!(stored.reference, "myapp:latest");
        assert_eq!(stored.digest, digest);
        assert!(stored.size_bytes > 0);
        assert!(stored.path.exists());

        let fetched = store.get(&reference("myapp")).await.unwrap();
        assert_eq!(fetched.digest, digest);
        assert_eq!(fetched.layout().unwrap().manifest_digest(), digest);
    }

    #[tokio::test]
    async fn test_resolve_missing_has_hint() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        let err = store.resolve(&reference("ghost:v1")).await.unwrap_err();
        assert!(err.to_string().contains("Build it first"));
    }

    #[tokio::test]
    async fn test_tag_then_get_returns_same_reference() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        create_layout(&source, b"layer");

        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        let original = store.put(&reference("myapp:latest"), &source).await.unwrap();

        let target = reference("123456789012.dkr.ecr.us-east-1.amazonaws.com/myapp:latest");
        let tagged = store.tag(&reference("myapp:latest"), &target).await.unwrap();
        let fetched = store.get(&target).await.unwrap();

        assert_eq!(fetched.reference, target.full_reference());
        assert_eq!(fetched.image_reference().unwrap(), target);
        assert_eq!(fetched.digest, original.digest);
        assert_eq!(fetched.path, original.path);
        assert_eq!(tagged, fetched);
    }

    #[tokio::test]
    async fn test_tag_missing_source() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::new(tmp.path()).unwrap();
        assert!(store
            .tag(&reference("nope:v1"), &reference("other:v1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let tmp = TempDir::new().unwrap();
        let one = tmp.path().join("one");
        let two = tmp.path().join("two");
        create_layout(&one, b"one");
        create_layout(&two, b"two");

        let store = ImageStore::new(&tmp.path().join("store")).unwrap();
        store.put(&reference("zeta:v1"), &one).await.unwrap();
        store.put(&reference("alpha:v1"), &two).await.unwrap();

        let refs: Vec<String> = store.list().await.into_iter().map(|i| i.reference).collect();
        assert_eq!(refs, vec!["alpha:v1", "zeta:v1"]);
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_distinct_images() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let source = tmp.path().join(format!("source-{i}"));
            create_layout(&source, format!("layer-{i}").as_bytes());
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.put(&reference(&format!("app{i}:v1")), &source).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.list().await.len(), 8);
        let reopened = ImageStore::new(store.store_dir()).unwrap();
        assert_eq!(reopened.list().await.len(), 8);
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_same_content() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source");
        let digest = create_layout(&source, b"shared");
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                store.put(&reference(&format!("web:v{i}")), &source).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().digest, digest);
        }

        let leftovers: Vec<_> = std::fs::read_dir(store.store_dir().join("sha256"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
        let reopened = ImageStore::new(store.store_dir()).unwrap();
        assert_eq!(reopened.list().await.len(), 8);
    }

    #[tokio::test]
    async fn test_index_persistence() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source = tmp.path().join("source");
        let digest = create_layout(&source, b"layer");

        {
            let store = ImageStore::new(&store_dir).unwrap();
            store.put(&reference("myapp:v1"), &source).await.unwrap();
        }

        let store = ImageStore::new(&store_dir).unwrap();
        let image = store.get(&reference("myapp:v1")).await.unwrap();
        assert_eq!(image.digest, digest);
    }
}
