//! OCI registry client for pushing built images and pulling base images.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, ECR, any distribution-spec registry). [`RegistryClient`] is
//! the seam the publisher drives, so tests can substitute a fake.

use std::path::Path;

use async_trait::async_trait;
use dockyard_core::error::{PipelineError, PublishFailureReason, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::layout::{host_architecture, ImageManifest, LayoutWriter, OciLayout};
use super::reference::ImageReference;

/// Authentication presented to a registry for one request.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
}

impl RegistryAuth {
    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match self {
            Self::Basic { username, password } => {
                OciRegistryAuth::Basic(username.clone(), password.clone())
            }
            Self::Anonymous => OciRegistryAuth::Anonymous,
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "Anonymous"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Registry operations needed by the pipeline.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Push the image in `layout` as `target`, returning the manifest digest
    /// the registry now serves for that tag.
    ///
    /// Failures are `PublishFailure`s carrying a classified reason.
    async fn push(
        &self,
        layout: &OciLayout,
        target: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String>;

    /// Manifest digest currently bound to `reference`, or `None` if the tag
    /// does not exist.
    async fn manifest_digest(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<Option<String>>;

    /// Pull `reference` into a new OCI layout at `target_dir`.
    async fn pull(
        &self,
        reference: &ImageReference,
        target_dir: &Path,
        auth: &RegistryAuth,
    ) -> Result<OciLayout>;
}

/// [`RegistryClient`] backed by `oci-distribution`.
pub struct OciRegistryClient {
    client: Client,
}

impl OciRegistryClient {
    /// Create a client; registries in `insecure_hosts` are reached over HTTP.
    pub fn new(insecure_hosts: Vec<String>) -> Self {
        let protocol = if insecure_hosts.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(insecure_hosts)
        };
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl std::fmt::Debug for OciRegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciRegistryClient").finish()
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn push(
        &self,
        layout: &OciLayout,
        target: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<String> {
        let oci_ref = to_oci_reference(target)?;

        tracing::info!(
            reference = %target.remote_reference(),
            source = %layout.root().display(),
            "Pushing image to registry"
        );

        let manifest: OciImageManifest = serde_json::from_slice(layout.manifest_bytes())?;
        let config_data = layout.read_blob(&manifest.config.digest)?;
        let config = Config::new(config_data, manifest.config.media_type.clone(), None);

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer_desc in &manifest.layers {
            let layer_data = layout.read_blob(&layer_desc.digest)?;
            tracing::debug!(
                digest = %layer_desc.digest,
                size = layer_data.len(),
                "Read layer for push"
            );
            layers.push(ImageLayer::new(
                layer_data,
                layer_desc.media_type.clone(),
                None,
            ));
        }

        let oci_auth = auth.to_oci_auth();
        let response = self
            .client
            .push(&oci_ref, &layers, config, &oci_auth, Some(manifest))
            .await
            .map_err(|e| classify_push_error(target, e))?;

        // The registry is the authority on what the tag now resolves to.
        let (_manifest, digest) = self
            .client
            .pull_manifest(&oci_ref, &oci_auth)
            .await
            .map_err(|e| classify_push_error(target, e))?;

        tracing::info!(
            reference = %target.remote_reference(),
            manifest_url = %response.manifest_url,
            digest = %digest,
            "Image pushed successfully"
        );

        Ok(digest)
    }

    async fn manifest_digest(
        &self,
        reference: &ImageReference,
        auth: &RegistryAuth,
    ) -> Result<Option<String>> {
        let oci_ref = to_oci_reference(reference)?;
        match self
            .client
            .pull_manifest(&oci_ref, &auth.to_oci_auth())
            .await
        {
            Ok((_manifest, digest)) => Ok(Some(digest)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(classify_push_error(reference, e)),
        }
    }

    async fn pull(
        &self,
        reference: &ImageReference,
        target_dir: &Path,
        auth: &RegistryAuth,
    ) -> Result<OciLayout> {
        let oci_ref = to_oci_reference(reference)?;
        let registry = reference.registry_host().to_string();
        let registry_error = |message: String| PipelineError::RegistryError {
            registry: registry.clone(),
            message,
        };

        tracing::info!(
            reference = %reference.remote_reference(),
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        // Resolves multi-arch indexes to the linux manifest for this host
        let oci_auth = auth.to_oci_auth();
        let (image_manifest, remote_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &oci_auth)
            .await
            .map_err(|e| registry_error(format!("Failed to pull manifest: {}", e)))?;

        let writer = LayoutWriter::create(target_dir)?;

        let mut config_data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &image_manifest.config, &mut config_data)
            .await
            .map_err(|e| registry_error(format!("Failed to pull config blob: {}", e)))?;
        writer.write_blob(&config_data)?;

        for layer in &image_manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            let mut layer_data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut layer_data)
                .await
                .map_err(|e| {
                    registry_error(format!("Failed to pull layer {}: {}", layer.digest, e))
                })?;
            writer.write_blob(&layer_data)?;
        }

        let manifest: ImageManifest =
            serde_json::from_value(serde_json::to_value(&image_manifest)?)?;
        let layout = writer.finish(&manifest, Some(&reference.tag))?;

        tracing::info!(
            reference = %reference.remote_reference(),
            digest = %remote_digest,
            "Image pulled successfully"
        );

        Ok(layout)
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = reference.remote_reference();
    ref_str.parse::<Reference>().map_err(|e| {
        PipelineError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn is_not_found(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        other => {
            let text = other.to_string().to_lowercase();
            text.contains("manifest unknown") || text.contains("not found")
        }
    }
}

/// Map a registry failure to the publish failure taxonomy.
fn classify_push_error(target: &ImageReference, error: OciDistributionError) -> PipelineError {
    let message = error.to_string();
    let reason = match &error {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. } => PublishFailureReason::AuthExpired,
        OciDistributionError::RequestError(_) => PublishFailureReason::NetworkError,
        OciDistributionError::ServerError { code, .. } => match *code {
            401 | 403 => PublishFailureReason::AuthExpired,
            429 => PublishFailureReason::QuotaExceeded,
            _ => reason_from_message(&message),
        },
        _ => reason_from_message(&message),
    };

    PipelineError::PublishFailure {
        registry: target.registry_host().to_string(),
        reference: target.remote_reference(),
        reason,
        message,
    }
}

/// Classify a registry error by its text when the variant carries no status.
pub(crate) fn reason_from_message(message: &str) -> PublishFailureReason {
    let text = message.to_lowercase();
    if text.contains("unauthorized")
        || text.contains("authentication")
        || text.contains("denied")
        || text.contains("token has expired")
    {
        PublishFailureReason::AuthExpired
    } else if text.contains("quota")
        || text.contains("limit exceeded")
        || text.contains("toomanyrequests")
        || text.contains("too many requests")
    {
        PublishFailureReason::QuotaExceeded
    } else if text.contains("already exists")
        || text.contains("immutable")
        || text.contains("tag invalid")
    {
        PublishFailureReason::TagConflict
    } else {
        PublishFailureReason::NetworkError
    }
}

/// Platform resolver that selects linux images matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
