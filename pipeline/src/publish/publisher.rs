//! Pushes locally built images to destination registries.

use std::future::Future;
use std::sync::Arc;

use dockyard_core::config::RegistryConfig;
use dockyard_core::error::{PipelineError, PublishFailureReason, Result};
use dockyard_core::event::{events, EventEmitter, PipelineEvent};
use tokio_util::sync::CancellationToken;

use super::credentials::{acquisition_failure_reason, provider_for, CredentialProvider};
use super::retry::RetryPolicy;
use super::session::RegistrySession;
use crate::oci::{ImageReference, ImageStore, OciLayout, OciRegistryClient, RegistryClient};

/// One destination registry with its own client and credential session.
pub struct Destination {
    /// Configured registry name
    pub name: String,
    pub host: String,
    /// Repository namespace (Docker Hub user)
    pub namespace: Option<String>,
    client: Arc<dyn RegistryClient>,
    session: RegistrySession,
}

impl Destination {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        namespace: Option<String>,
        client: Arc<dyn RegistryClient>,
        provider: Box<dyn CredentialProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            namespace,
            client,
            session: RegistrySession::new(provider),
        }
    }

    /// Destination for a configured registry.
    pub fn from_config(name: &str, config: &RegistryConfig) -> Self {
        let host = config.host();
        let insecure = if config.insecure() {
            vec![host.clone()]
        } else {
            Vec::new()
        };
        Self::new(
            name,
            host,
            config.namespace().map(str::to_string),
            Arc::new(OciRegistryClient::new(insecure)),
            provider_for(config),
        )
    }

    /// Reference `source` gets in this registry.
    pub fn target_for(&self, source: &ImageReference) -> Result<ImageReference> {
        source.retarget(&self.host, self.namespace.as_deref())
    }

    /// Credential session for this registry.
    pub fn session(&self) -> &RegistrySession {
        &self.session
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("namespace", &self.namespace)
            .field("session", &self.session)
            .finish()
    }
}

/// A successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedImage {
    pub registry: String,
    pub reference: ImageReference,
    /// Manifest digest the registry serves for the tag
    pub digest: String,
}

/// Result of pushing to one destination.
#[derive(Debug)]
pub struct PushResult {
    pub registry: String,
    pub outcome: Result<PushedImage>,
}

/// Per-destination results of a publish batch.
#[derive(Debug)]
pub struct PublishReport {
    pub source: ImageReference,
    pub results: Vec<PushResult>,
}

impl PublishReport {
    /// Whether every destination succeeded.
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    /// All pushed images, or the first failure.
    pub fn into_result(self) -> Result<Vec<PushedImage>> {
        self.results.into_iter().map(|r| r.outcome).collect()
    }
}

/// Options for a publish batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Replace a tag that already points at different content
    pub overwrite: bool,
}

/// Pushes images from the local store.
pub struct Publisher {
    store: Arc<ImageStore>,
    retry: RetryPolicy,
    events: EventEmitter,
    cancel: CancellationToken,
}

impl Publisher {
    pub fn new(store: Arc<ImageStore>, retry: RetryPolicy, events: EventEmitter) -> Self {
        Self {
            store,
            retry,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` to abort in-flight pushes.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Push `source` to every destination concurrently.
    ///
    /// Each destination is reported separately; a failure in one does not stop
    /// the others.
    pub async fn publish(
        &self,
        source: &ImageReference,
        destinations: &[Destination],
        options: PublishOptions,
    ) -> Result<PublishReport> {
        let image = self.store.resolve(source).await?;
        let layout = image.layout()?;

        tracing::info!(
            source = %source,
            digest = %image.digest,
            destinations = destinations.len(),
            "Publishing image"
        );

        let pushes = destinations
            .iter()
            .map(|destination| self.push_to(&layout, source, destination, options));
        let outcomes = futures::future::join_all(pushes).await;

        let results = destinations
            .iter()
            .zip(outcomes)
            .map(|(destination, outcome)| PushResult {
                registry: destination.name.clone(),
                outcome,
            })
            .collect();

        Ok(PublishReport {
            source: source.clone(),
            results,
        })
    }

    /// Manifest digest the destination serves for `source`'s tag.
    pub async fn verify(
        &self,
        source: &ImageReference,
        destination: &Destination,
    ) -> Result<String> {
        let target = destination.target_for(source)?;
        let result = async {
            let auth = destination
                .session
                .auth()
                .await
                .map_err(|e| auth_failure(&target, e))?;
            self.guarded(&target, destination.client.manifest_digest(&target, &auth))
                .await
        }
        .await
        .map_err(|e| relabel(e, &destination.name))?;

        match result {
            Some(digest) => {
                tracing::info!(reference = %target, digest = %digest, "Verified remote tag");
                Ok(digest)
            }
            None => Err(PipelineError::RegistryError {
                registry: destination.name.clone(),
                message: format!("tag {} not found", target.remote_reference()),
            }),
        }
    }

    async fn push_to(
        &self,
        layout: &OciLayout,
        source: &ImageReference,
        destination: &Destination,
        options: PublishOptions,
    ) -> Result<PushedImage> {
        let target = destination.target_for(source)?;
        self.emit(events::PUSH_STARTED, destination, &target, []);

        let mut backoff = self.retry.backoff.clone();
        let mut network_failures = 0u32;
        let mut reauthenticated = false;

        loop {
            let error = match self.attempt(layout, &target, destination, options).await {
                Ok(digest) => {
                    tracing::info!(
                        registry = %destination.name,
                        reference = %target,
                        digest = %digest,
                        "Push completed"
                    );
                    self.emit(
                        events::PUSH_COMPLETED,
                        destination,
                        &target,
                        [("digest", serde_json::json!(digest))],
                    );
                    return Ok(PushedImage {
                        registry: destination.name.clone(),
                        reference: target,
                        digest,
                    });
                }
                Err(e) => relabel(e, &destination.name),
            };

            if !error.is_retriable() {
                return Err(self.fail(destination, &target, error));
            }
            match error.publish_reason() {
                Some(PublishFailureReason::AuthExpired) if !reauthenticated => {
                    reauthenticated = true;
                    tracing::warn!(
                        registry = %destination.name,
                        error = %error,
                        "Credential rejected, re-authenticating"
                    );
                    self.emit(events::PUSH_REAUTH, destination, &target, []);
                    if let Err(e) = destination.session.refresh().await {
                        let error = relabel(auth_failure(&target, e), &destination.name);
                        if error.publish_reason() != Some(PublishFailureReason::NetworkError) {
                            return Err(self.fail(destination, &target, error));
                        }
                        // The next attempt acquires again and enters the network backoff.
                        tracing::warn!(
                            registry = %destination.name,
                            error = %error,
                            "Re-authentication could not reach the token endpoint"
                        );
                    }
                }
                Some(PublishFailureReason::NetworkError) => {
                    network_failures += 1;
                    if !self.retry.should_retry(network_failures) {
                        return Err(self.fail(destination, &target, error));
                    }
                    tracing::warn!(
                        registry = %destination.name,
                        attempt = network_failures,
                        delay_ms = backoff.delay.as_millis() as u64,
                        error = %error,
                        "Push failed, retrying"
                    );
                    self.emit(
                        events::PUSH_RETRY,
                        destination,
                        &target,
                        [
                            ("attempt", serde_json::json!(network_failures)),
                            ("error", serde_json::json!(error.to_string())),
                        ],
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(self.fail(destination, &target, cancelled(&target)));
                        }
                        _ = tokio::time::sleep(backoff.delay) => {}
                    }
                    backoff = backoff.increment();
                }
                _ => return Err(self.fail(destination, &target, error)),
            }
        }
    }

    /// One push attempt: auth, conflict check, upload.
    async fn attempt(
        &self,
        layout: &OciLayout,
        target: &ImageReference,
        destination: &Destination,
        options: PublishOptions,
    ) -> Result<String> {
        let auth = destination
            .session
            .auth()
            .await
            .map_err(|e| auth_failure(target, e))?;

        if !options.overwrite {
            let existing = match self
                .guarded(target, destination.client.manifest_digest(target, &auth))
                .await
            {
                Ok(existing) => existing,
                // Docker Hub answers lookups in repositories that do not exist
                // yet with 401; the push itself decides whether auth is valid.
                Err(e) if e.publish_reason() == Some(PublishFailureReason::AuthExpired) => {
                    tracing::debug!(
                        reference = %target,
                        error = %e,
                        "Tag lookup unauthorized, treating tag as absent"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            if let Some(existing) = existing {
                if existing != layout.manifest_digest() {
                    return Err(PipelineError::PublishFailure {
                        registry: destination.host.clone(),
                        reference: target.remote_reference(),
                        reason: PublishFailureReason::TagConflict,
                        message: format!(
                            "tag already points at {} (local image is {}); use overwrite to replace it",
                            existing,
                            layout.manifest_digest()
                        ),
                    });
                }
            }
        }

        self.guarded(target, destination.client.push(layout, target, &auth))
            .await
    }

    /// Bound a registry request by the request timeout and the cancellation token.
    async fn guarded<T>(
        &self,
        target: &ImageReference,
        request: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if self.cancel.is_cancelled() {
            return Err(cancelled(target));
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled(target)),
            outcome = self.retry.timed(request) => match outcome {
                Some(result) => result,
                None => Err(PipelineError::PublishFailure {
                    registry: target.registry_host().to_string(),
                    reference: target.remote_reference(),
                    reason: PublishFailureReason::NetworkError,
                    message: format!(
                        "request timed out after {}s",
                        self.retry.request_timeout.as_secs_f64()
                    ),
                }),
            },
        }
    }

    fn fail(
        &self,
        destination: &Destination,
        target: &ImageReference,
        error: PipelineError,
    ) -> PipelineError {
        tracing::error!(
            registry = %destination.name,
            reference = %target,
            error = %error,
            "Push failed"
        );
        self.emit(
            events::PUSH_FAILED,
            destination,
            target,
            [("error", serde_json::json!(error.to_string()))],
        );
        error
    }

    fn emit<const N: usize>(
        &self,
        key: &str,
        destination: &Destination,
        target: &ImageReference,
        extra: [(&str, serde_json::Value); N],
    ) {
        let fields = [
            ("registry", serde_json::json!(destination.name)),
            ("reference", serde_json::json!(target.to_string())),
        ]
        .into_iter()
        .chain(extra);
        self.events.emit(PipelineEvent::with_fields(key, fields));
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("retry", &self.retry)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Credential acquisition failures as publish failures: unreachable token
/// endpoints are network errors, everything else is expired auth.
fn auth_failure(target: &ImageReference, error: PipelineError) -> PipelineError {
    match error {
        e @ PipelineError::PublishFailure { .. } => e,
        e @ PipelineError::Cancelled(_) => e,
        other => PipelineError::PublishFailure {
            registry: target.registry_host().to_string(),
            reference: target.remote_reference(),
            reason: acquisition_failure_reason(&other),
            message: format!("could not obtain credentials: {}", other),
        },
    }
}

fn cancelled(target: &ImageReference) -> PipelineError {
    PipelineError::Cancelled(format!("push of {}", target.remote_reference()))
}

/// Report failures under the configured registry name rather than the host.
fn relabel(error: PipelineError, registry_name: &str) -> PipelineError {
    match error {
        PipelineError::PublishFailure {
            reference,
            reason,
            message,
            ..
        } => PipelineError::PublishFailure {
            registry: registry_name.to_string(),
            reference,
            reason,
            message,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::{ImageConfig, ImageManifest, LayoutWriter};
    use crate::oci::RegistryAuth;
    use crate::publish::credentials::{AnonymousProvider, Credential};
    use crate::publish::retry::Backoff;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Registry double with scripted push failures.
    #[derive(Default)]
    struct ScriptedRegistry {
        tags: Mutex<HashMap<String, String>>,
        failures: Mutex<Vec<PublishFailureReason>>,
        pushes: AtomicU32,
        hang: bool,
        /// Tag lookups fail as unauthorized, as Docker Hub does for new repositories
        deny_lookups: bool,
    }

    impl ScriptedRegistry {
        fn failing(failures: Vec<PublishFailureReason>) -> Self {
            Self {
                failures: Mutex::new(failures),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedRegistry {
        async fn push(
            &self,
            layout: &OciLayout,
            target: &ImageReference,
            _auth: &RegistryAuth,
        ) -> Result<String> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let next = {
                let mut failures = self.failures.lock();
                (!failures.is_empty()).then(|| failures.remove(0))
            };
            if let Some(reason) = next {
                return Err(PipelineError::PublishFailure {
                    registry: target.registry_host().to_string(),
                    reference: target.remote_reference(),
                    reason,
                    message: "scripted failure".to_string(),
                });
            }
            let digest = layout.manifest_digest().to_string();
            self.tags
                .lock()
                .insert(target.remote_reference(), digest.clone());
            Ok(digest)
        }

        async fn manifest_digest(
            &self,
            reference: &ImageReference,
            _auth: &RegistryAuth,
        ) -> Result<Option<String>> {
            if self.deny_lookups {
                return Err(PipelineError::PublishFailure {
                    registry: reference.registry_host().to_string(),
                    reference: reference.remote_reference(),
                    reason: PublishFailureReason::AuthExpired,
                    message: "UNAUTHORIZED: authentication required".to_string(),
                });
            }
            Ok(self.tags.lock().get(&reference.remote_reference()).cloned())
        }

        async fn pull(
            &self,
            _reference: &ImageReference,
            _target_dir: &Path,
            _auth: &RegistryAuth,
        ) -> Result<OciLayout> {
            Err(PipelineError::Other("not supported".to_string()))
        }
    }

    struct TokenProvider;

    #[async_trait]
    impl CredentialProvider for TokenProvider {
        fn describe(&self) -> String {
            "token".to_string()
        }

        async fn acquire(&self) -> Result<Option<Credential>> {
            Ok(Some(Credential::new("AWS", "token")))
        }
    }

    /// Token endpoint that cannot be reached.
    struct UnreachableTokenEndpoint;

    #[async_trait]
    impl CredentialProvider for UnreachableTokenEndpoint {
        fn describe(&self) -> String {
            "unreachable".to_string()
        }

        async fn acquire(&self) -> Result<Option<Credential>> {
            Err(PipelineError::RegistryError {
                registry: ECR.to_string(),
                message: "aws ecr get-login-password failed: Could not connect to the endpoint URL"
                    .to_string(),
            })
        }
    }

    const ECR: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(4)),
            request_timeout: Duration::from_secs(5),
        }
    }

    async fn stored_image(tmp: &TempDir) -> (Arc<ImageStore>, ImageReference) {
        let store = Arc::new(ImageStore::new(&tmp.path().join("store")).unwrap());
        let layout_dir = tmp.path().join("layout");
        let writer = LayoutWriter::create(&layout_dir).unwrap();
        let config = writer.write_config(&ImageConfig::default()).unwrap();
        writer
            .finish(&ImageManifest::new(config, Vec::new()), Some("latest"))
            .unwrap();
        let reference = ImageReference::parse("myapp:latest").unwrap();
        store.put(&reference, &layout_dir).await.unwrap();
        (store, reference)
    }

    fn destination(registry: Arc<ScriptedRegistry>) -> Destination {
        Destination::new("ecr", ECR, None, registry, Box::new(TokenProvider))
    }

    #[tokio::test]
    async fn test_publish_success() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::default());
        let publisher = Publisher::new(store.clone(), fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        assert!(report.is_success());
        let pushed = report.into_result().unwrap();
        assert_eq!(
            pushed[0].reference.to_string(),
            format!("{}/myapp:latest", ECR)
        );
        let local = store.resolve(&reference).await.unwrap();
        assert_eq!(pushed[0].digest, local.digest);
        assert_eq!(
            publisher.verify(&reference, &destinations[0]).await.unwrap(),
            local.digest
        );
    }

    #[tokio::test]
    async fn test_network_error_retried_then_succeeds() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::NetworkError,
            PublishFailureReason::NetworkError,
        ]));
        let emitter = EventEmitter::default();
        let mut rx = emitter.subscribe();
        let publisher = Publisher::new(store, fast_retry(), emitter);

        let report = publisher
            .publish(&reference, &[destination(registry.clone())], PublishOptions::default())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 3);

        let mut retries = 0;
        while let Ok(event) = rx.try_recv() {
            if event.key == events::PUSH_RETRY {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_network_error_exhausts_budget() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::NetworkError;
            5
        ]));
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());

        let report = publisher
            .publish(&reference, &[destination(registry.clone())], PublishOptions::default())
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert_eq!(err.publish_reason(), Some(PublishFailureReason::NetworkError));
        assert!(matches!(err, PipelineError::PublishFailure { ref registry, .. } if registry == "ecr"));
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unreachable_token_endpoint_is_network_error() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::default());
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [Destination::new(
            "ecr",
            ECR,
            None,
            registry.clone(),
            Box::new(UnreachableTokenEndpoint),
        )];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert_eq!(err.publish_reason(), Some(PublishFailureReason::NetworkError));
        assert_eq!(err.exit_code(), 21);
        assert_eq!(destinations[0].session().acquisitions(), 3);
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_tag_lookup_does_not_block_first_push() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry {
            deny_lookups: true,
            ..Default::default()
        });
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 1);
        assert_eq!(destinations[0].session().acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_auth_expired_reauthenticates_once() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::AuthExpired,
        ]));
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(destinations[0].session().acquisitions(), 2);
    }

    #[tokio::test]
    async fn test_second_auth_expired_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::AuthExpired,
            PublishFailureReason::AuthExpired,
        ]));
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert_eq!(err.publish_reason(), Some(PublishFailureReason::AuthExpired));
        assert_eq!(destinations[0].session().acquisitions(), 2);
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_quota_exceeded_not_retried() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::QuotaExceeded,
        ]));
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());

        let report = publisher
            .publish(&reference, &[destination(registry.clone())], PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            report.into_result().unwrap_err().publish_reason(),
            Some(PublishFailureReason::QuotaExceeded)
        );
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tag_conflict_unless_overwrite() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::default());
        registry.tags.lock().insert(
            format!("{}/myapp:latest", ECR),
            format!("sha256:{}", "0".repeat(64)),
        );
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(
            report.into_result().unwrap_err().publish_reason(),
            Some(PublishFailureReason::TagConflict)
        );
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 0);

        let report = publisher
            .publish(&reference, &destinations, PublishOptions { overwrite: true })
            .await
            .unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_same_content_push_is_not_a_conflict() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::default());
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [destination(registry.clone())];

        for _ in 0..2 {
            let report = publisher
                .publish(&reference, &destinations, PublishOptions::default())
                .await
                .unwrap();
            assert!(report.is_success());
        }
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_multiple_registries_reported_separately() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let good = Arc::new(ScriptedRegistry::default());
        let bad = Arc::new(ScriptedRegistry::failing(vec![
            PublishFailureReason::QuotaExceeded,
        ]));
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let destinations = [
            destination(good),
            Destination::new(
                "hub",
                "docker.io",
                Some("alice".to_string()),
                bad,
                Box::new(AnonymousProvider),
            ),
        ];

        let report = publisher
            .publish(&reference, &destinations, PublishOptions::default())
            .await
            .unwrap();
        assert!(!report.is_success());
        assert!(report.results[0].outcome.is_ok());
        assert_eq!(report.results[1].registry, "hub");
        assert!(report.results[1].outcome.is_err());
    }

    #[tokio::test]
    async fn test_request_timeout_is_network_error() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry {
            hang: true,
            ..Default::default()
        });
        let retry = RetryPolicy {
            max_attempts: 2,
            request_timeout: Duration::from_millis(20),
            ..fast_retry()
        };
        let publisher = Publisher::new(store, retry, EventEmitter::default());

        let report = publisher
            .publish(&reference, &[destination(registry.clone())], PublishOptions::default())
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert_eq!(err.publish_reason(), Some(PublishFailureReason::NetworkError));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_push() {
        let tmp = TempDir::new().unwrap();
        let (store, reference) = stored_image(&tmp).await;
        let registry = Arc::new(ScriptedRegistry::default());
        let token = CancellationToken::new();
        token.cancel();
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default())
            .with_cancellation(token);

        let report = publisher
            .publish(&reference, &[destination(registry.clone())], PublishOptions::default())
            .await
            .unwrap();
        let err = report.into_result().unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(_)));
        assert_eq!(registry.pushes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_local_image() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::new(tmp.path()).unwrap());
        let publisher = Publisher::new(store, fast_retry(), EventEmitter::default());
        let reference = ImageReference::parse("ghost:latest").unwrap();
        let err = publisher
            .publish(&reference, &[], PublishOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Build it first"));
    }

    #[test]
    fn test_destination_from_docker_hub_config() {
        let config = RegistryConfig::DockerHub {
            username: "alice".to_string(),
            password_env: None,
        };
        let destination = Destination::from_config("hub", &config);
        let target = destination
            .target_for(&ImageReference::parse("myapp:v1").unwrap())
            .unwrap();
        assert_eq!(target.remote_reference(), "docker.io/alice/myapp:v1");
    }
}
