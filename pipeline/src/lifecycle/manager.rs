//! Applying, verifying and evaluating repository lifecycle policies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dockyard_core::error::{PipelineError, Result};
use dockyard_core::event::{events, EventEmitter, PipelineEvent};

use super::backend::LifecycleBackend;
use super::evaluate::{evaluate, ExpiringImage};
use super::policy::LifecyclePolicy;

/// What `apply` did to the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The repository had no policy
    Created,
    /// A different policy was superseded
    Replaced { previous: String },
    /// The active policy is already this one; nothing was written
    Unchanged,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Replaced { .. } => "replaced",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Policy state of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyState {
    Absent,
    Applied(LifecyclePolicy),
}

/// Manages lifecycle policies through a [`LifecycleBackend`].
pub struct LifecycleManager {
    backend: Arc<dyn LifecycleBackend>,
    events: EventEmitter,
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn LifecycleBackend>, events: EventEmitter) -> Self {
        Self { backend, events }
    }

    /// Make `policy` the repository's active policy.
    ///
    /// The previous document is replaced as a whole. Applying the policy that
    /// is already active writes nothing.
    pub async fn apply(&self, repository: &str, policy: &LifecyclePolicy) -> Result<ApplyOutcome> {
        policy.validate()?;
        let document = policy.canonical()?;

        let outcome = match self.backend.get_policy(repository).await? {
            None => ApplyOutcome::Created,
            Some(current) => match LifecyclePolicy::parse(&current) {
                Ok(active) if active.canonical()? == document => ApplyOutcome::Unchanged,
                Ok(active) => ApplyOutcome::Replaced {
                    previous: active.canonical()?,
                },
                // A document this tool cannot read is still superseded
                Err(_) => ApplyOutcome::Replaced { previous: current },
            },
        };

        if outcome == ApplyOutcome::Unchanged {
            tracing::info!(repository, "Lifecycle policy already active");
            return Ok(outcome);
        }

        self.backend.put_policy(repository, &document).await?;
        tracing::info!(
            repository,
            outcome = outcome.as_str(),
            rules = policy.rules.len(),
            "Lifecycle policy applied"
        );
        self.events.emit(PipelineEvent::with_fields(
            events::LIFECYCLE_APPLIED,
            [
                ("repository", serde_json::json!(repository)),
                ("outcome", serde_json::json!(outcome.as_str())),
            ],
        ));
        Ok(outcome)
    }

    /// The repository's active policy.
    pub async fn verify(&self, repository: &str) -> Result<PolicyState> {
        match self.backend.get_policy(repository).await? {
            None => Ok(PolicyState::Absent),
            Some(document) => {
                let policy = LifecyclePolicy::parse(&document).map_err(|e| {
                    PipelineError::LifecycleError {
                        repository: repository.to_string(),
                        message: format!("active policy is not readable: {}", e),
                    }
                })?;
                Ok(PolicyState::Applied(policy))
            }
        }
    }

    /// Images the active policy would expire at `now`. Read-only.
    pub async fn evaluate(&self, repository: &str, now: DateTime<Utc>) -> Result<Vec<ExpiringImage>> {
        match self.verify(repository).await? {
            PolicyState::Absent => {
                tracing::info!(repository, "No lifecycle policy; nothing expires");
                Ok(Vec::new())
            }
            PolicyState::Applied(policy) => self.evaluate_policy(repository, &policy, now).await,
        }
    }

    /// Images `policy` would expire if it were active. Read-only.
    pub async fn evaluate_policy(
        &self,
        repository: &str,
        policy: &LifecyclePolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiringImage>> {
        let images = self.backend.list_images(repository).await?;
        let expiring = evaluate(policy, &images, now);
        tracing::info!(
            repository,
            images = images.len(),
            expiring = expiring.len(),
            "Evaluated lifecycle policy"
        );
        Ok(expiring)
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::backend::{InMemoryBackend, RemoteImage};
    use chrono::TimeZone;

    const KEEP_THREE: &str = r#"{"rules": [{"rulePriority": 1, "description": "keep 3",
        "selection": {"tagStatus": "tagged", "countType": "imageCountMoreThan", "countNumber": 3},
        "action": {"type": "expire"}}]}"#;
    const KEEP_FIVE: &str = r#"{"rules": [{"rulePriority": 1, "description": "keep 5",
        "selection": {"tagStatus": "tagged", "countType": "imageCountMoreThan", "countNumber": 5},
        "action": {"type": "expire"}}]}"#;

    fn manager() -> (LifecycleManager, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (
            LifecycleManager::new(backend.clone(), EventEmitter::default()),
            backend,
        )
    }

    #[tokio::test]
    async fn test_apply_state_transitions() {
        let (manager, backend) = manager();
        let keep_three = LifecyclePolicy::parse(KEEP_THREE).unwrap();
        let keep_five = LifecyclePolicy::parse(KEEP_FIVE).unwrap();

        assert_eq!(manager.verify("myapp").await.unwrap(), PolicyState::Absent);

        let outcome = manager.apply("myapp", &keep_three).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Created);
        assert_eq!(
            manager.verify("myapp").await.unwrap(),
            PolicyState::Applied(keep_three.clone())
        );

        let outcome = manager.apply("myapp", &keep_five).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Replaced {
                previous: keep_three.canonical().unwrap()
            }
        );
        assert_eq!(
            manager.verify("myapp").await.unwrap(),
            PolicyState::Applied(keep_five)
        );
        assert_eq!(backend.policy_writes("myapp"), 2);
    }

    #[tokio::test]
    async fn test_apply_twice_is_unchanged() {
        let (manager, backend) = manager();
        let policy = LifecyclePolicy::parse(KEEP_THREE).unwrap();
        let mut rx = manager.events.subscribe();

        manager.apply("myapp", &policy).await.unwrap();
        let before = backend.get_policy("myapp").await.unwrap();
        let outcome = manager.apply("myapp", &policy).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(backend.policy_writes("myapp"), 1);
        assert_eq!(backend.get_policy("myapp").await.unwrap(), before);
        assert_eq!(rx.recv().await.unwrap().key, events::LIFECYCLE_APPLIED);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreadable_remote_policy_superseded() {
        let (manager, backend) = manager();
        backend.put_policy("myapp", "not json").await.unwrap();
        let policy = LifecyclePolicy::parse(KEEP_THREE).unwrap();

        let outcome = manager.apply("myapp", &policy).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Replaced {
                previous: "not json".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_verify_unreadable_policy_is_lifecycle_error() {
        let (manager, backend) = manager();
        backend.put_policy("myapp", "{\"rules\": []}").await.unwrap();
        let err = manager.verify("myapp").await.unwrap_err();
        assert!(matches!(err, PipelineError::LifecycleError { .. }));
    }

    #[tokio::test]
    async fn test_evaluate_without_policy() {
        let (manager, backend) = manager();
        backend.add_image(
            "myapp",
            RemoteImage {
                digest: "sha256:aaa".to_string(),
                tags: vec!["v1".to_string()],
                pushed_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                size: 1,
            },
        );
        assert!(manager.evaluate("myapp", Utc::now()).await.unwrap().is_empty());
    }
}
