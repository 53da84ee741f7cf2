use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a push to a registry failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishFailureReason {
    /// Credential rejected or expired (retried once after re-authentication)
    AuthExpired,
    /// Transport failure or timeout (retried with backoff)
    NetworkError,
    /// Registry storage or rate quota exhausted
    QuotaExceeded,
    /// Tag already bound to different content and overwrite was not requested
    TagConflict,
}

impl fmt::Display for PublishFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthExpired => write!(f, "auth expired"),
            Self::NetworkError => write!(f, "network error"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::TagConflict => write!(f, "tag conflict"),
        }
    }
}

/// Dockyard error types
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Image build failed (not retriable without changing the inputs)
    #[error("Build failed{}: {message}", for_app(.app))]
    BuildFailure { app: String, message: String },

    /// Push to a registry failed
    #[error("Publish of {reference} to {registry} failed ({reason}): {message}")]
    PublishFailure {
        registry: String,
        reference: String,
        reason: PublishFailureReason,
        message: String,
    },

    /// Malformed lifecycle policy document
    #[error("Lifecycle policy rejected{}: {message}", at_priority(.priority))]
    PolicyRejected {
        priority: Option<u32>,
        message: String,
    },

    /// Lifecycle backend (registry API / cloud CLI) failure
    #[error("Lifecycle error: {repository} - {message}")]
    LifecycleError { repository: String, message: String },

    /// OCI image layout error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Container registry error outside of a publish (e.g. base image pull)
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Operation aborted through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn for_app(app: &str) -> String {
    if app.is_empty() {
        String::new()
    } else {
        format!(" for {}", app)
    }
}

fn at_priority(priority: &Option<u32>) -> String {
    match priority {
        Some(p) => format!(" (rule priority {})", p),
        None => String::new(),
    }
}

impl PipelineError {
    /// Build failure not yet attributed to an application.
    pub fn build(message: impl Into<String>) -> Self {
        Self::BuildFailure {
            app: String::new(),
            message: message.into(),
        }
    }

    /// Policy rejection tied to a specific rule.
    pub fn policy(priority: u32, message: impl Into<String>) -> Self {
        Self::PolicyRejected {
            priority: Some(priority),
            message: message.into(),
        }
    }

    /// Attribute an error raised during a build to `app`.
    ///
    /// Build-time I/O and image layout errors become `BuildFailure`s so the
    /// operator sees which application broke.
    pub fn with_app(self, app: &str) -> Self {
        match self {
            Self::BuildFailure { message, .. } => Self::BuildFailure {
                app: app.to_string(),
                message,
            },
            Self::OciImageError(message) | Self::SerializationError(message) => {
                Self::BuildFailure {
                    app: app.to_string(),
                    message,
                }
            }
            Self::IoError(e) => Self::BuildFailure {
                app: app.to_string(),
                message: e.to_string(),
            },
            other => other,
        }
    }

    /// The publish failure category, if this is a publish failure.
    pub fn publish_reason(&self) -> Option<PublishFailureReason> {
        match self {
            Self::PublishFailure { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether retrying the same operation unchanged may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.publish_reason(),
            Some(PublishFailureReason::AuthExpired | PublishFailureReason::NetworkError)
        )
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigError(_) => 2,
            Self::BuildFailure { .. } => 10,
            Self::PublishFailure { reason, .. } => match reason {
                PublishFailureReason::AuthExpired => 20,
                PublishFailureReason::NetworkError => 21,
                PublishFailureReason::QuotaExceeded => 22,
                PublishFailureReason::TagConflict => 23,
            },
            Self::PolicyRejected { .. } => 30,
            Self::LifecycleError { .. } => 31,
            Self::Cancelled(_) => 40,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for PipelineError {
    fn from(err: serde_yaml::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

/// Result type alias for Dockyard operations
pub type Result<T> = std::result::Result<T, PipelineError>;
