//! Dockyard Core - Foundational Types
//!
//! Error taxonomy, pipeline configuration, logging setup and progress events
//! shared by the pipeline engine and the CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod log;

// Re-export commonly used types
pub use config::{AppConfig, AppRuntime, BuildBackendKind, PipelineConfig, RegistryConfig, RetryConfig};
pub use error::{PipelineError, PublishFailureReason, Result};
pub use event::{EventEmitter, EventPayload, PipelineEvent};
pub use log::{LogConfig, LogFormat};

/// Dockyard version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
