//! Image building.
//!
//! The [`BuildOrchestrator`] validates a [`BuildSpec`], runs a
//! [`BuildBackend`] that writes an OCI layout, and imports the result into
//! the local image store.

pub mod context;
pub mod docker;
pub mod dockerfile;
pub mod layer;
pub mod native;
pub mod orchestrator;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use dockyard_core::error::{PipelineError, Result};
use dockyard_core::EventEmitter;

use crate::oci::ImageReference;

pub use context::BuildContext;
pub use docker::DockerBackend;
pub use dockerfile::{Dockerfile, Instruction};
pub use layer::{LayerBlob, LayerBuilder};
pub use native::NativeBackend;
pub use orchestrator::{BuildOrchestrator, BuildSpec, BuiltImage};

/// Build argument that pins every timestamp in the image.
pub const SOURCE_DATE_EPOCH: &str = "SOURCE_DATE_EPOCH";

/// Everything a backend needs for one build.
#[derive(Debug)]
pub struct BuildJob<'a> {
    pub app: &'a str,
    pub context_dir: &'a Path,
    pub dockerfile: &'a Path,
    pub target: &'a ImageReference,
    pub build_args: &'a BTreeMap<String, String>,
    /// Seconds since the Unix epoch used for all timestamps
    pub source_date_epoch: u64,
    pub events: &'a EventEmitter,
}

/// Produces an OCI image layout from a build job.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Build the image and write it as an OCI layout into `output_dir`.
    async fn build(&self, job: &BuildJob<'_>, output_dir: &Path) -> Result<()>;
}

/// The source date epoch from build args, defaulting to 0.
pub fn source_date_epoch(build_args: &BTreeMap<String, String>) -> Result<u64> {
    match build_args.get(SOURCE_DATE_EPOCH) {
        None => Ok(0),
        Some(value) => value.trim().parse().map_err(|_| {
            PipelineError::build(format!(
                "{} must be a non-negative integer, got '{}'",
                SOURCE_DATE_EPOCH, value
            ))
        }),
    }
}

/// RFC 3339 rendering of an epoch timestamp.
pub(crate) fn epoch_timestamp(epoch: u64) -> String {
    chrono::DateTime::from_timestamp(epoch as i64, 0)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
