//! CLI command definitions and dispatch.

mod build;
mod images;
mod lifecycle;
mod publish;
mod tag;
mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dockyard_core::config::DEFAULT_CONFIG_FILE;
use dockyard_core::{LogConfig, LogFormat, PipelineConfig, Result};
use dockyard_pipeline::ImageStore;

/// Dockyard: build, tag, push and retention management for container images.
#[derive(Parser)]
#[command(name = "dockyard", version, about)]
pub struct Cli {
    /// Pipeline configuration file
    #[arg(long, global = true, env = "DOCKYARD_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Diagnostic log format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Log filter directive, e.g. `info` or `dockyard_pipeline=debug`
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Logging setup requested on the command line.
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            filter: self.log_level.clone(),
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an application image into the local store
    Build(build::BuildArgs),
    /// Push a built application image to one or more registries
    Publish(publish::PublishArgs),
    /// Manage repository lifecycle (retention) policies
    #[command(subcommand)]
    Lifecycle(lifecycle::LifecycleCommand),
    /// List images in the local store
    Images(images::ImagesArgs),
    /// Create a tag that refers to an existing local image
    Tag(tag::TagArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load and validate the pipeline configuration.
pub(crate) fn load_config(path: &Path) -> Result<PipelineConfig> {
    tracing::debug!(path = %path.display(), "Loading pipeline config");
    PipelineConfig::load(path)
}

/// The configuration if the file exists, defaults otherwise.
///
/// Commands that only touch the local store work without a config file.
pub(crate) fn load_config_or_default(path: &Path) -> Result<PipelineConfig> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(PipelineConfig::default())
    }
}

/// Open the local image store.
pub(crate) fn open_image_store(config: &PipelineConfig) -> Result<Arc<ImageStore>> {
    Ok(Arc::new(ImageStore::new(&config.store_dir())?))
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = cli.config;
    match cli.command {
        Command::Build(args) => build::execute(args, &config).await,
        Command::Publish(args) => publish::execute(args, &config).await,
        Command::Lifecycle(command) => lifecycle::execute(command, &config).await,
        Command::Images(args) => images::execute(args, &config).await,
        Command::Tag(args) => tag::execute(args, &config).await,
        Command::Version(args) => version::execute(args).await,
    }
}
