//! `dockyard publish` command: push an application image to registries.

use std::path::Path;

use clap::Args;
use dockyard_core::{EventEmitter, PipelineConfig, PipelineError, Result};
use dockyard_pipeline::{BuildSpec, Destination, PublishOptions, Publisher, RetryPolicy};
use tokio_util::sync::CancellationToken;

use crate::output;

#[derive(Args)]
pub struct PublishArgs {
    /// Application name from the config file
    pub app: String,

    /// Destination registry name, can be repeated (default: the app's registries)
    #[arg(long)]
    pub registry: Vec<String>,

    /// Publish this local tag instead of the configured one
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Replace remote tags that point at different content
    #[arg(long)]
    pub overwrite: bool,

    /// Only print pushed references
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PublishArgs, config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let mut source = BuildSpec::from_config(&config, &args.app)?.target;
    if let Some(ref tag) = args.tag {
        source = source.with_tag(tag.as_str())?;
    }

    let registries = destination_names(&config, &args)?;
    let destinations = registries
        .iter()
        .map(|name| Ok(Destination::from_config(name, config.registry(name)?)))
        .collect::<Result<Vec<_>>>()?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling pushes");
            on_interrupt.cancel();
        }
    });

    let store = super::open_image_store(&config)?;
    let events = EventEmitter::default();
    let progress = (!args.quiet).then(|| output::spawn_progress(&events));
    let publisher = Publisher::new(store, RetryPolicy::from(&config.retry), events)
        .with_cancellation(cancel);

    let options = PublishOptions {
        overwrite: args.overwrite,
    };
    let result = publisher.publish(&source, &destinations, options).await;
    drop(publisher);
    if let Some(progress) = progress {
        let _ = progress.await;
    }
    let report = result?;

    if !args.quiet {
        let mut table = output::new_table(&["REGISTRY", "REFERENCE", "DIGEST", "STATUS"]);
        for push in &report.results {
            match &push.outcome {
                Ok(pushed) => table.add_row([
                    push.registry.clone(),
                    pushed.reference.to_string(),
                    output::short_digest(&pushed.digest),
                    "pushed".to_string(),
                ]),
                Err(e) => table.add_row([
                    push.registry.clone(),
                    String::new(),
                    String::new(),
                    failure_status(e),
                ]),
            };
        }
        println!("{table}");
    }

    let pushed = report
        .into_result()
        .map_err(|e| with_app(e, &args.app))?;
    if args.quiet {
        for image in &pushed {
            println!("{}", image.reference);
        }
    }
    Ok(())
}

/// Registries named on the command line, else those configured for the app.
fn destination_names(config: &PipelineConfig, args: &PublishArgs) -> Result<Vec<String>> {
    let names = if args.registry.is_empty() {
        config.app(&args.app)?.registries.clone()
    } else {
        args.registry.clone()
    };
    if names.is_empty() {
        return Err(PipelineError::ConfigError(format!(
            "no registries to publish {} to; pass --registry or set apps.{}.registries",
            args.app, args.app
        )));
    }
    Ok(names)
}

/// Name the application in a publish failure; the reason and exit code are kept.
fn with_app(error: PipelineError, app: &str) -> PipelineError {
    match error {
        PipelineError::PublishFailure {
            registry,
            reference,
            reason,
            message,
        } => PipelineError::PublishFailure {
            registry,
            reference,
            reason,
            message: format!("app {}: {}", app, message),
        },
        other => other,
    }
}

fn failure_status(error: &PipelineError) -> String {
    match error.publish_reason() {
        Some(reason) => format!("failed: {}", reason),
        None => format!("failed: {}", error),
    }
}
