//! `dockyard build` command: build a configured application into the local store.

use std::collections::BTreeMap;
use std::path::Path;

use clap::Args;
use dockyard_core::{BuildBackendKind, EventEmitter, PipelineError, Result};
use dockyard_pipeline::{BuildOrchestrator, BuildSpec, DockerBackend};

use crate::output;

#[derive(Args)]
pub struct BuildArgs {
    /// Application name from the config file
    pub app: String,

    /// Override the configured tag
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// Build backend: native or docker
    #[arg(long, value_parser = parse_backend)]
    pub backend: Option<BuildBackendKind>,

    /// Docker CLI binary used by the docker backend
    #[arg(long, env = "DOCKYARD_DOCKER", default_value = "docker")]
    pub docker: String,

    /// Only print the image digest
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, config_path: &Path) -> Result<()> {
    let config = super::load_config(config_path)?;
    let mut spec = BuildSpec::from_config(&config, &args.app)?;

    if let Some(ref tag) = args.tag {
        spec.target = spec
            .target
            .with_tag(tag.as_str())
            .map_err(|e| PipelineError::ConfigError(format!("--tag: {}", e)))?;
    }
    spec.build_args.extend(parse_build_args(&args.build_arg)?);
    if let Some(backend) = args.backend {
        spec.backend = backend;
    }

    let store = super::open_image_store(&config)?;
    let events = EventEmitter::default();
    let progress = (!args.quiet).then(|| output::spawn_progress(&events));
    let orchestrator = BuildOrchestrator::new(store, events)
        .with_docker(DockerBackend::with_program(args.docker));

    let result = orchestrator.build(spec).await;
    drop(orchestrator);
    if let Some(progress) = progress {
        let _ = progress.await;
    }
    let built = result?;

    if args.quiet {
        println!("{}", built.digest);
    } else {
        println!(
            "Built {} ({}, {} layers, {})",
            built.reference,
            output::short_digest(&built.digest),
            built.layer_count,
            output::format_bytes(built.size)
        );
    }
    Ok(())
}

fn parse_backend(value: &str) -> std::result::Result<BuildBackendKind, String> {
    match value {
        "native" => Ok(BuildBackendKind::Native),
        "docker" => Ok(BuildBackendKind::Docker),
        other => Err(format!("unknown backend '{other}' (expected native or docker)")),
    }
}

/// Parse KEY=VALUE pairs.
fn parse_build_args(args: &[String]) -> Result<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| {
                    PipelineError::ConfigError(format!(
                        "Invalid build arg (expected KEY=VALUE): {arg}"
                    ))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_args() {
        let args = vec![
            "NODE_VERSION=20".to_string(),
            "URL=http://example.com?a=1".to_string(),
        ];
        let parsed = parse_build_args(&args).unwrap();
        assert_eq!(parsed.get("NODE_VERSION").map(String::as_str), Some("20"));
        assert_eq!(
            parsed.get("URL").map(String::as_str),
            Some("http://example.com?a=1")
        );
        assert!(parse_build_args(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_parse_build_args_invalid() {
        assert!(parse_build_args(&["NOEQUALS".to_string()]).is_err());
        assert!(parse_build_args(&["=value".to_string()]).is_err());
    }

    #[test]
    fn test_parse_backend() {
        assert_eq!(parse_backend("docker").unwrap(), BuildBackendKind::Docker);
        assert!(parse_backend("podman").is_err());
    }

    #[tokio::test]
    async fn test_build_from_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let app = tmp.path().join("web");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(app.join("go.mod"), "module web\n").unwrap();
        std::fs::write(app.join("main.go"), "package main\n").unwrap();
        std::fs::write(app.join("Dockerfile"), "FROM scratch\nCOPY main.go /src/\n").unwrap();
        let config_path = tmp.path().join("dockyard.yaml");
        std::fs::write(
            &config_path,
            format!(
                "store_dir: {}\napps:\n  web:\n    context: ./web\n    runtime: go\n",
                tmp.path().join("store").display()
            ),
        )
        .unwrap();

        let args = BuildArgs {
            app: "web".to_string(),
            tag: Some("v1".to_string()),
            build_arg: vec![],
            backend: None,
            docker: "docker".to_string(),
            quiet: true,
        };
        execute(args, &config_path).await.unwrap();

        let config = super::super::load_config(&config_path).unwrap();
        let store = super::super::open_image_store(&config).unwrap();
        let reference = dockyard_pipeline::ImageReference::parse("web:v1").unwrap();
        assert!(store.get(&reference).await.is_some());
    }
}
