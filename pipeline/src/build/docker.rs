//! Docker buildx backend.
//!
//! Delegates the build to `docker buildx build` with an OCI tarball output,
//! then unpacks the tarball into the output layout directory. Supports the
//! full Dockerfile language (RUN, multi-stage builds).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use dockyard_core::error::{PipelineError, Result};
use tokio::process::Command;

use super::{BuildBackend, BuildJob, SOURCE_DATE_EPOCH};
use crate::oci::OciLayout;

/// Lines of stderr kept in a build failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Runs builds through the Docker CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    program: String,
}

impl DockerBackend {
    /// Use `program` instead of `docker` from `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, job: &BuildJob<'_>, tarball: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("buildx")
            .arg("build")
            .arg("--file")
            .arg(job.dockerfile)
            .arg("--output")
            .arg(format!(
                "type=oci,dest={},rewrite-timestamp=true",
                tarball.display()
            ))
            .arg("--provenance=false")
            .arg("--tag")
            .arg(job.target.full_reference());
        for (key, value) in job.build_args {
            cmd.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        cmd.arg(job.context_dir)
            .env(SOURCE_DATE_EPOCH, job.source_date_epoch.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::with_program("docker")
    }
}

#[async_trait]
impl BuildBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn build(&self, job: &BuildJob<'_>, output_dir: &Path) -> Result<()> {
        let scratch = tempfile::TempDir::new()?;
        let tarball = scratch.path().join("image.tar");

        tracing::info!(
            app = job.app,
            program = %self.program,
            context = %job.context_dir.display(),
            "Running docker buildx"
        );

        let output = self
            .command(job, &tarball)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    PipelineError::build(format!(
                        "'{}' not found; install Docker with buildx or use the native backend",
                        self.program
                    ))
                } else {
                    PipelineError::build(format!("Failed to run {}: {}", self.program, e))
                }
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let status = output
                .status
                .code()
                .map_or("a signal".to_string(), |c| format!("status {}", c));
            return Err(PipelineError::build(failure_message(&status, &stderr)));
        }

        unpack_oci_tarball(&tarball, output_dir)?;
        OciLayout::open(output_dir)?;
        Ok(())
    }
}

/// Extract an OCI layout tarball into `dest`.
pub fn unpack_oci_tarball(tarball: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(tarball).map_err(|e| {
        PipelineError::build(format!(
            "docker buildx produced no image at {}: {}",
            tarball.display(),
            e
        ))
    })?;
    std::fs::create_dir_all(dest)?;
    tar::Archive::new(file).unpack(dest).map_err(|e| {
        PipelineError::build(format!("Failed to unpack OCI tarball: {}", e))
    })?;
    Ok(())
}

/// Message for a failed `docker buildx build`, with a remedy when the
/// active builder cannot write OCI tarballs.
fn failure_message(status: &str, stderr: &str) -> String {
    let mut message = format!("docker buildx exited with {}: {}", status, stderr_tail(stderr));
    let lower = stderr.to_lowercase();
    if lower.contains("exporter is not supported")
        || lower.contains("not supported for the docker driver")
    {
        message.push_str(
            "\nhint: the default docker driver cannot export OCI images; use a docker-container \
             builder (docker buildx create --use) or enable the containerd image store",
        );
    }
    message
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim_end().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
