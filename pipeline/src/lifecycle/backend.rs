//! Where lifecycle policies live: the registry's policy API.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dockyard_core::error::{PipelineError, Result};
use serde::Deserialize;
use tokio::process::Command;

/// An image as listed by a remote repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub digest: String,
    /// Empty for untagged images
    pub tags: Vec<String>,
    pub pushed_at: DateTime<Utc>,
    pub size: u64,
}

/// Policy storage and image listing for remote repositories.
#[async_trait]
pub trait LifecycleBackend: Send + Sync {
    /// Replace the repository's policy document as a whole.
    async fn put_policy(&self, repository: &str, document: &str) -> Result<()>;

    /// The active policy document, or `None` if the repository has none.
    async fn get_policy(&self, repository: &str) -> Result<Option<String>>;

    /// Every image in the repository.
    async fn list_images(&self, repository: &str) -> Result<Vec<RemoteImage>>;
}

/// ECR through the `aws` CLI.
#[derive(Debug, Clone)]
pub struct AwsCliBackend {
    region: String,
    registry_id: Option<String>,
    program: String,
}

impl AwsCliBackend {
    pub fn new(region: impl Into<String>, registry_id: Option<String>) -> Self {
        Self {
            region: region.into(),
            registry_id,
            program: "aws".to_string(),
        }
    }

    /// Use `program` instead of `aws` from `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, operation: &str, repository: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["ecr", operation, "--repository-name", repository])
            .args(["--region", &self.region, "--output", "json"]);
        if let Some(ref registry_id) = self.registry_id {
            cmd.args(["--registry-id", registry_id]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run `cmd`, returning stdout on success and stderr on failure.
    async fn run(
        &self,
        mut cmd: Command,
        repository: &str,
    ) -> Result<std::result::Result<Vec<u8>, String>> {
        let output = cmd.output().await.map_err(|e| PipelineError::LifecycleError {
            repository: repository.to_string(),
            message: format!("Failed to run {}: {}", self.program, e),
        })?;
        if output.status.success() {
            Ok(Ok(output.stdout))
        } else {
            Ok(Err(String::from_utf8_lossy(&output.stderr).trim().to_string()))
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetPolicyOutput {
    lifecycle_policy_text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeImagesOutput {
    #[serde(default)]
    image_details: Vec<ImageDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageDetail {
    image_digest: String,
    #[serde(default)]
    image_tags: Vec<String>,
    image_pushed_at: serde_json::Value,
    #[serde(default)]
    image_size_in_bytes: u64,
}

/// The CLI prints timestamps as RFC 3339 (v2) or epoch seconds (v1).
fn parse_pushed_at(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            let nanos = ((secs.fract()) * 1e9).round() as u32;
            Utc.timestamp_opt(secs.trunc() as i64, nanos).single()
        }
        _ => None,
    }
}

fn lifecycle_error(repository: &str, message: impl Into<String>) -> PipelineError {
    PipelineError::LifecycleError {
        repository: repository.to_string(),
        message: message.into(),
    }
}

#[async_trait]
impl LifecycleBackend for AwsCliBackend {
    async fn put_policy(&self, repository: &str, document: &str) -> Result<()> {
        let mut cmd = self.command("put-lifecycle-policy", repository);
        cmd.args(["--lifecycle-policy-text", document]);
        match self.run(cmd, repository).await? {
            Ok(_) => Ok(()),
            Err(stderr) => Err(lifecycle_error(
                repository,
                format!("put-lifecycle-policy failed: {}", stderr),
            )),
        }
    }

    async fn get_policy(&self, repository: &str) -> Result<Option<String>> {
        let cmd = self.command("get-lifecycle-policy", repository);
        match self.run(cmd, repository).await? {
            Ok(stdout) => {
                let output: GetPolicyOutput = serde_json::from_slice(&stdout).map_err(|e| {
                    lifecycle_error(repository, format!("unexpected get-lifecycle-policy output: {}", e))
                })?;
                Ok(Some(output.lifecycle_policy_text))
            }
            Err(stderr) if stderr.contains("LifecyclePolicyNotFoundException") => Ok(None),
            Err(stderr) => Err(lifecycle_error(
                repository,
                format!("get-lifecycle-policy failed: {}", stderr),
            )),
        }
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<RemoteImage>> {
        let cmd = self.command("describe-images", repository);
        let stdout = self.run(cmd, repository).await?.map_err(|stderr| {
            lifecycle_error(repository, format!("describe-images failed: {}", stderr))
        })?;
        let output: DescribeImagesOutput = serde_json::from_slice(&stdout).map_err(|e| {
            lifecycle_error(repository, format!("unexpected describe-images output: {}", e))
        })?;

        output
            .image_details
            .into_iter()
            .map(|detail| {
                let pushed_at = parse_pushed_at(&detail.image_pushed_at).ok_or_else(|| {
                    lifecycle_error(
                        repository,
                        format!(
                            "unreadable imagePushedAt {} for {}",
                            detail.image_pushed_at, detail.image_digest
                        ),
                    )
                })?;
                Ok(RemoteImage {
                    digest: detail.image_digest,
                    tags: detail.image_tags,
                    pushed_at,
                    size: detail.image_size_in_bytes,
                })
            })
            .collect()
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    policy: Option<String>,
    images: Vec<RemoteImage>,
    writes: u32,
}

/// Backend holding repositories in memory.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    repositories: parking_lot::Mutex<HashMap<String, RepositoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an image in `repository`.
    pub fn add_image(&self, repository: &str, image: RemoteImage) {
        self.repositories
            .lock()
            .entry(repository.to_string())
            .or_default()
            .images
            .push(image);
    }

    /// Number of policy writes `repository` has received.
    pub fn policy_writes(&self, repository: &str) -> u32 {
        self.repositories
            .lock()
            .get(repository)
            .map_or(0, |state| state.writes)
    }
}

#[async_trait]
impl LifecycleBackend for InMemoryBackend {
    async fn put_policy(&self, repository: &str, document: &str) -> Result<()> {
        let mut repositories = self.repositories.lock();
        let state = repositories.entry(repository.to_string()).or_default();
        state.policy = Some(document.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn get_policy(&self, repository: &str) -> Result<Option<String>> {
        Ok(self
            .repositories
            .lock()
            .get(repository)
            .and_then(|state| state.policy.clone()))
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<RemoteImage>> {
        Ok(self
            .repositories
            .lock()
            .get(repository)
            .map(|state| state.images.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pushed_at_formats() {
        let iso = parse_pushed_at(&serde_json::json!("2024-03-01T12:30:00+01:00")).unwrap();
        assert_eq!(iso.to_rfc3339(), "2024-03-01T11:30:00+00:00");

        let epoch = parse_pushed_at(&serde_json::json!(1709292600.5)).unwrap();
        assert_eq!(epoch.timestamp(), 1709292600);
        assert_eq!(epoch.timestamp_subsec_millis(), 500);

        assert!(parse_pushed_at(&serde_json::json!(null)).is_none());
    }

    #[test]
    fn test_describe_images_output() {
        let json = r#"{"imageDetails": [
            {"registryId": "123456789012", "repositoryName": "myapp",
             "imageDigest": "sha256:aaa", "imageTags": ["v1", "latest"],
             "imageSizeInBytes": 2048, "imagePushedAt": "2024-01-01T00:00:00+00:00"},
            {"imageDigest": "sha256:bbb", "imagePushedAt": 1704067200.0}
        ]}"#;
        let output: DescribeImagesOutput = serde_json::from_str(json).unwrap();
        assert_eq!(output.image_details.len(), 2);
        assert_eq!(output.image_details[0].image_tags, vec!["v1", "latest"]);
        assert!(output.image_details[1].image_tags.is_empty());
        assert_eq!(output.image_details[1].image_size_in_bytes, 0);
    }

    #[test]
    fn test_command_arguments() {
        let backend = AwsCliBackend::new("us-east-1", Some("123456789012".to_string()));
        let cmd = backend.command("get-lifecycle-policy", "myapp");
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "ecr",
                "get-lifecycle-policy",
                "--repository-name",
                "myapp",
                "--region",
                "us-east-1",
                "--output",
                "json",
                "--registry-id",
                "123456789012"
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_cli_is_lifecycle_error() {
        let backend = AwsCliBackend::new("us-east-1", None).with_program("dockyard-test-no-such-aws");
        let err = backend.get_policy("myapp").await.unwrap_err();
        assert!(matches!(err, PipelineError::LifecycleError { ref repository, .. } if repository == "myapp"));
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        let backend = InMemoryBackend::new();
        assert!(backend.get_policy("myapp").await.unwrap().is_none());
        backend.put_policy("myapp", "{}").await.unwrap();
        assert_eq!(backend.get_policy("myapp").await.unwrap().as_deref(), Some("{}"));
        assert_eq!(backend.policy_writes("myapp"), 1);
        assert!(backend.list_images("other").await.unwrap().is_empty());
    }
}
