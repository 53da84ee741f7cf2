//! Registry credentials.
//!
//! Credentials live only in memory: they are acquired from a
//! [`CredentialProvider`] when a session first needs them, never written to
//! disk, and their secret is zeroed when dropped.

use std::fmt;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dockyard_core::config::RegistryConfig;
use dockyard_core::error::{PipelineError, PublishFailureReason, Result};
use tokio::process::Command;
use zeroize::Zeroize;

use crate::oci::RegistryAuth;

/// Lifetime of an ECR authorization token.
const ECR_TOKEN_LIFETIME_HOURS: i64 = 12;

/// Variable read for the Docker Hub token when none is configured.
pub const DEFAULT_DOCKER_HUB_TOKEN_ENV: &str = "DOCKERHUB_TOKEN";

/// A password or token. Hidden from `Debug` and zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret(****)")
    }
}

/// Authentication material for one registry.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub secret: Secret,
    /// When the registry stops accepting the secret, if known
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Secret::new(secret),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the credential is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Auth for a registry request.
    pub fn to_auth(&self) -> RegistryAuth {
        RegistryAuth::basic(self.username.clone(), self.secret.revealed())
    }
}

/// Source of credentials for one registry.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Short description for logs (never includes secrets).
    fn describe(&self) -> String;

    /// Obtain a fresh credential; `None` means anonymous access.
    async fn acquire(&self) -> Result<Option<Credential>>;
}

/// Anonymous access.
#[derive(Debug, Default, Clone)]
pub struct AnonymousProvider;

#[async_trait]
impl CredentialProvider for AnonymousProvider {
    fn describe(&self) -> String {
        "anonymous".to_string()
    }

    async fn acquire(&self) -> Result<Option<Credential>> {
        Ok(None)
    }
}

/// Username from configuration, password or token from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvProvider {
    pub registry: String,
    pub username: String,
    pub password_env: String,
}

#[async_trait]
impl CredentialProvider for EnvProvider {
    fn describe(&self) -> String {
        format!("{} via ${}", self.username, self.password_env)
    }

    async fn acquire(&self) -> Result<Option<Credential>> {
        match std::env::var(&self.password_env) {
            Ok(password) if !password.is_empty() => {
                Ok(Some(Credential::new(self.username.clone(), password)))
            }
            _ => Err(PipelineError::RegistryError {
                registry: self.registry.clone(),
                message: format!(
                    "environment variable {} is not set (password or access token for {})",
                    self.password_env, self.username
                ),
            }),
        }
    }
}

/// ECR authorization tokens from `aws ecr get-login-password`.
#[derive(Debug, Clone)]
pub struct EcrProvider {
    pub registry: String,
    pub region: String,
    /// AWS CLI binary
    pub program: String,
}

impl EcrProvider {
    pub fn new(registry: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            region: region.into(),
            program: "aws".to_string(),
        }
    }
}

#[async_trait]
impl CredentialProvider for EcrProvider {
    fn describe(&self) -> String {
        format!("ecr get-login-password ({})", self.region)
    }

    async fn acquire(&self) -> Result<Option<Credential>> {
        let registry_error = |message: String| PipelineError::RegistryError {
            registry: self.registry.clone(),
            message,
        };

        tracing::debug!(region = %self.region, "Requesting ECR authorization token");
        let output = Command::new(&self.program)
            .args(["ecr", "get-login-password", "--region", &self.region])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| registry_error(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(registry_error(format!(
                "aws ecr get-login-password failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut stdout = output.stdout;
        let token = String::from_utf8_lossy(&stdout).trim().to_string();
        stdout.zeroize();
        if token.is_empty() {
            return Err(registry_error(
                "aws ecr get-login-password returned an empty token".to_string(),
            ));
        }

        Ok(Some(Credential::new("AWS", token).expiring_at(
            Utc::now() + Duration::hours(ECR_TOKEN_LIFETIME_HOURS),
        )))
    }
}

/// Why a credential could not be acquired.
///
/// Connectivity problems reaching the token endpoint are `NetworkError`, so
/// they get the retry budget. Anything else means the credential itself is
/// unavailable or rejected.
pub fn acquisition_failure_reason(error: &PipelineError) -> PublishFailureReason {
    const NETWORK_MARKERS: [&str; 9] = [
        "could not connect",
        "connect timeout",
        "read timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "name resolution",
        "name or service not known",
        "network is unreachable",
    ];
    let text = error.to_string().to_lowercase();
    if NETWORK_MARKERS.iter().any(|marker| text.contains(marker)) {
        PublishFailureReason::NetworkError
    } else {
        PublishFailureReason::AuthExpired
    }
}

/// Credential provider for a configured registry.
pub fn provider_for(config: &RegistryConfig) -> Box<dyn CredentialProvider> {
    let host = config.host();
    match config {
        RegistryConfig::DockerHub {
            username,
            password_env,
        } => Box::new(EnvProvider {
            registry: host,
            username: username.clone(),
            password_env: password_env
                .clone()
                .unwrap_or_else(|| DEFAULT_DOCKER_HUB_TOKEN_ENV.to_string()),
        }),
        RegistryConfig::Ecr { region, .. } => Box::new(EcrProvider::new(host, region.clone())),
        RegistryConfig::Generic {
            username: Some(username),
            password_env: Some(password_env),
            ..
        } => Box::new(EnvProvider {
            registry: host,
            username: username.clone(),
            password_env: password_env.clone(),
        }),
        RegistryConfig::Generic { .. } => Box::new(AnonymousProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_hidden_debug() {
        let credential = Credential::new("AWS", "eyJwYXlsb2FkIjoi");
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("eyJwYXlsb2FkIjoi"));
        assert!(debug.contains("Secret(****)"));
        assert_eq!(credential.secret.revealed(), "eyJwYXlsb2FkIjoi");
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let credential = Credential::new("u", "p");
        assert!(!credential.is_expired(now));

        let expired = Credential::new("u", "p").expiring_at(now - Duration::seconds(1));
        assert!(expired.is_expired(now));

        let fresh = Credential::new("u", "p").expiring_at(now + Duration::hours(1));
        assert!(!fresh.is_expired(now));
    }

    #[test]
    fn test_to_auth() {
        let auth = Credential::new("alice", "tok").to_auth();
        assert_eq!(auth, RegistryAuth::basic("alice", "tok"));
    }

    #[tokio::test]
    async fn test_env_provider() {
        let var = "DOCKYARD_TEST_ENV_PROVIDER_TOKEN";
        let provider = EnvProvider {
            registry: "docker.io".to_string(),
            username: "alice".to_string(),
            password_env: var.to_string(),
        };

        std::env::remove_var(var);
        let err = provider.acquire().await.unwrap_err();
        assert!(err.to_string().contains(var));

        std::env::set_var(var, "hub-token");
        let credential = provider.acquire().await.unwrap().unwrap();
        assert_eq!(credential.username, "alice");
        assert_eq!(credential.secret.revealed(), "hub-token");
        std::env::remove_var(var);
    }

    #[tokio::test]
    async fn test_anonymous_provider() {
        assert!(AnonymousProvider.acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ecr_provider_missing_cli() {
        let provider = EcrProvider {
            program: "dockyard-test-no-such-aws".to_string(),
            ..EcrProvider::new("123456789012.dkr.ecr.us-east-1.amazonaws.com", "us-east-1")
        };
        let err = provider.acquire().await.unwrap_err();
        assert!(matches!(err, PipelineError::RegistryError { .. }));
    }

    #[cfg(unix)]
    fn fake_aws(dir: &std::path::Path, stderr: &str, code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("aws");
        std::fs::write(&path, format!("#!/bin/sh\necho '{stderr}' >&2\nexit {code}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ecr_provider_failures_classified() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ecr = |program: String| EcrProvider {
            program,
            ..EcrProvider::new("123456789012.dkr.ecr.us-east-1.amazonaws.com", "us-east-1")
        };

        let offline = ecr(fake_aws(
            tmp.path(),
            "Could not connect to the endpoint URL: \"https://api.ecr.us-east-1.amazonaws.com/\"",
            255,
        ));
        let err = offline.acquire().await.unwrap_err();
        assert_eq!(acquisition_failure_reason(&err), PublishFailureReason::NetworkError);

        let denied_dir = tmp.path().join("denied");
        std::fs::create_dir_all(&denied_dir).unwrap();
        let denied = ecr(fake_aws(
            &denied_dir,
            "An error occurred (UnrecognizedClientException): The security token included in the request is invalid.",
            254,
        ));
        let err = denied.acquire().await.unwrap_err();
        assert_eq!(acquisition_failure_reason(&err), PublishFailureReason::AuthExpired);
    }

    #[test]
    fn test_acquisition_failure_reason() {
        let missing_token = PipelineError::RegistryError {
            registry: "docker.io".to_string(),
            message: "environment variable DOCKERHUB_TOKEN is not set".to_string(),
        };
        assert_eq!(
            acquisition_failure_reason(&missing_token),
            PublishFailureReason::AuthExpired
        );

        let unreachable = PipelineError::RegistryError {
            registry: "ecr".to_string(),
            message: "Connect timeout on endpoint URL".to_string(),
        };
        assert_eq!(
            acquisition_failure_reason(&unreachable),
            PublishFailureReason::NetworkError
        );
    }

    #[test]
    fn test_provider_for_config() {
        let ecr = RegistryConfig::Ecr {
            account_id: "123456789012".to_string(),
            region: "us-east-1".to_string(),
        };
        assert_eq!(provider_for(&ecr).describe(), "ecr get-login-password (us-east-1)");

        let hub = RegistryConfig::DockerHub {
            username: "alice".to_string(),
            password_env: None,
        };
        assert_eq!(provider_for(&hub).describe(), "alice via $DOCKERHUB_TOKEN");

        let open = RegistryConfig::Generic {
            host: "localhost:5000".to_string(),
            username: None,
            password_env: None,
            insecure: true,
        };
        assert_eq!(provider_for(&open).describe(), "anonymous");
    }
}
