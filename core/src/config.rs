//! Pipeline configuration (`dockyard.yaml`).
//!
//! Declares the applications to build, the registries to publish to and the
//! retry budget for pushes. Relative paths resolve against the directory
//! holding the configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "dockyard.yaml";

/// Environment variable overriding the local image store location.
pub const STORE_DIR_ENV: &str = "DOCKYARD_STORE_DIR";

/// Top-level pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Local image store directory (default: ~/.dockyard/images)
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Push retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Destination registries by name
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryConfig>,

    /// Applications by name
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    base_dir: PathBuf,
}

/// Retry budget for registry requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per push on network errors (first try included)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_delay_ms: u64,

    /// Backoff multiplier applied after each retry
    pub multiplier: u32,

    /// Ceiling for a single backoff delay
    pub max_delay_ms: u64,

    /// Upper bound for a single registry request
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 10_000,
            request_timeout_secs: 300,
        }
    }
}

/// A destination registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RegistryConfig {
    /// Docker Hub; images are pushed under the user's namespace
    DockerHub {
        username: String,
        /// Variable holding the password or access token
        #[serde(default)]
        password_env: Option<String>,
    },

    /// AWS Elastic Container Registry; tokens come from the `aws` CLI
    Ecr { account_id: String, region: String },

    /// Any other OCI distribution registry
    Generic {
        host: String,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password_env: Option<String>,
        /// Use plain HTTP
        #[serde(default)]
        insecure: bool,
    },
}

impl RegistryConfig {
    /// Registry hostname images are pushed to.
    pub fn host(&self) -> String {
        match self {
            Self::DockerHub { .. } => "docker.io".to_string(),
            Self::Ecr { account_id, region } => {
                format!("{}.dkr.ecr.{}.amazonaws.com", account_id, region)
            }
            Self::Generic { host, .. } => host.clone(),
        }
    }

    /// Repository namespace prefix imposed by the registry, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::DockerHub { username, .. } => Some(username),
            _ => None,
        }
    }

    /// Whether the registry is reached over plain HTTP.
    pub fn insecure(&self) -> bool {
        matches!(self, Self::Generic { insecure: true, .. })
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::DockerHub { username, .. } => {
                if username.trim().is_empty() {
                    return Err(PipelineError::ConfigError(format!(
                        "registries.{}.username must not be empty",
                        name
                    )));
                }
            }
            Self::Ecr { account_id, region } => {
                if account_id.len() != 12 || !account_id.chars().all(|c| c.is_ascii_digit()) {
                    return Err(PipelineError::ConfigError(format!(
                        "registries.{}.account_id must be a 12-digit AWS account id, got '{}'",
                        name, account_id
                    )));
                }
                if region.trim().is_empty() {
                    return Err(PipelineError::ConfigError(format!(
                        "registries.{}.region must not be empty",
                        name
                    )));
                }
            }
            Self::Generic { host, .. } => {
                if host.trim().is_empty() || host.contains('/') {
                    return Err(PipelineError::ConfigError(format!(
                        "registries.{}.host must be a bare hostname[:port], got '{}'",
                        name, host
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Language runtime of an application, used to check its dependency manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppRuntime {
    Node,
    Java,
    Go,
    Generic,
}

impl AppRuntime {
    /// Dependency manifests, any one of which must exist in the build context.
    pub fn manifests(&self) -> &'static [&'static str] {
        match self {
            Self::Node => &["package.json"],
            Self::Java => &["pom.xml", "build.gradle", "build.gradle.kts"],
            Self::Go => &["go.mod"],
            Self::Generic => &[],
        }
    }

    /// Guess the runtime from the files present in a build context.
    pub fn detect(context_dir: &Path) -> Self {
        [Self::Node, Self::Java, Self::Go]
            .into_iter()
            .find(|runtime| {
                runtime
                    .manifests()
                    .iter()
                    .any(|m| context_dir.join(m).is_file())
            })
            .unwrap_or(Self::Generic)
    }
}

impl std::fmt::Display for AppRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Java => write!(f, "java"),
            Self::Go => write!(f, "go"),
            Self::Generic => write!(f, "generic"),
        }
    }
}

/// Which backend executes a build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildBackendKind {
    /// In-process, filesystem-only builder with reproducible output
    #[default]
    Native,
    /// `docker buildx` with OCI output
    Docker,
}

/// An application to build and publish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Build context directory
    pub context: PathBuf,

    /// Dockerfile path, relative to the context
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,

    /// Local repository name (default: the app name)
    #[serde(default)]
    pub image: Option<String>,

    /// Tag applied to the built image
    #[serde(default = "default_tag")]
    pub tag: String,

    /// Declared runtime; auto-detected when absent
    #[serde(default)]
    pub runtime: Option<AppRuntime>,

    #[serde(default)]
    pub backend: BuildBackendKind,

    #[serde(default)]
    pub build_args: BTreeMap<String, String>,

    /// Registries `publish` targets when none are given on the command line
    #[serde(default)]
    pub registries: Vec<String>,
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_tag() -> String {
    "latest".to_string()
}

impl PipelineConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::ConfigError(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&data, &base_dir)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml(data: &str, base_dir: &Path) -> Result<Self> {
        let mut config: PipelineConfig = serde_yaml::from_str(data).map_err(|e| {
            PipelineError::ConfigError(format!("Invalid pipeline config: {}", e))
        })?;
        config.base_dir = base_dir.to_path_buf();
        config.validate()?;
        tracing::debug!(
            apps = config.apps.len(),
            registries = config.registries.len(),
            "Pipeline config loaded"
        );
        Ok(config)
    }

    /// Check cross-references and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(PipelineError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier == 0 {
            return Err(PipelineError::ConfigError(
                "retry.multiplier must be at least 1".to_string(),
            ));
        }
        if self.retry.request_timeout_secs == 0 {
            return Err(PipelineError::ConfigError(
                "retry.request_timeout_secs must be at least 1".to_string(),
            ));
        }

        for (name, registry) in &self.registries {
            registry.validate(name)?;
        }

        for (name, app) in &self.apps {
            if app.tag.trim().is_empty() {
                return Err(PipelineError::ConfigError(format!(
                    "apps.{}.tag must not be empty",
                    name
                )));
            }
            for registry in &app.registries {
                if !self.registries.contains_key(registry) {
                    return Err(PipelineError::ConfigError(format!(
                        "apps.{}.registries references unknown registry '{}'",
                        name, registry
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up an application by name.
    pub fn app(&self, name: &str) -> Result<&AppConfig> {
        self.apps.get(name).ok_or_else(|| {
            PipelineError::ConfigError(format!("Unknown app '{}'", name))
        })
    }

    /// Look up a registry by name.
    pub fn registry(&self, name: &str) -> Result<&RegistryConfig> {
        self.registries.get(name).ok_or_else(|| {
            PipelineError::ConfigError(format!("Unknown registry '{}'", name))
        })
    }

    /// Absolute-ish build context directory of an app.
    pub fn context_dir(&self, app: &AppConfig) -> PathBuf {
        self.resolve(&app.context)
    }

    /// Dockerfile location of an app.
    pub fn dockerfile_path(&self, app: &AppConfig) -> PathBuf {
        if app.dockerfile.is_absolute() {
            app.dockerfile.clone()
        } else {
            self.context_dir(app).join(&app.dockerfile)
        }
    }

    /// Local image store directory.
    ///
    /// `DOCKYARD_STORE_DIR` wins over the file, which wins over `~/.dockyard/images`.
    pub fn store_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var(STORE_DIR_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        match &self.store_dir {
            Some(dir) => self.resolve(dir),
            None => dirs::home_dir()
                .map(|h| h.join(".dockyard"))
                .unwrap_or_else(|| PathBuf::from(".dockyard"))
                .join("images"),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}
