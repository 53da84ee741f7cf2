//! Image reference parsing.
//!
//! Parses references like `123456789012.dkr.ecr.us-east-1.amazonaws.com/myapp:v1`
//! into structured components. A reference without a registry host is local.

use dockyard_core::error::{PipelineError, Result};

/// Default tag when none is specified.
pub const DEFAULT_TAG: &str = "latest";

/// Registry host used when a local reference is pushed without one (Docker Hub).
pub const DOCKER_HUB_HOST: &str = "docker.io";

const MAX_TAG_LEN: usize = 128;

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, empty for local-only images
    pub registry: String,
    /// Repository path (e.g., "myapp", "alice/myapp")
    pub repository: String,
    /// Tag, never empty
    pub tag: String,
    /// Content digest pin (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Build a validated reference from its parts.
    pub fn new(
        registry: impl Into<String>,
        repository: impl Into<String>,
        tag: impl Into<String>,
    ) -> Result<Self> {
        let reference = Self {
            registry: registry.into(),
            repository: repository.into(),
            tag: tag.into(),
            digest: None,
        };
        reference.validate()?;
        Ok(reference)
    }

    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `myapp` → local myapp:latest
    /// - `alice/myapp:v1` → local alice/myapp:v1
    /// - `localhost:5000/myapp:v1` → registry localhost:5000
    /// - `123456789012.dkr.ecr.us-east-1.amazonaws.com/myapp:latest`
    /// - `ghcr.io/org/app@sha256:abc...` → tag latest, pinned digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(PipelineError::OciImageError(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest)) => {
                if !digest.contains(':') {
                    return Err(PipelineError::OciImageError(format!(
                        "Invalid digest format in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; a colon before it
        // belongs to a registry port.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&name_tag[..split], Some(&name_tag[split + 1..]))
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry(name);

        let parsed = Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
            digest,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check the naming rules for repository and tag.
    pub fn validate(&self) -> Result<()> {
        validate_repository(&self.repository)?;
        validate_tag(&self.tag)?;
        if self.registry.contains('/') || self.registry.chars().any(char::is_whitespace) {
            return Err(PipelineError::OciImageError(format!(
                "Invalid registry host '{}'",
                self.registry
            )));
        }
        Ok(())
    }

    /// Whether the reference names a local-only image.
    pub fn is_local(&self) -> bool {
        self.registry.is_empty()
    }

    /// Registry host to contact; local references resolve to Docker Hub.
    pub fn registry_host(&self) -> &str {
        if self.registry.is_empty() {
            DOCKER_HUB_HOST
        } else {
            &self.registry
        }
    }

    /// Final path component of the repository (`alice/web` → `web`).
    pub fn name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// The same image under a different tag.
    pub fn with_tag(&self, tag: impl Into<String>) -> Result<Self> {
        let retagged = Self {
            tag: tag.into(),
            digest: None,
            ..self.clone()
        };
        retagged.validate()?;
        Ok(retagged)
    }

    /// The reference this image gets in a destination registry.
    ///
    /// The repository keeps its name; a `namespace` (the Docker Hub user)
    /// replaces any existing leading namespace.
    pub fn retarget(&self, registry_host: &str, namespace: Option<&str>) -> Result<Self> {
        let repository = match namespace {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.repository.clone(),
        };
        let target = Self {
            registry: registry_host.to_string(),
            repository,
            tag: self.tag.clone(),
            digest: None,
        };
        target.validate()?;
        Ok(target)
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = String::new();
        if !self.registry.is_empty() {
            s.push_str(&self.registry);
            s.push('/');
        }
        s.push_str(&self.repository);
        s.push(':');
        s.push_str(&self.tag);
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Reference string understood by registry clients (host always present).
    pub fn remote_reference(&self) -> String {
        let mut s = format!("{}/{}:{}", self.registry_host(), self.repository, self.tag);
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into registry host and repository.
///
/// The first component is a host when it contains a dot or a colon, or is
/// `localhost`.
fn split_registry(name: &str) -> (&str, &str) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first, rest);
        }
    }
    ("", name)
}

/// Repository components: `[a-z0-9]+([._-][a-z0-9]+)*`, joined by `/`.
fn validate_repository(repository: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(PipelineError::OciImageError(format!(
            "Invalid repository name '{}': {}",
            repository, why
        )))
    };

    if repository.is_empty() {
        return invalid("empty");
    }

    for component in repository.split('/') {
        if component.is_empty() {
            return invalid("empty path component");
        }
        let bytes = component.as_bytes();
        let is_sep = |b: u8| matches!(b, b'.' | b'_' | b'-');
        for (i, &b) in bytes.iter().enumerate() {
            if b.is_ascii_uppercase() {
                return invalid("must be lowercase");
            }
            if !(b.is_ascii_lowercase() || b.is_ascii_digit() || is_sep(b)) {
                return invalid("only a-z, 0-9, '.', '_', '-' and '/' are allowed");
            }
            if is_sep(b) && (i == 0 || i == bytes.len() - 1) {
                return invalid("components must start and end with a letter or digit");
            }
        }
        // Runs of dashes and a double underscore are the only multi-char separators.
        for pair in bytes.windows(2) {
            if is_sep(pair[0]) && is_sep(pair[1]) && !matches!(pair, [b'-', b'-'] | [b'_', b'_'])
            {
                return invalid("consecutive separators");
            }
        }
    }
    Ok(())
}

/// Tags: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
fn validate_tag(tag: &str) -> Result<()> {
    let invalid = |why: &str| {
        Err(PipelineError::OciImageError(format!(
            "Invalid tag '{}': {}",
            tag, why
        )))
    };

    let first = match tag.chars().next() {
        Some(c) => c,
        None => return invalid("tag must not be empty"),
    };
    if tag.len() > MAX_TAG_LEN {
        return invalid("longer than 128 characters");
    }
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return invalid("must start with a letter, digit or '_'");
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return invalid("only letters, digits, '_', '.' and '-' are allowed");
    }
    Ok(())
}
