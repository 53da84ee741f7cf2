//! Build context access with `.dockerignore` filtering.

use std::path::{Component, Path, PathBuf};

use dockyard_core::error::{PipelineError, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// File name of the ignore file at the root of a build context.
pub const DOCKERIGNORE: &str = ".dockerignore";

/// A file or directory found in the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the context root, `/`-separated
    pub relative: String,
    /// Absolute path on disk
    pub path: PathBuf,
    pub is_dir: bool,
}

/// The directory a build reads its sources from.
pub struct BuildContext {
    root: PathBuf,
    ignore: Gitignore,
}

impl BuildContext {
    /// Open a context directory, loading its `.dockerignore` if present.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(PipelineError::build(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        let mut builder = GitignoreBuilder::new(root);
        let ignore_file = root.join(DOCKERIGNORE);
        if ignore_file.is_file() {
            let content = std::fs::read_to_string(&ignore_file)?;
            for line in content.lines() {
                if let Some(pattern) = anchor_pattern(line) {
                    builder.add_line(None, &pattern).map_err(|e| {
                        PipelineError::build(format!(
                            "Invalid {} pattern '{}': {}",
                            DOCKERIGNORE, line, e
                        ))
                    })?;
                }
            }
        }
        let ignore = builder.build().map_err(|e| {
            PipelineError::build(format!("Invalid {}: {}", DOCKERIGNORE, e))
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether a context-relative path is excluded by `.dockerignore`.
    pub fn is_excluded(&self, relative: &Path, is_dir: bool) -> bool {
        self.ignore
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    /// Resolve a COPY/ADD source to the entries it names.
    ///
    /// Sources may use glob syntax (`*`, `?`, `[...]`) in their final component. Excluded paths
    /// are invisible, and sources may not leave the context.
    pub fn resolve(&self, source: &str) -> Result<Vec<ContextEntry>> {
        let relative = normalize(source).ok_or_else(|| {
            PipelineError::build(format!(
                "COPY source '{}' is outside the build context",
                source
            ))
        })?;

        let file_name = relative.rsplit('/').next().unwrap_or("");
        let matches = if is_pattern(file_name) {
            let parent = relative
                .rsplit_once('/')
                .map(|(parent, _)| parent.to_string())
                .unwrap_or_default();
            let pattern = glob::Pattern::new(file_name).map_err(|e| {
                PipelineError::build(format!("Invalid COPY source pattern '{}': {}", source, e))
            })?;
            let mut matches = Vec::new();
            for entry in self.read_dir(&parent)? {
                let name = entry.relative.rsplit('/').next().unwrap_or("");
                if pattern.matches(name) {
                    matches.push(entry);
                }
            }
            matches
        } else {
            let path = if relative.is_empty() {
                self.root.clone()
            } else {
                self.root.join(&relative)
            };
            let visible = path.exists()
                && (relative.is_empty() || !self.is_excluded(Path::new(&relative), path.is_dir()));
            if visible {
                vec![ContextEntry {
                    is_dir: path.is_dir(),
                    relative,
                    path,
                }]
            } else {
                Vec::new()
            }
        };

        if matches.is_empty() {
            return Err(PipelineError::build(format!(
                "COPY source not found: {} (in context {})",
                source,
                self.root.display()
            )));
        }
        Ok(matches)
    }

    /// Every non-excluded entry below `dir`, sorted by path.
    pub fn walk(&self, dir: &ContextEntry) -> Result<Vec<ContextEntry>> {
        let mut out = Vec::new();
        let mut pending = vec![dir.relative.clone()];
        while let Some(current) = pending.pop() {
            for entry in self.read_dir(&current)? {
                if entry.is_dir {
                    pending.push(entry.relative.clone());
                }
                out.push(entry);
            }
        }
        out.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(out)
    }

    /// Non-excluded direct children of a context-relative directory.
    fn read_dir(&self, relative: &str) -> Result<Vec<ContextEntry>> {
        let dir = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        };
        let read = std::fs::read_dir(&dir).map_err(|e| {
            PipelineError::build(format!("Failed to read directory {}: {}", dir.display(), e))
        })?;

        let mut entries = Vec::new();
        for entry in read {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child = if relative.is_empty() {
                name
            } else {
                format!("{}/{}", relative, name)
            };
            let is_dir = entry.file_type()?.is_dir();
            if self.is_excluded(Path::new(&child), is_dir) {
                continue;
            }
            entries.push(ContextEntry {
                relative: child,
                path: entry.path(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(entries)
    }
}

impl std::fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildContext")
            .field("root", &self.root)
            .field("ignore_rules", &self.ignore.num_ignores())
            .finish()
    }
}

/// `.dockerignore` patterns are relative to the context root, so every
/// pattern is anchored before it is handed to the gitignore matcher.
fn anchor_pattern(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (negate, pattern) = match line.strip_prefix('!') {
        Some(rest) => ("!", rest.trim()),
        None => ("", line),
    };
    let pattern = pattern.trim_start_matches("./").trim_start_matches('/');
    if pattern.is_empty() {
        return None;
    }
    Some(format!("{}/{}", negate, pattern))
}

/// Normalize a source path relative to the context root; `None` if it
/// escapes the root.
fn normalize(source: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(source.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                parts.pop()?;
            }
        }
    }
    Some(parts.join("/"))
}

fn is_pattern(name: &str) -> bool {
    name.contains(['*', '?', '['])
}
