//! Deterministic layer creation.
//!
//! Layers are gzip-compressed tarballs whose bytes depend only on the file
//! contents and paths: entries are sorted, owners are root, modes are
//! normalized and every timestamp is the build's source date epoch.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use dockyard_core::error::{PipelineError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::oci::layout::sha256_digest;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

/// Content of one layer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryContent {
    Dir,
    /// File copied from disk; `executable` selects mode 0755
    File { source: PathBuf, executable: bool },
    /// In-memory file (e.g. extracted from an archive)
    Bytes { data: Vec<u8>, executable: bool },
    Symlink { target: String },
}

/// A finished layer blob.
#[derive(Debug, Clone)]
pub struct LayerBlob {
    /// Compressed tarball
    pub data: Vec<u8>,
    /// Digest of the compressed tarball
    pub digest: String,
    /// Digest of the uncompressed tarball (the config `diff_id`)
    pub diff_id: String,
}

impl LayerBlob {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Collects entries keyed by in-image path; later insertions win.
#[derive(Debug, Default)]
pub struct LayerBuilder {
    entries: BTreeMap<String, EntryContent>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry at `path` (absolute or relative to `/`), creating its
    /// parent directories.
    pub fn insert(&mut self, path: &str, content: EntryContent) {
        let path = clean_path(path);
        if path.is_empty() {
            return;
        }
        for (idx, _) in path.match_indices('/') {
            self.entries
                .entry(path[..idx].to_string())
                .or_insert(EntryContent::Dir);
        }
        self.entries.insert(path, content);
    }

    /// Add a file from disk, taking the executable bit from its permissions.
    pub fn insert_file(&mut self, path: &str, source: &Path) -> Result<()> {
        let metadata = std::fs::symlink_metadata(source)?;
        if metadata.file_type().is_symlink() {
            let target = std::fs::read_link(source)?;
            self.insert(
                path,
                EntryContent::Symlink {
                    target: target.to_string_lossy().into_owned(),
                },
            );
        } else {
            self.insert(
                path,
                EntryContent::File {
                    source: source.to_path_buf(),
                    executable: is_executable(&metadata),
                },
            );
        }
        Ok(())
    }

    /// Write the tarball and compress it.
    pub fn finish(self, epoch: u64) -> Result<LayerBlob> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.mode(tar::HeaderMode::Deterministic);

        for (path, content) in &self.entries {
            append_entry(&mut builder, path, content, epoch).map_err(|e| {
                PipelineError::build(format!("Failed to add {} to layer: {}", path, e))
            })?;
        }

        let tar_data = builder
            .into_inner()
            .map_err(|e| PipelineError::build(format!("Failed to finalize layer: {}", e)))?;
        let diff_id = sha256_digest(&tar_data);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &tar_data)?;
        let data = encoder
            .finish()
            .map_err(|e| PipelineError::build(format!("Failed to compress layer: {}", e)))?;

        Ok(LayerBlob {
            digest: sha256_digest(&data),
            diff_id,
            data,
        })
    }
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &EntryContent,
    epoch: u64,
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(epoch);

    match content {
        EntryContent::Dir => {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(DIR_MODE);
            header.set_size(0);
            builder.append_data(&mut header, path, std::io::empty())
        }
        EntryContent::File { source, executable } => {
            let data = std::fs::read(source)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if *executable { EXEC_MODE } else { FILE_MODE });
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, data.as_slice())
        }
        EntryContent::Bytes { data, executable } => {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(if *executable { EXEC_MODE } else { FILE_MODE });
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, data.as_slice())
        }
        EntryContent::Symlink { target } => {
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, path, target)
        }
    }
}

/// Read the regular files, directories and symlinks of a tar (optionally
/// gzip-compressed) archive, for `ADD` of local archives.
pub fn read_archive(path: &Path) -> Result<Vec<(String, EntryContent)>> {
    let raw = std::fs::read(path)?;
    let reader: Box<dyn Read + '_> = if raw.starts_with(&[0x1f, 0x8b]) {
        Box::new(flate2::read::GzDecoder::new(raw.as_slice()))
    } else {
        Box::new(raw.as_slice())
    };

    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    let archive_error = |e: std::io::Error| {
        PipelineError::build(format!("Failed to read archive {}: {}", path.display(), e))
    };

    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        let entry_path = entry
            .path()
            .map_err(archive_error)?
            .to_string_lossy()
            .into_owned();
        let mode = entry.header().mode().unwrap_or(FILE_MODE);
        let content = match entry.header().entry_type() {
            tar::EntryType::Directory => EntryContent::Dir,
            tar::EntryType::Symlink => EntryContent::Symlink {
                target: entry
                    .link_name()
                    .map_err(archive_error)?
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },
            tar::EntryType::Regular | tar::EntryType::Continuous => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(archive_error)?;
                EntryContent::Bytes {
                    data,
                    executable: mode & 0o111 != 0,
                }
            }
            other => {
                tracing::warn!(path = %entry_path, kind = ?other, "Skipping archive entry");
                continue;
            }
        };
        entries.push((entry_path, content));
    }

    Ok(entries)
}

/// Whether a file name looks like a tar archive `ADD` would unpack.
pub fn is_archive(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Strip leading `/`, `.` components and trailing slashes.
fn clean_path(path: &str) -> String {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}
