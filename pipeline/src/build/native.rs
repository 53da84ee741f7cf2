//! Native build backend.
//!
//! Executes the file-level subset of Dockerfile instructions without a
//! container runtime: the image is assembled from the base image's layers
//! plus one deterministic layer per COPY/ADD. `RUN` needs the docker backend.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dockyard_core::error::{PipelineError, Result};
use dockyard_core::event::{events, PipelineEvent};

use super::context::BuildContext;
use super::dockerfile::{substitute, Dockerfile, Instruction};
use super::layer::{is_archive, read_archive, EntryContent, LayerBlob, LayerBuilder};
use super::{epoch_timestamp, BuildBackend, BuildJob, SOURCE_DATE_EPOCH};
use crate::oci::layout::{
    host_architecture, Descriptor, History, ImageConfig, ImageManifest, LayoutWriter, RootFs,
    RuntimeConfig, MEDIA_TYPE_LAYER_GZIP,
};
use crate::oci::{ImageReference, ImageStore};

/// Builds images from Dockerfiles by layering files from the build context.
pub struct NativeBackend {
    store: Arc<ImageStore>,
}

impl NativeBackend {
    /// Base images are looked up in `store`.
    pub fn new(store: Arc<ImageStore>) -> Self {
        Self { store }
    }

    /// Inherit layers and configuration from a locally stored base image.
    async fn inherit_base(&self, image: &str, state: &mut BuildState) -> Result<()> {
        let reference = ImageReference::parse(image).map_err(|e| {
            PipelineError::build(format!("invalid base image reference '{}': {}", image, e))
        })?;
        let stored = self.store.get(&reference).await.ok_or_else(|| {
            PipelineError::build(format!(
                "invalid base image reference '{}': not present in the local image store",
                image
            ))
        })?;

        let layout = stored.layout()?;
        let config = layout.config()?;

        for descriptor in &layout.manifest().layers {
            state.layers.push(LayerSource::Base {
                descriptor: descriptor.clone(),
                path: layout.blob_path(&descriptor.digest),
            });
        }
        state.architecture = Some(config.architecture.clone()).filter(|a| !a.is_empty());
        state.diff_ids = config.rootfs.diff_ids;
        state.history = config.history;
        state.config = config.config;

        tracing::debug!(
            base = %reference,
            layers = state.layers.len(),
            "Inherited base image"
        );
        Ok(())
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend").finish()
    }
}

#[async_trait]
impl BuildBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn build(&self, job: &BuildJob<'_>, output_dir: &Path) -> Result<()> {
        let dockerfile = Dockerfile::from_file(job.dockerfile)?;
        let context = BuildContext::open(job.context_dir)?;
        let mut state = BuildState::new(job.source_date_epoch);
        let mut consumed: BTreeSet<&str> = BTreeSet::new();
        let mut seen_from = false;

        let total = dockerfile.instructions.len();
        for (idx, instruction) in dockerfile.instructions.iter().enumerate() {
            let step = idx + 1;
            tracing::info!(
                app = job.app,
                step,
                total,
                instruction = instruction.keyword(),
                "Build step"
            );
            job.events.emit(PipelineEvent::with_fields(
                events::BUILD_STEP,
                [
                    ("app", serde_json::json!(job.app)),
                    ("step", serde_json::json!(step)),
                    ("total", serde_json::json!(total)),
                    ("instruction", serde_json::json!(instruction.keyword())),
                ],
            ));

            match instruction {
                Instruction::From { image, .. } => {
                    if seen_from {
                        return Err(PipelineError::build(
                            "multi-stage builds require the docker backend",
                        ));
                    }
                    seen_from = true;
                    let image = substitute(image, &state.vars());
                    if image != "scratch" {
                        self.inherit_base(&image, &mut state).await?;
                    }
                    state.record(format!("FROM {}", image), true);
                }

                Instruction::Arg { name, default } => {
                    let value = match job.build_args.get(name) {
                        Some(value) => {
                            consumed.insert(name.as_str());
                            Some(value.clone())
                        }
                        None => default.as_ref().map(|d| substitute(d, &state.vars())),
                    };
                    if let Some(value) = value {
                        state.args.insert(name.clone(), value);
                    }
                    state.record(format!("ARG {}", name), true);
                }

                Instruction::Copy { src, dst, from } => {
                    if let Some(stage) = from {
                        return Err(PipelineError::build(format!(
                            "COPY --from={} requires the docker backend (multi-stage builds)",
                            stage
                        )));
                    }
                    let layer = copy_layer(&context, src, dst, &state, false)?;
                    state.add_layer(layer, format!("COPY {} {}", src.join(" "), dst));
                }

                Instruction::Add { src, dst } => {
                    let layer = copy_layer(&context, src, dst, &state, true)?;
                    state.add_layer(layer, format!("ADD {} {}", src.join(" "), dst));
                }

                Instruction::Workdir { path } => {
                    let path = substitute(path, &state.vars());
                    let resolved = resolve_path(&state.workdir(), &path);
                    state.config.working_dir = Some(resolved);
                    state.record(format!("WORKDIR {}", path), true);
                }

                Instruction::Env { pairs } => {
                    for (key, value) in pairs {
                        let value = substitute(value, &state.vars());
                        state.set_env(key, &value);
                    }
                    state.record(format!("ENV {}", render_pairs(pairs)), true);
                }

                Instruction::Label { pairs } => {
                    let vars = state.vars();
                    for (key, value) in pairs {
                        state
                            .config
                            .labels
                            .insert(substitute(key, &vars), substitute(value, &vars));
                    }
                    state.record(format!("LABEL {}", render_pairs(pairs)), true);
                }

                Instruction::Expose { ports } => {
                    for port in ports {
                        let port = substitute(port, &state.vars());
                        let port = if port.contains('/') {
                            port
                        } else {
                            format!("{}/tcp", port)
                        };
                        state
                            .config
                            .exposed_ports
                            .insert(port, serde_json::Map::new());
                    }
                    state.record(format!("EXPOSE {}", ports.join(" ")), true);
                }

                Instruction::User { user } => {
                    state.config.user = Some(substitute(user, &state.vars()));
                    state.record(format!("USER {}", user), true);
                }

                Instruction::Entrypoint { exec } => {
                    state.config.entrypoint = Some(exec.clone());
                    // An inherited CMD does not survive a new ENTRYPOINT.
                    if !state.cmd_set {
                        state.config.cmd = None;
                    }
                    state.record(format!("ENTRYPOINT {:?}", exec), true);
                }

                Instruction::Cmd { exec } => {
                    state.config.cmd = Some(exec.clone());
                    state.cmd_set = true;
                    state.record(format!("CMD {:?}", exec), true);
                }

                Instruction::Run { command } => {
                    return Err(PipelineError::build(format!(
                        "step {}/{}: RUN {} requires a container runtime; use the docker backend",
                        step, total, command
                    )));
                }

                Instruction::Ignored { keyword, .. } => {
                    tracing::warn!(
                        step,
                        instruction = keyword.as_str(),
                        "Instruction has no effect in native builds, skipping"
                    );
                }
            }
        }

        for name in job.build_args.keys() {
            if name != SOURCE_DATE_EPOCH && !consumed.contains(name.as_str()) {
                tracing::warn!(arg = %name, "Build argument was not consumed by any ARG");
            }
        }

        state.write_layout(output_dir, job.target)
    }
}

/// A layer of the image being built.
enum LayerSource {
    /// Layer blob inherited from the base image
    Base { descriptor: Descriptor, path: PathBuf },
    New(LayerBlob),
}

/// Mutable state accumulated during the build.
struct BuildState {
    epoch: u64,
    config: RuntimeConfig,
    architecture: Option<String>,
    layers: Vec<LayerSource>,
    diff_ids: Vec<String>,
    history: Vec<History>,
    /// ARG values in scope
    args: BTreeMap<String, String>,
    /// Whether this Dockerfile set CMD (as opposed to inheriting it)
    cmd_set: bool,
}

impl BuildState {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            config: RuntimeConfig::default(),
            architecture: None,
            layers: Vec::new(),
            diff_ids: Vec::new(),
            history: Vec::new(),
            args: BTreeMap::new(),
            cmd_set: false,
        }
    }

    fn workdir(&self) -> String {
        self.config
            .working_dir
            .clone()
            .unwrap_or_else(|| "/".to_string())
    }

    /// Variables visible to substitution: ARGs, overridden by ENV.
    fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.args.clone();
        for entry in &self.config.env {
            if let Some((key, value)) = entry.split_once('=') {
                vars.insert(key.to_string(), value.to_string());
            }
        }
        vars
    }

    fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match self.config.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = entry,
            None => self.config.env.push(entry),
        }
    }

    fn record(&mut self, created_by: String, empty_layer: bool) {
        self.history.push(History {
            created: Some(epoch_timestamp(self.epoch)),
            created_by: Some(created_by),
            empty_layer: empty_layer.then_some(true),
        });
    }

    fn add_layer(&mut self, layer: LayerBlob, created_by: String) {
        self.diff_ids.push(layer.diff_id.clone());
        self.layers.push(LayerSource::New(layer));
        self.record(created_by, false);
    }

    /// Assemble the final OCI image layout.
    fn write_layout(self, output_dir: &Path, target: &ImageReference) -> Result<()> {
        let writer = LayoutWriter::create(output_dir)?;

        let mut descriptors = Vec::with_capacity(self.layers.len());
        for layer in self.layers {
            match layer {
                LayerSource::Base { descriptor, path } => {
                    writer.import_blob(&path)?;
                    descriptors.push(descriptor);
                }
                LayerSource::New(blob) => {
                    let (digest, size) = writer.write_blob(&blob.data)?;
                    descriptors.push(Descriptor::new(MEDIA_TYPE_LAYER_GZIP, digest, size));
                }
            }
        }

        let config = ImageConfig {
            created: Some(epoch_timestamp(self.epoch)),
            architecture: self
                .architecture
                .unwrap_or_else(|| host_architecture().to_string()),
            os: "linux".to_string(),
            config: self.config,
            rootfs: RootFs {
                diff_ids: self.diff_ids,
                ..RootFs::default()
            },
            history: self.history,
        };
        let config_descriptor = writer.write_config(&config)?;
        let manifest = ImageManifest::new(config_descriptor, descriptors);
        let layout = writer.finish(&manifest, Some(&target.tag))?;

        tracing::debug!(
            digest = %layout.manifest_digest(),
            layers = manifest.layers.len(),
            "Wrote image layout"
        );
        Ok(())
    }
}

/// Build the layer for a COPY or ADD instruction.
fn copy_layer(
    context: &BuildContext,
    sources: &[String],
    dst: &str,
    state: &BuildState,
    is_add: bool,
) -> Result<LayerBlob> {
    let vars = state.vars();
    let dst = substitute(dst, &vars);
    let dest = resolve_path(&state.workdir(), &dst);

    let mut matched = Vec::new();
    for source in sources {
        let source = substitute(source, &vars);
        if is_add && (source.starts_with("http://") || source.starts_with("https://")) {
            return Err(PipelineError::build(format!(
                "ADD {}: remote sources are not supported, download them into the context",
                source
            )));
        }
        matched.extend(context.resolve(&source)?);
    }

    let into_dir = dst.ends_with('/') || matched.len() > 1;
    let mut layer = LayerBuilder::new();

    for entry in &matched {
        if entry.is_dir {
            // Directory contents land in the destination, not the directory itself.
            layer.insert(&dest, EntryContent::Dir);
            let prefix_len = if entry.relative.is_empty() {
                0
            } else {
                entry.relative.len() + 1
            };
            for child in context.walk(entry)? {
                let target = join_path(&dest, &child.relative[prefix_len..]);
                if child.is_dir {
                    layer.insert(&target, EntryContent::Dir);
                } else {
                    layer.insert_file(&target, &child.path)?;
                }
            }
        } else if is_add && is_archive(&entry.path) {
            layer.insert(&dest, EntryContent::Dir);
            for (path, content) in read_archive(&entry.path)? {
                layer.insert(&join_path(&dest, &path), content);
            }
        } else {
            let target = if into_dir {
                let name = entry.relative.rsplit('/').next().unwrap_or(&entry.relative);
                join_path(&dest, name)
            } else {
                dest.clone()
            };
            layer.insert_file(&target, &entry.path)?;
        }
    }

    layer.finish(state.epoch)
}

/// Resolve a path against the working directory, normalizing `.` and `..`.
fn resolve_path(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir, path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for component in joined.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn join_path(base: &str, rest: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), rest.trim_start_matches('/'))
}

fn render_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
