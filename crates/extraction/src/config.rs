use std::{
    fs,
    path::{Path, PathBuf},
};

use backbone::{registry, BackboneConfig, BackboneEntry, PreprocessingVariant};
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{
    error::{ExtractionError, Result},
    logging::LoggingConfig,
    weights::DEFAULT_WEIGHT_PREFIX,
};

pub const CHECKPOINT_FILENAME: &str = "checkpoint.pth";
pub const REQUEUE_FILENAME: &str = "requeue.json";
const FILE_URL_SCHEME: &str = "file://";

/// On-disk configuration: `[trainer]`, `[cluster]` and an optional `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub trainer: TrainerConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExtractionConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: ExtractionConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ExtractionError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_path(path)
    }

    /// Reports every problem at once. An unknown architecture is reported on
    /// its own so callers can match on it.
    pub fn validate(&self) -> Result<()> {
        self.trainer.architecture_entry()?;

        let mut errors = self.trainer.validation_errors();
        errors.extend(self.cluster.validation_errors());
        errors.extend(self.logging.validation_errors());

        if !errors.is_empty() {
            return Err(ExtractionError::validation(errors));
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.trainer.apply_base_path(base);
    }

    /// Fills rank and job identity from the scheduler environment (`SLURM_*`).
    pub fn apply_cluster_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read_usize = |name: &str| -> Result<Option<usize>> {
            match lookup(name) {
                Some(raw) => raw.trim().parse::<usize>().map(Some).map_err(|err| {
                    ExtractionError::validation(vec![format!(
                        "environment variable {name}='{raw}' is not a valid integer: {err}"
                    )])
                }),
                None => Ok(None),
            }
        };

        if let Some(local_rank) = read_usize("SLURM_LOCALID")? {
            self.trainer.local_rank = local_rank;
        }
        if let Some(global_rank) = read_usize("SLURM_PROCID")? {
            self.trainer.global_rank = global_rank;
        }
        if let Some(num_tasks) = read_usize("SLURM_NTASKS")? {
            self.trainer.num_tasks = num_tasks;
        }
        if let Some(job_id) = lookup("SLURM_JOB_ID") {
            self.trainer.job_id = job_id.trim().to_string();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub architecture: String,
    pub dataset_path: PathBuf,
    pub weight_path: PathBuf,
    pub save_folder: PathBuf,
    /// Output prefix; file names are appended verbatim, e.g. `"out/run1_"`.
    pub save_path: String,
    pub job_id: String,
    pub batch_per_gpu: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub input_size: usize,
    #[serde(default)]
    pub local_rank: usize,
    #[serde(default)]
    pub global_rank: usize,
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_weight_prefix")]
    pub weight_prefix: String,
    #[serde(default = "default_shard_by_rank")]
    pub shard_by_rank: bool,
    /// Overrides the registry's preprocessing for the architecture.
    #[serde(default)]
    pub preprocessing: Option<PreprocessingVariant>,
    #[serde(default)]
    pub model: ModelOverrides,
}

impl TrainerConfig {
    pub fn architecture_entry(&self) -> Result<&'static BackboneEntry> {
        if let Some(reason) = registry::unavailable_reason(&self.architecture) {
            return Err(ExtractionError::UnavailableArchitecture {
                name: self.architecture.clone(),
                reason: reason.to_string(),
            });
        }
        registry::lookup(&self.architecture).ok_or_else(|| ExtractionError::UnknownArchitecture {
            name: self.architecture.clone(),
            known: registry::names().join(", "),
        })
    }

    pub fn preprocessing(&self) -> Result<PreprocessingVariant> {
        match self.preprocessing {
            Some(variant) => Ok(variant),
            None => Ok(self.architecture_entry()?.preprocessing),
        }
    }

    /// `<save_folder>/<job_id>`
    pub fn job_dir(&self) -> PathBuf {
        self.save_folder.join(&self.job_id)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.job_dir().join(CHECKPOINT_FILENAME)
    }

    pub fn epoch_checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.job_dir().join(format!("checkpoint_{epoch}.pth"))
    }

    /// `requeue.json` for a single task, `requeue_rank<r>.json` per rank otherwise.
    pub fn requeue_descriptor_path(&self) -> PathBuf {
        if self.num_tasks > 1 {
            self.job_dir()
                .join(format!("requeue_rank{}.json", self.global_rank))
        } else {
            self.job_dir().join(REQUEUE_FILENAME)
        }
    }

    pub fn is_primary(&self) -> bool {
        self.global_rank == 0
    }

    /// Registry layout for the architecture with the `[trainer.model]` overrides applied.
    pub fn resolve_backbone_config(&self, device: &Device) -> Result<BackboneConfig> {
        let entry = self.architecture_entry()?;
        let mut config = entry.config(device);
        self.model.apply(&mut config);
        config.validate().map_err(|err| {
            ExtractionError::initialization(format!(
                "invalid model layout for {}: {}",
                self.architecture, err
            ))
        })?;
        Ok(config)
    }

    /// Checks that the inputs named by the config exist before anything heavy starts.
    pub fn ensure_prerequisites(&self) -> Result<()> {
        let mut missing = Vec::new();
        if !self.dataset_path.is_dir() {
            missing.push(format!("trainer.dataset_path ({})", self.dataset_path.display()));
        }
        if !self.weight_path.is_file() {
            missing.push(format!("trainer.weight_path ({})", self.weight_path.display()));
        }
        if !missing.is_empty() {
            return Err(ExtractionError::initialization(format!(
                "missing required artifacts: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.batch_per_gpu == 0 {
            errors.push("trainer.batch_per_gpu must be greater than 0".to_string());
        }
        if self.workers == 0 {
            errors.push("trainer.workers must be greater than 0".to_string());
        }
        if self.input_size == 0 {
            errors.push("trainer.input_size must be greater than 0".to_string());
        }
        if self.num_tasks == 0 {
            errors.push("trainer.num_tasks must be greater than 0".to_string());
        } else if self.global_rank >= self.num_tasks {
            errors.push(format!(
                "trainer.global_rank {} must be less than trainer.num_tasks {}",
                self.global_rank, self.num_tasks
            ));
        }
        if self.job_id.trim().is_empty() {
            errors.push("trainer.job_id must not be empty".to_string());
        }
        if self.save_path.is_empty() {
            errors.push("trainer.save_path must not be empty".to_string());
        }
        if self.save_folder.as_os_str().is_empty() {
            errors.push("trainer.save_folder must not be empty".to_string());
        }
        if let Some(layers) = self.model.layers {
            if layers.iter().any(|&blocks| blocks == 0) {
                errors.push("trainer.model.layers entries must be greater than 0".to_string());
            }
        }
        for (label, value) in [
            ("trainer.model.num_classes", self.model.num_classes),
            ("trainer.model.stem_width", self.model.stem_width),
            ("trainer.model.groups", self.model.groups),
            ("trainer.model.width_per_group", self.model.width_per_group),
        ] {
            if value == Some(0) {
                errors.push(format!("{label} must be greater than 0"));
            }
        }

        errors
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.dataset_path, base);
        absolutize_in_place(&mut self.weight_path, base);
        absolutize_in_place(&mut self.save_folder, base);
        if Path::new(&self.save_path).is_relative() {
            self.save_path = format!("{}{}", ensure_trailing_separator(base), self.save_path);
        }
    }
}

/// Reduced-size or re-headed variants of a registry layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub num_classes: Option<usize>,
    #[serde(default)]
    pub layers: Option<[usize; 4]>,
    #[serde(default)]
    pub stem_width: Option<usize>,
    #[serde(default)]
    pub groups: Option<usize>,
    #[serde(default)]
    pub width_per_group: Option<usize>,
}

impl ModelOverrides {
    fn apply(&self, config: &mut BackboneConfig) {
        if let Some(num_classes) = self.num_classes {
            config.num_classes = num_classes;
        }
        if let Some(layers) = self.layers {
            config.layers = layers;
        }
        if let Some(stem_width) = self.stem_width {
            config.stem_width = stem_width;
        }
        if let Some(groups) = self.groups {
            config.groups = groups;
        }
        if let Some(width_per_group) = self.width_per_group {
            config.width_per_group = width_per_group;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistBackend {
    /// CUDA device selected by `local_rank`.
    Nccl,
    /// CPU execution.
    Gloo,
}

impl Default for DistBackend {
    fn default() -> Self {
        DistBackend::Nccl
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub dist_backend: DistBackend,
    /// Rendezvous endpoint, `file://<path>`.
    pub dist_url: String,
    #[serde(default = "default_rendezvous_timeout_secs")]
    pub rendezvous_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ClusterConfig {
    /// Filesystem path of the rendezvous endpoint.
    pub fn rendezvous_path(&self) -> Result<PathBuf> {
        self.dist_url
            .strip_prefix(FILE_URL_SCHEME)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| {
                ExtractionError::validation(vec![format!(
                    "cluster.dist_url must be a file:// URL (got '{}')",
                    self.dist_url
                )])
            })
    }

    fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        match self.dist_url.strip_prefix(FILE_URL_SCHEME) {
            Some(path) if !path.is_empty() => {}
            Some(_) => errors.push("cluster.dist_url must name a file after file://".to_string()),
            None => errors.push(format!(
                "cluster.dist_url must start with file:// (got '{}')",
                self.dist_url
            )),
        }
        if self.rendezvous_timeout_secs == 0 {
            errors.push("cluster.rendezvous_timeout_secs must be greater than 0".to_string());
        }
        if self.poll_interval_ms == 0 {
            errors.push("cluster.poll_interval_ms must be greater than 0".to_string());
        }
        errors
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn ensure_trailing_separator(base: &Path) -> String {
    let mut base = base.display().to_string();
    if !base.is_empty() && !base.ends_with(std::path::MAIN_SEPARATOR) {
        base.push(std::path::MAIN_SEPARATOR);
    }
    base
}

fn default_workers() -> usize {
    1
}

fn default_num_tasks() -> usize {
    1
}

fn default_weight_prefix() -> String {
    DEFAULT_WEIGHT_PREFIX.to_string()
}

fn default_shard_by_rank() -> bool {
    true
}

fn default_rendezvous_timeout_secs() -> u64 {
    1_800
}

fn default_poll_interval_ms() -> u64 {
    50
}
