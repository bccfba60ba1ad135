//! Orchestration of one extraction job.
//!
//! [`Trainer`] is configuration only and can be serialised into a requeue
//! descriptor. [`Trainer::launch`] consumes it and returns a
//! [`TrainerRuntime`] that owns the device, the process group, the loader and
//! the checkpoint state. [`TrainerRuntime::checkpoint`] drops those resources
//! again and hands back a fresh `Trainer`.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use backbone::PreprocessingVariant;
use candle_core::Device;
use imagefolder::{shard_indices, BatchLoader, Dataset, EvalTransform, ImageFolder, Normalization};
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::CheckpointState,
    config::{ClusterConfig, ExtractionConfig, TrainerConfig},
    distributed::{self, DistributedBackbone, ProcessContext, ProcessGroup},
    error::{ExtractionError, Result},
    inference::{self, LoopOutcome, OutputPaths, COMPLETION_VALUE},
    logging::{self, LoggingConfig, LoggingSettings},
    weights,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Unstarted,
    GroupJoined,
    StateReady,
    Running,
    Done,
    Checkpointed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Completed(f64),
    /// The stop flag was raised between batches; no outputs were written.
    Interrupted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trainer {
    #[serde(rename = "trainer")]
    train_cfg: TrainerConfig,
    #[serde(rename = "cluster")]
    cluster_cfg: ClusterConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

impl Trainer {
    pub fn new(train_cfg: TrainerConfig, cluster_cfg: ClusterConfig) -> Self {
        Self {
            train_cfg,
            cluster_cfg,
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_config(config: ExtractionConfig) -> Self {
        Self {
            train_cfg: config.trainer,
            cluster_cfg: config.cluster,
            logging: config.logging,
        }
    }

    pub fn into_config(self) -> ExtractionConfig {
        ExtractionConfig {
            trainer: self.train_cfg,
            cluster: self.cluster_cfg,
            logging: self.logging,
        }
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    pub fn train_cfg(&self) -> &TrainerConfig {
        &self.train_cfg
    }

    pub fn cluster_cfg(&self) -> &ClusterConfig {
        &self.cluster_cfg
    }

    pub fn phase(&self) -> TrainerPhase {
        TrainerPhase::Unstarted
    }

    /// Binds the device, joins the process group and builds the state.
    pub fn launch(self) -> Result<TrainerRuntime> {
        self.launch_with_shutdown(|| false)
    }

    /// Like [`Trainer::launch`], but gives up the rendezvous wait once
    /// `should_stop` returns true.
    pub fn launch_with_shutdown<S>(self, should_stop: S) -> Result<TrainerRuntime>
    where
        S: Fn() -> bool,
    {
        let Trainer {
            train_cfg,
            cluster_cfg,
            logging,
        } = self;

        let context = distributed::init_process(
            train_cfg.seed,
            train_cfg.local_rank,
            cluster_cfg.dist_backend,
        )?;
        let group = ProcessGroup::join(
            &cluster_cfg,
            train_cfg.global_rank,
            train_cfg.num_tasks,
            &should_stop,
        )?;
        log_phase(TrainerPhase::GroupJoined, &train_cfg);

        let (loader, state) = init_state(&train_cfg, &context.device)?;
        log_phase(TrainerPhase::StateReady, &train_cfg);

        Ok(TrainerRuntime {
            train_cfg,
            cluster_cfg,
            logging,
            context,
            group,
            loader,
            state,
            phase: TrainerPhase::StateReady,
        })
    }

    /// Launches and runs to completion. `None` means the run did not complete.
    pub fn call(self) -> Result<Option<f64>> {
        let mut runtime = self.launch()?;
        match runtime.run(|| false)? {
            RunOutcome::Completed(value) => Ok(Some(value)),
            RunOutcome::Interrupted => Ok(None),
        }
    }

    /// Writes the requeue descriptor as JSON, replacing any previous one atomically.
    pub fn write_descriptor(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(|err| {
            ExtractionError::runtime(format!("failed to serialize requeue descriptor: {err}"))
        })?;
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = Path::new(&tmp_name);
        {
            let mut file = File::create(tmp)?;
            file.write_all(&data)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Writes the descriptor to this rank's own path under the job directory.
    pub fn write_requeue_descriptor(&self) -> Result<PathBuf> {
        let path = self.train_cfg.requeue_descriptor_path();
        self.write_descriptor(&path)?;
        Ok(path)
    }

    pub fn read_descriptor(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|err| {
            ExtractionError::initialization(format!(
                "failed to open requeue descriptor {}: {err}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_reader(file)?)
    }
}

/// Live resources of a launched [`Trainer`].
#[derive(Debug)]
pub struct TrainerRuntime {
    train_cfg: TrainerConfig,
    cluster_cfg: ClusterConfig,
    logging: LoggingConfig,
    context: ProcessContext,
    group: ProcessGroup,
    loader: BatchLoader,
    state: CheckpointState,
    phase: TrainerPhase,
}

impl TrainerRuntime {
    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn epoch(&self) -> usize {
        self.state.epoch
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn device(&self) -> &Device {
        &self.context.device
    }

    pub fn output_paths(&self) -> OutputPaths {
        let mut prefix = self.train_cfg.save_path.clone();
        if self.train_cfg.shard_by_rank && self.group.world_size() > 1 {
            prefix.push_str(&format!("rank{}_", self.group.rank()));
        }
        OutputPaths::new(&prefix, &self.train_cfg.architecture)
    }

    /// Extracts the whole shard and writes the outputs.
    pub fn run<S>(&mut self, should_stop: S) -> Result<RunOutcome>
    where
        S: Fn() -> bool,
    {
        if self.phase != TrainerPhase::StateReady {
            return Err(ExtractionError::runtime(format!(
                "run requires a freshly launched trainer (phase {:?})",
                self.phase
            )));
        }
        self.phase = TrainerPhase::Running;
        log_phase(self.phase, &self.train_cfg);

        let settings = LoggingSettings::from_config(&self.logging, self.group.is_primary());
        let progress = logging::progress_bar(self.loader.len(), &settings);
        let batches = self.loader.iter()?;
        let outcome = inference::run_inference(
            &mut self.state.model,
            batches,
            self.loader.len(),
            &progress,
            should_stop,
        )?;

        let outputs = match outcome {
            LoopOutcome::Finished(outputs) => outputs,
            LoopOutcome::Interrupted { processed } => {
                tracing::warn!(
                    processed,
                    total = self.loader.len(),
                    "extraction interrupted between batches"
                );
                return Ok(RunOutcome::Interrupted);
            }
        };

        let paths = self.output_paths();
        outputs.write(&paths)?;
        tracing::info!(
            rank = self.group.rank(),
            rows = outputs.rows(),
            embeddings = %paths.embeddings.display(),
            "extraction finished"
        );

        self.state.epoch += 1;
        self.phase = TrainerPhase::Done;
        log_phase(self.phase, &self.train_cfg);
        Ok(RunOutcome::Completed(COMPLETION_VALUE))
    }

    /// Persists the state and returns a config-only trainer for requeue.
    ///
    /// Parameters are identical on every rank, so only the primary rank
    /// writes checkpoints and removes the endpoint.
    pub fn checkpoint(self, rm_init: bool) -> Result<Trainer> {
        if self.group.is_primary() {
            let train_cfg = &self.train_cfg;
            self.state.save(&train_cfg.checkpoint_path())?;
            self.state
                .save(&train_cfg.epoch_checkpoint_path(self.state.epoch))?;
            if rm_init {
                distributed::remove_endpoint(&self.cluster_cfg)?;
            }
        }
        log_phase(TrainerPhase::Checkpointed, &self.train_cfg);

        Ok(Trainer {
            train_cfg: self.train_cfg,
            cluster_cfg: self.cluster_cfg,
            logging: self.logging,
        })
    }

    /// Checkpoints and writes this rank's requeue descriptor. Returns the
    /// descriptor path.
    pub fn requeue(self, rm_init: bool) -> Result<PathBuf> {
        let trainer = self.checkpoint(rm_init)?;
        let path = trainer.write_requeue_descriptor()?;
        tracing::info!(descriptor = %path.display(), "checkpointed for requeue");
        Ok(path)
    }
}

/// Builds the loader over this rank's shard and the frozen, replicated model.
/// An existing `checkpoint.pth` for the job is loaded over the fresh state.
pub fn init_state(
    train_cfg: &TrainerConfig,
    device: &Device,
) -> Result<(BatchLoader, CheckpointState)> {
    train_cfg.ensure_prerequisites()?;
    let entry = train_cfg.architecture_entry()?;
    tracing::info!(
        input_size = train_cfg.input_size,
        model = %train_cfg.architecture,
        "create data loaders"
    );

    let normalization = match train_cfg.preprocessing()? {
        PreprocessingVariant::Imagenet => Normalization::IMAGENET,
        PreprocessingVariant::Inception => Normalization::INCEPTION,
    };
    let transform = EvalTransform::new(train_cfg.input_size, normalization)?;
    let dataset = ImageFolder::new(&train_cfg.dataset_path, transform)?;
    tracing::info!(
        classes = dataset.classes().len(),
        samples = dataset.len(),
        root = %dataset.root().display(),
        "dataset indexed"
    );

    let indices = if train_cfg.shard_by_rank {
        shard_indices(dataset.len(), train_cfg.global_rank, train_cfg.num_tasks)
    } else {
        (0..dataset.len()).collect()
    };
    let dataset: Arc<dyn Dataset> = Arc::new(dataset);
    let loader = BatchLoader::new(
        dataset,
        indices,
        train_cfg.batch_per_gpu,
        train_cfg.workers.saturating_sub(1),
    )?;

    tracing::info!("create distributed model");
    let backbone_cfg = train_cfg.resolve_backbone_config(&Device::Cpu)?;
    let mut model = entry.build(backbone_cfg).map_err(|err| {
        ExtractionError::initialization(format!(
            "failed to build {}: {}",
            train_cfg.architecture, err
        ))
    })?;
    weights::load_pretrained(&mut model, &train_cfg.weight_path, &train_cfg.weight_prefix)?;
    model.freeze()?;
    model.to_device(device)?;
    let model = DistributedBackbone::wrap(model, train_cfg.global_rank, train_cfg.num_tasks)?;

    let mut state = CheckpointState::new(model);
    let checkpoint_path = train_cfg.checkpoint_path();
    if checkpoint_path.is_file() {
        tracing::info!(path = %checkpoint_path.display(), "load existing checkpoint");
        state = CheckpointState::load(&checkpoint_path, state)?;
    }
    Ok((loader, state))
}

fn log_phase(phase: TrainerPhase, train_cfg: &TrainerConfig) {
    tracing::info!(
        phase = ?phase,
        rank = train_cfg.global_rank,
        job = %train_cfg.job_id,
        "trainer phase"
    );
}
