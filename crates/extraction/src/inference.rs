use std::{fs, path::PathBuf};

use backbone::Backbone;
use candle_core::{DType, Device, Tensor, D};
use imagefolder::Batch;
use indicatif::ProgressBar;

use crate::error::{ExtractionError, Result};

/// Value returned by a completed extraction; it carries no metric.
pub const COMPLETION_VALUE: f64 = 0.0;

/// A model that maps an image batch to `(logits, embedding)`.
pub trait FeatureExtractor {
    fn set_training(&mut self, training: bool);

    fn device(&self) -> &Device;

    fn embedding_dim(&self) -> usize;

    fn num_classes(&self) -> usize;

    fn extract(&self, images: &Tensor) -> Result<(Tensor, Tensor)>;
}

impl FeatureExtractor for Backbone {
    fn set_training(&mut self, training: bool) {
        Backbone::set_training(self, training);
    }

    fn device(&self) -> &Device {
        Backbone::device(self)
    }

    fn embedding_dim(&self) -> usize {
        Backbone::embedding_dim(self)
    }

    fn num_classes(&self) -> usize {
        Backbone::num_classes(self)
    }

    fn extract(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok(self.forward(images)?)
    }
}

/// Softmax over the class axis.
pub fn softmax(logits: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::ops::softmax(logits, D::Minus1)?)
}

/// Host-side buffers sized for the whole shard up front.
#[derive(Debug)]
pub struct OutputBuffers {
    expected_rows: usize,
    embedding_dim: usize,
    num_classes: usize,
    rows: usize,
    embeddings: Vec<f32>,
    probabilities: Vec<f32>,
    labels: Vec<i64>,
}

impl OutputBuffers {
    pub fn new(expected_rows: usize, embedding_dim: usize, num_classes: usize) -> Self {
        Self {
            expected_rows,
            embedding_dim,
            num_classes,
            rows: 0,
            embeddings: Vec::with_capacity(expected_rows * embedding_dim),
            probabilities: Vec::with_capacity(expected_rows * num_classes),
            labels: Vec::with_capacity(expected_rows),
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn append(
        &mut self,
        embeddings: &Tensor,
        probabilities: &Tensor,
        labels: &Tensor,
    ) -> Result<()> {
        let batch = labels.dims1()?;
        let (embedding_rows, embedding_dim) = embeddings.dims2()?;
        let (probability_rows, num_classes) = probabilities.dims2()?;
        if embedding_rows != batch || probability_rows != batch {
            return Err(ExtractionError::runtime(format!(
                "batch rows disagree: {embedding_rows} embeddings, {probability_rows} probabilities, {batch} labels"
            )));
        }
        if embedding_dim != self.embedding_dim || num_classes != self.num_classes {
            return Err(ExtractionError::runtime(format!(
                "batch shape ({embedding_dim}, {num_classes}) does not match buffers ({}, {})",
                self.embedding_dim, self.num_classes
            )));
        }
        if self.rows + batch > self.expected_rows {
            return Err(ExtractionError::runtime(format!(
                "received {} rows, buffers hold {}",
                self.rows + batch,
                self.expected_rows
            )));
        }

        self.embeddings
            .extend(embeddings.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
        self.probabilities
            .extend(probabilities.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?);
        self.labels.extend(labels.to_dtype(DType::I64)?.to_vec1::<i64>()?);
        self.rows += batch;
        Ok(())
    }

    pub fn finish(self) -> Result<ExtractionOutputs> {
        if self.rows != self.expected_rows {
            return Err(ExtractionError::runtime(format!(
                "extracted {} rows, expected {}",
                self.rows, self.expected_rows
            )));
        }
        let device = Device::Cpu;
        Ok(ExtractionOutputs {
            embeddings: Tensor::from_vec(self.embeddings, (self.rows, self.embedding_dim), &device)?,
            probabilities: Tensor::from_vec(
                self.probabilities,
                (self.rows, self.num_classes),
                &device,
            )?,
            labels: Tensor::from_vec(self.labels, self.rows, &device)?,
        })
    }
}

/// Row-aligned results of one shard.
#[derive(Debug)]
pub struct ExtractionOutputs {
    pub embeddings: Tensor,
    pub probabilities: Tensor,
    pub labels: Tensor,
}

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub labels: PathBuf,
    pub embeddings: PathBuf,
    pub probabilities: PathBuf,
}

impl OutputPaths {
    pub fn new(prefix: &str, architecture: &str) -> Self {
        Self {
            labels: PathBuf::from(format!("{prefix}labels.npy")),
            embeddings: PathBuf::from(format!("{prefix}{architecture}_embedding.npy")),
            probabilities: PathBuf::from(format!("{prefix}{architecture}_softmax.npy")),
        }
    }
}

impl ExtractionOutputs {
    pub fn rows(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// Writes the three `.npy` arrays. Nothing is written unless all rows agree.
    pub fn write(&self, paths: &OutputPaths) -> Result<()> {
        let rows = self.rows();
        if self.embeddings.dim(0)? != rows || self.probabilities.dim(0)? != rows {
            return Err(ExtractionError::runtime(format!(
                "refusing to write misaligned outputs: {} embeddings, {} probabilities, {} labels",
                self.embeddings.dim(0)?,
                self.probabilities.dim(0)?,
                rows
            )));
        }
        for path in [&paths.labels, &paths.embeddings, &paths.probabilities] {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
        }
        self.labels.write_npy(&paths.labels)?;
        self.embeddings.write_npy(&paths.embeddings)?;
        self.probabilities.write_npy(&paths.probabilities)?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum LoopOutcome {
    Finished(ExtractionOutputs),
    /// Stopped between batches after `processed` rows.
    Interrupted { processed: usize },
}

/// Runs `model` over `batches` in order. `should_stop` is polled before each
/// batch, so a batch that has started always completes.
pub fn run_inference<M, I, S>(
    model: &mut M,
    batches: I,
    expected_rows: usize,
    progress: &ProgressBar,
    should_stop: S,
) -> Result<LoopOutcome>
where
    M: FeatureExtractor,
    I: IntoIterator<Item = imagefolder::Result<Batch>>,
    S: Fn() -> bool,
{
    model.set_training(false);
    let device = model.device().clone();
    let mut buffers = OutputBuffers::new(expected_rows, model.embedding_dim(), model.num_classes());

    for batch in batches {
        if should_stop() {
            progress.abandon();
            return Ok(LoopOutcome::Interrupted {
                processed: buffers.rows(),
            });
        }
        let batch = batch?;
        let images = batch.images.to_device(&device)?;
        let labels = batch.labels.to_device(&device)?;

        let (logits, embedding) = model.extract(&images)?;
        let probabilities = softmax(&logits)?;

        buffers.append(
            &embedding.to_device(&Device::Cpu)?,
            &probabilities.to_device(&Device::Cpu)?,
            &labels.to_device(&Device::Cpu)?,
        )?;
        progress.inc(batch.len() as u64);
    }

    progress.finish();
    Ok(LoopOutcome::Finished(buffers.finish()?))
}
