use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
};

use candle_core::{Device, Tensor};

use crate::{
    dataset::{Dataset, Sample},
    error::{DataError, Result},
};

/// Batches each background worker may decode ahead of the consumer.
pub const PREFETCH_PER_WORKER: usize = 2;

/// Collated batch; `indices` are the dataset positions of its rows.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Strided shard owned by `rank`: `rank, rank + world_size, ...`.
pub fn shard_indices(len: usize, rank: usize, world_size: usize) -> Vec<usize> {
    if world_size == 0 {
        return Vec::new();
    }
    (rank..len).step_by(world_size).collect()
}

pub fn collate(samples: Vec<Sample>, indices: Vec<usize>) -> Result<Batch> {
    if samples.is_empty() {
        return Err(DataError::InvalidConfig("cannot collate an empty batch".into()));
    }
    let labels: Vec<i64> = samples.iter().map(|sample| sample.label).collect();
    let images: Vec<Tensor> = samples.into_iter().map(|sample| sample.image).collect();
    Ok(Batch {
        images: Tensor::stack(&images, 0)?,
        labels: Tensor::new(labels.as_slice(), &Device::Cpu)?,
        indices,
    })
}

/// Fixed-order batch loader over a subset of a dataset.
///
/// With `workers == 0` batches are decoded on the calling thread. Otherwise
/// worker `w` decodes batches `w, w + workers, ...` into its own bounded queue
/// and the consumer reads the queues round-robin, which keeps the order fixed.
pub struct BatchLoader {
    dataset: Arc<dyn Dataset>,
    indices: Arc<Vec<usize>>,
    batch_size: usize,
    workers: usize,
}

impl std::fmt::Debug for BatchLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("dataset_len", &self.dataset.len())
            .field("indices", &self.indices.len())
            .field("batch_size", &self.batch_size)
            .field("workers", &self.workers)
            .finish()
    }
}

impl BatchLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        indices: Vec<usize>,
        batch_size: usize,
        workers: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(DataError::InvalidConfig(
                "batch size must be greater than zero".into(),
            ));
        }
        if let Some(&out_of_range) = indices.iter().find(|&&index| index >= dataset.len()) {
            return Err(DataError::InvalidConfig(format!(
                "sample index {out_of_range} out of range for {} samples",
                dataset.len()
            )));
        }
        Ok(Self {
            dataset,
            indices: Arc::new(indices),
            batch_size,
            workers,
        })
    }

    /// Number of samples this loader yields.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn iter(&self) -> Result<Batches> {
        let total = self.num_batches();
        let workers = self.workers.min(total);
        if workers == 0 {
            return Ok(Batches {
                source: Source::Inline {
                    dataset: Arc::clone(&self.dataset),
                    indices: Arc::clone(&self.indices),
                    batch_size: self.batch_size,
                },
                next: 0,
                total,
            });
        }

        let mut receivers = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let (tx, rx) = mpsc::sync_channel(PREFETCH_PER_WORKER);
            let dataset = Arc::clone(&self.dataset);
            let indices = Arc::clone(&self.indices);
            let batch_size = self.batch_size;
            let handle = thread::Builder::new()
                .name(format!("loader-{worker}"))
                .spawn(move || {
                    for batch_no in (worker..total).step_by(workers) {
                        let batch = load_batch(dataset.as_ref(), &indices, batch_size, batch_no);
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                })?;
            receivers.push(rx);
            handles.push(handle);
        }

        Ok(Batches {
            source: Source::Workers { receivers, handles },
            next: 0,
            total,
        })
    }
}

enum Source {
    Inline {
        dataset: Arc<dyn Dataset>,
        indices: Arc<Vec<usize>>,
        batch_size: usize,
    },
    Workers {
        receivers: Vec<Receiver<Result<Batch>>>,
        handles: Vec<JoinHandle<()>>,
    },
}

/// Iterator returned by [`BatchLoader::iter`].
pub struct Batches {
    source: Source,
    next: usize,
    total: usize,
}

impl Iterator for Batches {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let batch_no = self.next;
        self.next += 1;

        let batch = match &self.source {
            Source::Inline {
                dataset,
                indices,
                batch_size,
            } => load_batch(dataset.as_ref(), indices, *batch_size, batch_no),
            Source::Workers { receivers, .. } => {
                let worker = batch_no % receivers.len();
                receivers[worker].recv().unwrap_or_else(|_| {
                    Err(DataError::Worker(format!(
                        "worker {worker} exited before producing batch {batch_no}"
                    )))
                })
            }
        };
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        if let Source::Workers { receivers, handles } = &mut self.source {
            // Closing the queues unblocks workers waiting on a full channel.
            receivers.clear();
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

fn load_batch(
    dataset: &dyn Dataset,
    indices: &[usize],
    batch_size: usize,
    batch_no: usize,
) -> Result<Batch> {
    let start = batch_no * batch_size;
    let end = (start + batch_size).min(indices.len());
    let chunk = &indices[start..end];
    let samples = chunk
        .iter()
        .map(|&index| dataset.get(index))
        .collect::<Result<Vec<_>>>()?;
    collate(samples, chunk.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    struct Counting {
        len: usize,
    }

    impl Dataset for Counting {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize) -> Result<Sample> {
            Ok(Sample {
                image: Tensor::full(index as f32, (3, 2, 2), &Device::Cpu)?,
                label: index as i64 * 10,
            })
        }
    }

    fn collect_indices(loader: &BatchLoader) -> Vec<usize> {
        loader
            .iter()
            .unwrap()
            .flat_map(|batch| batch.unwrap().indices)
            .collect()
    }

    #[test]
    fn sharding_is_disjoint_and_complete() {
        let world = 3;
        let mut all: Vec<usize> = (0..world).flat_map(|rank| shard_indices(10, rank, world)).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
        assert_eq!(shard_indices(10, 1, 3), vec![1, 4, 7]);
        assert!(shard_indices(2, 3, 4).is_empty());
    }

    #[test]
    fn workers_preserve_fixed_order() {
        let dataset: Arc<dyn Dataset> = Arc::new(Counting { len: 23 });
        let indices: Vec<usize> = (0..23).collect();
        let inline = BatchLoader::new(Arc::clone(&dataset), indices.clone(), 4, 0).unwrap();
        let threaded = BatchLoader::new(dataset, indices.clone(), 4, 3).unwrap();

        assert_eq!(inline.num_batches(), 6);
        assert_eq!(collect_indices(&inline), indices);
        assert_eq!(collect_indices(&threaded), indices);
    }

    #[test]
    fn batches_carry_aligned_images_and_labels() {
        let dataset: Arc<dyn Dataset> = Arc::new(Counting { len: 5 });
        let loader = BatchLoader::new(dataset, vec![4, 2, 0], 2, 2).unwrap();

        let batches: Vec<Batch> = loader.iter().unwrap().map(|b| b.unwrap()).collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].images.dims(), &[2, 3, 2, 2]);
        assert_eq!(batches[0].labels.dtype(), DType::I64);
        assert_eq!(batches[0].labels.to_vec1::<i64>().unwrap(), vec![40, 20]);
        assert_eq!(batches[1].indices, vec![0]);
        let first_pixel = batches[0]
            .images
            .flatten_from(1)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(first_pixel[0][0], 4.0);
        assert_eq!(first_pixel[1][0], 2.0);
    }

    #[test]
    fn dropping_iterator_early_releases_workers() {
        let dataset: Arc<dyn Dataset> = Arc::new(Counting { len: 64 });
        let loader = BatchLoader::new(dataset, (0..64).collect(), 1, 4).unwrap();
        let mut batches = loader.iter().unwrap();
        assert!(batches.next().is_some());
        drop(batches);
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let dataset: Arc<dyn Dataset> = Arc::new(Counting { len: 2 });
        assert!(BatchLoader::new(Arc::clone(&dataset), vec![0, 2], 1, 0).is_err());
        assert!(BatchLoader::new(dataset, vec![0], 0, 0).is_err());
    }
}
