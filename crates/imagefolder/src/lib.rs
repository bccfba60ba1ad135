pub mod dataset;
pub mod error;
pub mod loader;
pub mod transforms;

pub use dataset::{Dataset, ImageFolder, Sample, IMAGE_EXTENSIONS};
pub use error::{DataError, Result};
pub use loader::{collate, shard_indices, Batch, BatchLoader, Batches};
pub use transforms::{EvalTransform, Normalization, CROP_FRACTION};
