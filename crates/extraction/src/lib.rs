pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod inference;
pub mod logging;
pub mod overrides;
pub mod trainer;
pub mod weights;

pub use checkpoint::CheckpointState;
pub use config::{ClusterConfig, DistBackend, ExtractionConfig, ModelOverrides, TrainerConfig};
pub use distributed::{init_process, remove_endpoint, DistributedBackbone, ProcessGroup};
pub use error::{ExtractionError, Result};
pub use inference::{FeatureExtractor, COMPLETION_VALUE};
pub use logging::{LoggingConfig, LoggingSettings};
pub use trainer::{RunOutcome, Trainer, TrainerPhase, TrainerRuntime};
