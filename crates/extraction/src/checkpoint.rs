use std::{
    collections::HashMap,
    fs::{self, File},
    path::{Path, PathBuf},
};

use backbone::ParameterMap;
use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use safetensors::SafeTensors;
use sha2::{Digest, Sha256};

use crate::{
    distributed::DistributedBackbone,
    error::{ExtractionError, Result},
};

pub const CHECKPOINT_FORMAT: &str = "frozen-extraction";
pub const CHECKPOINT_VERSION: u32 = 1;

const KEY_FORMAT: &str = "format";
const KEY_VERSION: &str = "version";
const KEY_EPOCH: &str = "epoch";
const KEY_ARCHITECTURE: &str = "architecture";
const KEY_LAYOUT: &str = "layout";

/// Everything persisted between runs: the replicated model and an epoch marker.
#[derive(Debug)]
pub struct CheckpointState {
    pub model: DistributedBackbone,
    pub epoch: usize,
}

impl CheckpointState {
    pub fn new(model: DistributedBackbone) -> Self {
        Self { model, epoch: 0 }
    }

    /// Writes the parameters as safetensors with the epoch in the header
    /// metadata. The previous file at `path` survives a crash mid-write.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| {
                ExtractionError::checkpoint(format!(
                    "failed to create checkpoint directory {}: {err}",
                    parent.display()
                ))
            })?;
        }

        let state = self.model.state_dict()?;
        let metadata: HashMap<String, String> = [
            (KEY_FORMAT, CHECKPOINT_FORMAT.to_string()),
            (KEY_VERSION, CHECKPOINT_VERSION.to_string()),
            (KEY_EPOCH, self.epoch.to_string()),
            (KEY_ARCHITECTURE, self.model.module().name().to_string()),
            (KEY_LAYOUT, layout_fingerprint(&state)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        let host = state
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(&Device::Cpu)?.contiguous()?)))
            .collect::<Result<Vec<(String, Tensor)>>>()?;

        let tmp = temporary_path(path);
        safetensors::serialize_to_file(host, &Some(metadata), &tmp).map_err(|err| {
            ExtractionError::checkpoint(format!("failed to write {}: {err}", tmp.display()))
        })?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, path).map_err(|err| {
            ExtractionError::checkpoint(format!(
                "failed to move {} into place: {err}",
                path.display()
            ))
        })?;
        tracing::info!(path = %path.display(), epoch = self.epoch, "checkpoint saved");
        Ok(())
    }

    /// Restores parameters and epoch from `path` into `template`.
    pub fn load(path: &Path, mut template: CheckpointState) -> Result<CheckpointState> {
        if !path.is_file() {
            return Err(ExtractionError::checkpoint(format!(
                "checkpoint not found at {}",
                path.display()
            )));
        }
        let buffer = fs::read(path)?;
        let (_, header) = SafeTensors::read_metadata(&buffer).map_err(|err| {
            ExtractionError::checkpoint(format!("failed to parse {}: {err}", path.display()))
        })?;
        let metadata = header.metadata().as_ref().ok_or_else(|| {
            ExtractionError::checkpoint(format!("{} carries no metadata", path.display()))
        })?;

        let field = |key: &str| metadata_field(metadata, key, path);

        if field(KEY_FORMAT)? != CHECKPOINT_FORMAT {
            return Err(ExtractionError::checkpoint(format!(
                "{} is not an extraction checkpoint",
                path.display()
            )));
        }
        ensure_version_supported(field(KEY_VERSION)?)?;
        let epoch = field(KEY_EPOCH)?.parse::<usize>().map_err(|err| {
            ExtractionError::checkpoint(format!("invalid epoch in {}: {err}", path.display()))
        })?;
        let expected_layout = layout_fingerprint(&template.model.state_dict()?);
        if field(KEY_LAYOUT)? != &expected_layout {
            return Err(ExtractionError::checkpoint(format!(
                "{} was written for a different parameter layout ({})",
                path.display(),
                field(KEY_ARCHITECTURE).map(String::as_str).unwrap_or("unknown")
            )));
        }

        let tensors = candle_core::safetensors::load_buffer(&buffer, &Device::Cpu).map_err(|err| {
            ExtractionError::checkpoint(format!(
                "failed to read tensors from {}: {err}",
                path.display()
            ))
        })?;
        template
            .model
            .load_state_dict(tensors.into_iter().collect())?;
        template.epoch = epoch;
        Ok(template)
    }
}

/// SHA-256 over sorted parameter names, shapes and dtypes.
pub fn layout_fingerprint(params: &ParameterMap) -> String {
    let mut hasher = Sha256::new();
    for (name, tensor) in params {
        hasher.update(name.as_bytes());
        hasher.update(format!("{:?}{:?}\n", tensor.dims(), tensor.dtype()).as_bytes());
    }
    hex_encode(hasher.finalize())
}

fn metadata_field<'a>(
    metadata: &'a HashMap<String, String>,
    key: &str,
    path: &Path,
) -> Result<&'a String> {
    metadata.get(key).ok_or_else(|| {
        ExtractionError::checkpoint(format!("{} metadata is missing '{key}'", path.display()))
    })
}

fn ensure_version_supported(raw: &str) -> Result<()> {
    match raw.parse::<u32>() {
        Ok(CHECKPOINT_VERSION) => Ok(()),
        _ => Err(ExtractionError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            raw, CHECKPOINT_VERSION
        ))),
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use backbone::{Backbone, BackboneConfig};
    use candle_core::DType;
    use tempfile::tempdir;

    fn tiny_state(seed_offset: f64) -> CheckpointState {
        let config = BackboneConfig {
            layers: [1, 1, 1, 1],
            groups: 1,
            width_per_group: 64,
            stem_width: 4,
            num_classes: 3,
            dtype: DType::F32,
            device: Device::Cpu,
        };
        let mut backbone = Backbone::new("ResNet50", config).unwrap();
        let shifted: ParameterMap = backbone
            .named_parameters()
            .unwrap()
            .into_iter()
            .map(|(name, tensor)| {
                let tensor = (tensor + seed_offset).unwrap();
                (name, tensor)
            })
            .collect();
        backbone.load_parameters(shifted).unwrap();
        backbone.freeze().unwrap();
        CheckpointState::new(DistributedBackbone::wrap(backbone, 0, 1).unwrap())
    }

    fn flatten(state: &CheckpointState) -> Vec<(String, Vec<f32>)> {
        state
            .model
            .state_dict()
            .unwrap()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    #[test]
    fn round_trip_restores_parameters_and_epoch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("job/checkpoint.pth");
        let mut saved = tiny_state(0.5);
        saved.epoch = 3;
        saved.save(&path).unwrap();
        assert!(!temporary_path(&path).exists());

        let restored = CheckpointState::load(&path, tiny_state(-2.0)).unwrap();

        assert_eq!(restored.epoch, 3);
        assert_eq!(flatten(&restored), flatten(&saved));
    }

    #[test]
    fn missing_file_is_a_checkpoint_error() {
        let dir = tempdir().unwrap();
        let err = CheckpointState::load(&dir.path().join("nope.pth"), tiny_state(0.0)).unwrap_err();
        assert!(matches!(err, ExtractionError::Checkpoint(_)));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.pth");
        tiny_state(0.0).save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = CheckpointState::load(&path, tiny_state(0.0)).unwrap_err();

        assert!(matches!(err, ExtractionError::Checkpoint(_)));
    }

    #[test]
    fn foreign_safetensors_without_metadata_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.pth");
        let mut tensors = HashMap::new();
        tensors.insert(
            "module.fc.weight".to_string(),
            Tensor::zeros((3, 128), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let err = CheckpointState::load(&path, tiny_state(0.0)).unwrap_err();

        assert!(err.to_string().contains("metadata"));
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.pth");
        tiny_state(0.0).save(&path).unwrap();

        let config = BackboneConfig {
            layers: [1, 1, 1, 1],
            groups: 1,
            width_per_group: 64,
            stem_width: 4,
            num_classes: 7,
            dtype: DType::F32,
            device: Device::Cpu,
        };
        let mut other = Backbone::new("ResNet50", config).unwrap();
        other.freeze().unwrap();
        let template = CheckpointState::new(DistributedBackbone::wrap(other, 0, 1).unwrap());

        let err = CheckpointState::load(&path, template).unwrap_err();

        assert!(err.to_string().contains("different parameter layout"));
    }

    #[test]
    fn fingerprint_ignores_values() {
        let a = tiny_state(0.0).model.state_dict().unwrap();
        let b = tiny_state(1.0).model.state_dict().unwrap();
        assert_eq!(layout_fingerprint(&a), layout_fingerprint(&b));
    }
}
