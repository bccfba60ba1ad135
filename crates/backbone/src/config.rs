use candle_core::{DType, Device, Error, Result};
use serde::{Deserialize, Serialize};

/// Channel expansion applied by every bottleneck block.
pub const EXPANSION: usize = 4;

/// Input normalisation expected by a backbone's pretrained weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessingVariant {
    /// ImageNet channel statistics.
    Imagenet,
    /// Inception-style symmetric scaling to `[-1, 1]`.
    Inception,
}

impl Default for PreprocessingVariant {
    fn default() -> Self {
        Self::Imagenet
    }
}

/// Hyperparameters of the bottleneck residual family (ResNet / ResNeXt).
#[derive(Debug, Clone)]
pub struct BackboneConfig {
    /// Number of bottleneck blocks in each of the four stages.
    pub layers: [usize; 4],
    /// Grouped-convolution cardinality of the 3x3 convolutions.
    pub groups: usize,
    /// Channels per group relative to a base of 64.
    pub width_per_group: usize,
    /// Output channels of the stem convolution; stage `i` uses `stem_width << i` planes.
    pub stem_width: usize,
    pub num_classes: usize,
    pub dtype: DType,
    pub device: Device,
}

impl BackboneConfig {
    /// torchvision `resnet50` layout.
    pub fn resnet50(device: &Device) -> Self {
        Self {
            layers: [3, 4, 6, 3],
            groups: 1,
            width_per_group: 64,
            stem_width: 64,
            num_classes: 1000,
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    /// `resnext101_32x48d` layout used by the weakly supervised Instagram models.
    pub fn resnext101_32x48d(device: &Device) -> Self {
        Self {
            layers: [3, 4, 23, 3],
            groups: 32,
            width_per_group: 48,
            stem_width: 64,
            num_classes: 1000,
            dtype: DType::F32,
            device: device.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.layers.iter().any(|&blocks| blocks == 0) {
            return Err(Error::Msg(format!(
                "every stage needs at least one block (got {:?})",
                self.layers
            )));
        }
        if self.groups == 0 {
            return Err(Error::Msg("groups must be greater than zero".into()));
        }
        if self.width_per_group == 0 {
            return Err(Error::Msg("width_per_group must be greater than zero".into()));
        }
        if self.stem_width == 0 {
            return Err(Error::Msg("stem_width must be greater than zero".into()));
        }
        if self.num_classes == 0 {
            return Err(Error::Msg("num_classes must be greater than zero".into()));
        }
        if self.bottleneck_width(self.stem_width) == 0 {
            return Err(Error::Msg(format!(
                "stem_width {} with width_per_group {} yields empty bottlenecks",
                self.stem_width, self.width_per_group
            )));
        }
        Ok(())
    }

    /// Planes of stage `stage` (0-based) before expansion.
    pub fn stage_planes(&self, stage: usize) -> usize {
        self.stem_width << stage
    }

    /// Inner width of a bottleneck with `planes` output planes.
    pub fn bottleneck_width(&self, planes: usize) -> usize {
        planes * self.width_per_group / 64 * self.groups
    }

    /// Length of the pooled feature vector fed to the classifier.
    pub fn embedding_dim(&self) -> usize {
        self.stage_planes(3) * EXPANSION
    }
}
