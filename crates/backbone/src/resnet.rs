//! Bottleneck residual networks (ResNet-50, ResNeXt-101 32x48d).
//!
//! Parameter names follow the torchvision layout (`conv1`, `bn1`,
//! `layer{1..4}.{block}.conv{1..3}`, `downsample.{0,1}`, `fc`) so that state
//! dicts exported from PyTorch and converted to safetensors load without any
//! renaming. The network returns both the classifier logits and the pooled
//! embedding that feeds the classifier.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, conv2d_no_bias, linear, BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder,
};

use crate::config::{BackboneConfig, EXPANSION};

const BN_EPS: f64 = 1e-5;

fn conv(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: kernel / 2,
        stride,
        groups,
        ..Default::default()
    };
    conv2d_no_bias(in_channels, out_channels, kernel, cfg, vb)
}

struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

struct Bottleneck {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    fn new(
        in_planes: usize,
        planes: usize,
        stride: usize,
        cfg: &BackboneConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let width = cfg.bottleneck_width(planes);
        let out_planes = planes * EXPANSION;

        let conv1 = conv(in_planes, width, 1, 1, 1, vb.pp("conv1"))?;
        let bn1 = batch_norm(width, BN_EPS, vb.pp("bn1"))?;
        let conv2 = conv(width, width, 3, stride, cfg.groups, vb.pp("conv2"))?;
        let bn2 = batch_norm(width, BN_EPS, vb.pp("bn2"))?;
        let conv3 = conv(width, out_planes, 1, 1, 1, vb.pp("conv3"))?;
        let bn3 = batch_norm(out_planes, BN_EPS, vb.pp("bn3"))?;

        let downsample = if stride != 1 || in_planes != out_planes {
            let vb = vb.pp("downsample");
            Some(Downsample {
                conv: conv(in_planes, out_planes, 1, stride, 1, vb.pp("0"))?,
                bn: batch_norm(out_planes, BN_EPS, vb.pp("1"))?,
            })
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            downsample,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?.relu()?;
        let out = self.bn3.forward_t(&self.conv3.forward(&out)?, train)?;
        let identity = match &self.downsample {
            Some(down) => down.bn.forward_t(&down.conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

/// Feature extractor plus linear classifier.
pub struct ResNet {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<Bottleneck>>,
    fc: Linear,
}

impl ResNet {
    pub fn new(cfg: &BackboneConfig, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;

        let conv1 = conv(3, cfg.stem_width, 7, 2, 1, vb.pp("conv1"))?;
        let bn1 = batch_norm(cfg.stem_width, BN_EPS, vb.pp("bn1"))?;

        let mut in_planes = cfg.stem_width;
        let mut stages = Vec::with_capacity(cfg.layers.len());
        for (stage, &blocks) in cfg.layers.iter().enumerate() {
            let planes = cfg.stage_planes(stage);
            let stage_vb = vb.pp(format!("layer{}", stage + 1));
            let mut stage_blocks = Vec::with_capacity(blocks);
            for block in 0..blocks {
                let stride = if stage > 0 && block == 0 { 2 } else { 1 };
                stage_blocks.push(Bottleneck::new(
                    in_planes,
                    planes,
                    stride,
                    cfg,
                    stage_vb.pp(block.to_string()),
                )?);
                in_planes = planes * EXPANSION;
            }
            stages.push(stage_blocks);
        }

        let fc = linear(cfg.embedding_dim(), cfg.num_classes, vb.pp("fc"))?;

        Ok(Self {
            conv1,
            bn1,
            stages,
            fc,
        })
    }

    /// Pooled features shaped `(batch, embedding_dim)`.
    pub fn forward_features(&self, images: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self
            .bn1
            .forward_t(&self.conv1.forward(images)?, train)?
            .relu()?;
        // Inputs are non-negative after ReLU, so zero padding matches -inf padding.
        let mut xs = xs
            .pad_with_zeros(2, 1, 1)?
            .pad_with_zeros(3, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward(&xs, train)?;
            }
        }
        xs.mean((2, 3))
    }

    /// Returns `(logits, embedding)`.
    pub fn forward(&self, images: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let embedding = self.forward_features(images, train)?;
        let logits = self.fc.forward(&embedding)?;
        Ok((logits, embedding))
    }
}
