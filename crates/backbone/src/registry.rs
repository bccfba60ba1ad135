//! Closed set of named backbones, resolved once at configuration time.
//!
//! `PNASNet` is a recognised name without a network behind it. Selecting it
//! fails with [`unavailable_reason`]; its Inception preprocessing is still
//! available to the registered backbones.

use candle_core::{Device, Result};

use crate::{
    config::{BackboneConfig, PreprocessingVariant},
    model::Backbone,
};

/// Registry row: a backbone name, its default layout and preprocessing.
#[derive(Debug, Clone, Copy)]
pub struct BackboneEntry {
    pub name: &'static str,
    pub preprocessing: PreprocessingVariant,
    pub layout: fn(&Device) -> BackboneConfig,
}

impl BackboneEntry {
    pub fn config(&self, device: &Device) -> BackboneConfig {
        (self.layout)(device)
    }

    pub fn build(&self, config: BackboneConfig) -> Result<Backbone> {
        Backbone::new(self.name, config)
    }
}

pub const BACKBONES: &[BackboneEntry] = &[
    BackboneEntry {
        name: "ResNet50",
        preprocessing: PreprocessingVariant::Imagenet,
        layout: BackboneConfig::resnet50,
    },
    BackboneEntry {
        name: "IGAM_Resnext101_32x48d",
        preprocessing: PreprocessingVariant::Imagenet,
        layout: BackboneConfig::resnext101_32x48d,
    },
];

pub fn lookup(name: &str) -> Option<&'static BackboneEntry> {
    BACKBONES.iter().find(|entry| entry.name == name)
}

pub fn names() -> Vec<&'static str> {
    BACKBONES.iter().map(|entry| entry.name).collect()
}

/// Names that are known but have no implementation, with the reason.
pub const UNAVAILABLE: &[(&str, &str)] = &[(
    "PNASNet",
    "the NASNet search cells are not implemented; set trainer.preprocessing = \"inception\" on a registered backbone instead",
)];

pub fn unavailable_reason(name: &str) -> Option<&'static str> {
    UNAVAILABLE
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, reason)| *reason)
}
