pub mod config;
pub mod model;
pub mod registry;
pub mod resnet;

pub use config::{BackboneConfig, PreprocessingVariant, EXPANSION};
pub use model::{Backbone, ParameterMap};
pub use registry::{BackboneEntry, BACKBONES};
