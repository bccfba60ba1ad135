use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use candle_core::{Device, Error, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

use crate::{config::BackboneConfig, resnet::ResNet};

/// Named parameters keyed by their dotted torchvision path, sorted by name.
pub type ParameterMap = BTreeMap<String, Tensor>;

enum Storage {
    /// Parameters are `Var`s and participate in gradient tracking.
    Trainable(VarMap),
    /// Parameters are plain tensors; no op on them is recorded for backprop.
    Frozen(ParameterMap),
}

/// A named backbone instance together with its parameter storage.
pub struct Backbone {
    name: String,
    config: BackboneConfig,
    network: ResNet,
    storage: Storage,
    training: bool,
}

impl fmt::Debug for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backbone")
            .field("name", &self.name)
            .field("layers", &self.config.layers)
            .field("num_classes", &self.config.num_classes)
            .field("frozen", &self.is_frozen())
            .field("training", &self.training)
            .finish()
    }
}

impl Backbone {
    /// Builds a freshly initialised, trainable backbone on `config.device`.
    pub fn new(name: impl Into<String>, config: BackboneConfig) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, config.dtype, &config.device);
        let network = ResNet::new(&config, vb)?;
        Ok(Self {
            name: name.into(),
            config,
            network,
            storage: Storage::Trainable(varmap),
            training: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.config.device
    }

    pub fn embedding_dim(&self) -> usize {
        self.config.embedding_dim()
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.storage, Storage::Frozen(_))
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switches batch-norm layers between batch statistics and running statistics.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Snapshot of every parameter and buffer, including batch-norm running stats.
    pub fn named_parameters(&self) -> Result<ParameterMap> {
        match &self.storage {
            Storage::Trainable(varmap) => {
                let vars = varmap
                    .data()
                    .lock()
                    .map_err(|_| Error::Msg("parameter store lock poisoned".into()))?;
                Ok(vars
                    .iter()
                    .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                    .collect())
            }
            Storage::Frozen(params) => Ok(params.clone()),
        }
    }

    /// Replaces every parameter. The incoming map must cover exactly the same
    /// names and shapes; dtypes are cast and tensors moved to this backbone's device.
    pub fn load_parameters(&mut self, params: ParameterMap) -> Result<()> {
        let expected = self.named_parameters()?;
        let mut incoming = params;
        let mut resolved = ParameterMap::new();

        for (name, current) in &expected {
            let tensor = incoming
                .remove(name)
                .ok_or_else(|| Error::Msg(format!("missing parameter {name}")))?;
            if tensor.dims() != current.dims() {
                return Err(Error::Msg(format!(
                    "parameter {name} has shape {:?}, expected {:?}",
                    tensor.dims(),
                    current.dims()
                )));
            }
            let tensor = if tensor.dtype() == current.dtype() {
                tensor
            } else {
                tensor.to_dtype(current.dtype())?
            };
            resolved.insert(name.clone(), tensor.to_device(&self.config.device)?);
        }

        if !incoming.is_empty() {
            let extra = incoming.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(Error::Msg(format!("unexpected parameters: {extra}")));
        }

        if let Storage::Trainable(varmap) = &self.storage {
            let vars = varmap
                .data()
                .lock()
                .map_err(|_| Error::Msg("parameter store lock poisoned".into()))?;
            for (name, tensor) in &resolved {
                let var = vars
                    .get(name)
                    .ok_or_else(|| Error::Msg(format!("missing parameter {name}")))?;
                var.set(tensor)?;
            }
            return Ok(());
        }

        self.network = assemble_frozen(&self.config, &resolved)?;
        self.storage = Storage::Frozen(resolved);
        Ok(())
    }

    /// Detaches every parameter from gradient tracking. Idempotent.
    pub fn freeze(&mut self) -> Result<()> {
        if self.is_frozen() {
            return Ok(());
        }
        let params: ParameterMap = self
            .named_parameters()?
            .into_iter()
            .map(|(name, tensor)| (name, tensor.detach()))
            .collect();
        self.network = assemble_frozen(&self.config, &params)?;
        self.storage = Storage::Frozen(params);
        Ok(())
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        if self.config.device.same_device(device) {
            return Ok(());
        }
        let moved = self
            .named_parameters()?
            .into_iter()
            .map(|(name, tensor)| Ok((name, tensor.to_device(device)?)))
            .collect::<Result<ParameterMap>>()?;
        self.config.device = device.clone();

        if self.is_frozen() {
            self.network = assemble_frozen(&self.config, &moved)?;
            self.storage = Storage::Frozen(moved);
            return Ok(());
        }

        let varmap = VarMap::new();
        {
            let mut vars = varmap
                .data()
                .lock()
                .map_err(|_| Error::Msg("parameter store lock poisoned".into()))?;
            for (name, tensor) in moved {
                vars.insert(name, Var::from_tensor(&tensor)?);
            }
        }
        let vb = VarBuilder::from_varmap(&varmap, self.config.dtype, &self.config.device);
        self.network = ResNet::new(&self.config, vb)?;
        self.storage = Storage::Trainable(varmap);
        Ok(())
    }

    /// Returns `(logits, embedding)` for images shaped `(batch, 3, height, width)`.
    pub fn forward(&self, images: &Tensor) -> Result<(Tensor, Tensor)> {
        if images.rank() != 4 {
            return Err(Error::Msg(format!(
                "images expected [batch, channels, height, width] got {:?}",
                images.dims()
            )));
        }
        let images = if images.dtype() == self.config.dtype {
            images.clone()
        } else {
            images.to_dtype(self.config.dtype)?
        };
        self.network.forward(&images, self.training)
    }
}

fn assemble_frozen(config: &BackboneConfig, params: &ParameterMap) -> Result<ResNet> {
    let tensors: HashMap<String, Tensor> = params
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();
    let vb = VarBuilder::from_tensors(tensors, config.dtype, &config.device);
    ResNet::new(config, vb)
}
