use anyhow::Result;
use backbone::{Backbone, BackboneConfig, ParameterMap};
use candle_core::{DType, Device, Tensor};

fn tiny_config(groups: usize) -> BackboneConfig {
    BackboneConfig {
        layers: [1, 1, 1, 1],
        groups,
        width_per_group: 64,
        stem_width: 4,
        num_classes: 5,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

fn images(batch: usize) -> Result<Tensor> {
    Ok(Tensor::rand(0f32, 1f32, (batch, 3, 32, 32), &Device::Cpu)?)
}

fn eval_forward(model: &Backbone, input: &Tensor) -> Result<(Vec<Vec<f32>>, Vec<Vec<f32>>)> {
    let (logits, embedding) = model.forward(input)?;
    Ok((logits.to_vec2()?, embedding.to_vec2()?))
}

#[test]
fn forward_produces_logits_and_embedding() -> Result<()> {
    let mut model = Backbone::new("tiny", tiny_config(1))?;
    model.set_training(false);

    let (logits, embedding) = model.forward(&images(2)?)?;

    assert_eq!(logits.dims(), &[2, 5]);
    assert_eq!(embedding.dims(), &[2, model.embedding_dim()]);
    assert_eq!(model.embedding_dim(), 128);
    Ok(())
}

#[test]
fn parameter_names_follow_torchvision_layout() -> Result<()> {
    let model = Backbone::new("tiny", tiny_config(1))?;
    let params = model.named_parameters()?;

    for name in [
        "conv1.weight",
        "bn1.weight",
        "bn1.running_mean",
        "bn1.running_var",
        "layer1.0.conv1.weight",
        "layer1.0.downsample.0.weight",
        "layer1.0.downsample.1.bias",
        "layer4.0.conv3.weight",
        "fc.weight",
        "fc.bias",
    ] {
        assert!(params.contains_key(name), "missing {name}");
    }
    assert_eq!(params["fc.weight"].dims(), &[5, 128]);
    Ok(())
}

#[test]
fn grouped_convolutions_shape_weights_by_cardinality() -> Result<()> {
    let model = Backbone::new("tiny-grouped", tiny_config(2))?;
    let params = model.named_parameters()?;

    assert_eq!(params["layer1.0.conv1.weight"].dims(), &[8, 4, 1, 1]);
    assert_eq!(params["layer1.0.conv2.weight"].dims(), &[8, 4, 3, 3]);
    Ok(())
}

#[test]
fn freezing_preserves_outputs() -> Result<()> {
    let mut model = Backbone::new("tiny", tiny_config(1))?;
    model.set_training(false);
    let input = images(3)?;
    let before = eval_forward(&model, &input)?;

    model.freeze()?;
    assert!(model.is_frozen());
    let after = eval_forward(&model, &input)?;

    assert_eq!(before, after);
    Ok(())
}

#[test]
fn load_parameters_transfers_weights_between_instances() -> Result<()> {
    let mut source = Backbone::new("tiny", tiny_config(1))?;
    source.set_training(false);
    let mut target = Backbone::new("tiny", tiny_config(1))?;
    target.freeze()?;
    target.set_training(false);

    target.load_parameters(source.named_parameters()?)?;

    let input = images(2)?;
    assert_eq!(eval_forward(&source, &input)?, eval_forward(&target, &input)?);
    Ok(())
}

#[test]
fn load_parameters_rejects_incompatible_maps() -> Result<()> {
    let mut model = Backbone::new("tiny", tiny_config(1))?;

    let mut missing = model.named_parameters()?;
    missing.remove("fc.bias");
    assert!(model.load_parameters(missing).is_err());

    let mut reshaped: ParameterMap = model.named_parameters()?;
    reshaped.insert("fc.bias".into(), Tensor::zeros(6, DType::F32, &Device::Cpu)?);
    let err = model.load_parameters(reshaped).unwrap_err();
    assert!(err.to_string().contains("fc.bias"));

    let mut extra = model.named_parameters()?;
    extra.insert("head.weight".into(), Tensor::zeros(1, DType::F32, &Device::Cpu)?);
    assert!(model.load_parameters(extra).is_err());
    Ok(())
}

#[test]
fn rejects_non_image_input() -> Result<()> {
    let model = Backbone::new("tiny", tiny_config(1))?;
    let flat = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&flat).is_err());
    Ok(())
}
