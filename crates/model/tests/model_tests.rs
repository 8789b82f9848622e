use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use model::{
    build_model, ClickModel, LodTensor, ModelConfig, ModelKind, SlotFeatureSpec, SlotInputs,
};

fn build_config() -> ModelConfig {
    ModelConfig {
        user_slots: vec![SlotFeatureSpec::categorical("user_id", 8)],
        item_slots: vec![
            SlotFeatureSpec::categorical("item_id", 32),
            SlotFeatureSpec::dense("item_score", 2),
        ],
        embed_size: 4,
        hidden_size: 8,
        num_blocks: 2,
        num_heads: 2,
        max_seq_len: 16,
        dropout_p: None,
        dtype: DType::F32,
        device: Device::Cpu,
    }
}

/// Three sequences of lengths 3, 1 and 4.
fn build_inputs() -> Result<SlotInputs> {
    let device = Device::Cpu;
    let item_lod = vec![0, 3, 4, 8];
    let mut inputs = SlotInputs::new(item_lod.clone())?;

    let users = Tensor::from_slice(&[1i64, 5, 7], (3, 1), &device)?;
    inputs.insert("user_id", LodTensor::new(users, vec![0, 1, 2, 3])?)?;

    let items = Tensor::from_slice(&[3i64, 9, 1, 4, 30, 2, 2, 17], (8, 1), &device)?;
    inputs.insert("item_id", LodTensor::new(items, item_lod.clone())?)?;

    let scores: Vec<f32> = (0..16).map(|i| i as f32 / 16.0).collect();
    let scores = Tensor::from_vec(scores, (8, 2), &device)?;
    inputs.insert("item_score", LodTensor::new(scores, item_lod)?)?;
    Ok(inputs)
}

fn build(kind: ModelKind, varmap: &VarMap) -> Result<Box<dyn ClickModel>> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Ok(build_model(kind, &build_config(), vb)?)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    Ok(a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?)
}

#[test]
fn forward_produces_two_logits_per_item() -> Result<()> {
    for kind in [ModelKind::BiRnn, ModelKind::Transformer] {
        let varmap = VarMap::new();
        let model = build(kind, &varmap)?;
        assert_eq!(model.kind(), kind);

        let logits = model.forward(&build_inputs()?, false)?;
        assert_eq!(logits.dims(), &[8, 2]);
        assert_eq!(logits.dtype(), DType::F32);
    }
    Ok(())
}

#[test]
fn sequence_outputs_do_not_depend_on_batch_padding() -> Result<()> {
    for kind in [ModelKind::BiRnn, ModelKind::Transformer] {
        let varmap = VarMap::new();
        let model = build(kind, &varmap)?;
        let inputs = build_inputs()?;

        let batch_logits = model.forward(&inputs, false)?;
        // the second sequence (one item) on its own needs no padding at all
        let alone = model.forward(&inputs.narrow_sequences(1, 2)?, false)?;
        let in_batch = batch_logits.narrow(0, 3, 1)?;
        assert!(max_abs_diff(&alone, &in_batch)? < 1e-5, "{kind} leaks padding");

        let last = model.forward(&inputs.narrow_sequences(2, 3)?, false)?;
        let in_batch = batch_logits.narrow(0, 4, 4)?;
        assert!(max_abs_diff(&last, &in_batch)? < 1e-5, "{kind} leaks padding");
    }
    Ok(())
}

#[test]
fn gradients_reach_every_parameter_group() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(ModelKind::BiRnn, &varmap)?;
    let logits = model.forward(&build_inputs()?, true)?;
    let grads = logits.sqr()?.mean_all()?.backward()?;

    let data = varmap.data().lock().unwrap();
    for name in [
        "slots.user.user_id.weight",
        "slots.item.item_id.weight",
        "input_proj.weight",
        "output.weight",
    ] {
        let var = data.get(name).unwrap_or_else(|| panic!("missing parameter {name}"));
        assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
    }
    Ok(())
}

#[test]
fn missing_slot_is_an_error() -> Result<()> {
    let varmap = VarMap::new();
    let model = build(ModelKind::Transformer, &varmap)?;

    let mut inputs = SlotInputs::new(vec![0, 2])?;
    let items = Tensor::from_slice(&[1i64, 2], (2, 1), &Device::Cpu)?;
    inputs.insert("item_id", LodTensor::new(items, vec![0, 2])?)?;

    let err = model.forward(&inputs, false).unwrap_err();
    assert!(err.to_string().contains("user_id"));
    Ok(())
}

#[test]
fn transformer_rejects_sequences_longer_than_position_table() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let mut config = build_config();
    config.max_seq_len = 2;
    let model = build_model(ModelKind::Transformer, &config, vb)?;
    assert!(model.forward(&build_inputs()?, false).is_err());
    Ok(())
}

#[test]
fn model_names_parse() {
    assert_eq!("BiRNN".parse::<ModelKind>(), Ok(ModelKind::BiRnn));
    assert_eq!("Trans".parse::<ModelKind>(), Ok(ModelKind::Transformer));
    assert!("GRU4Rec".parse::<ModelKind>().is_err());
    assert_eq!(ModelKind::Transformer.to_string(), "Trans");
}
