mod common;

use std::fs;

use anyhow::Result;
use candle_core::Device;
use model::ModelKind;
use training::checkpoint::{latest_checkpoint_step, named_parameters};
use training::{build_task, TrainMode};

use common::Fixture;

#[test]
fn latest_checkpoint_ignores_malformed_names() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for name in ["model-3.ckp", "model-10.ckp", "garbage.ckp", "model-x1.ckp", "model-7.ckp.tmp"] {
        fs::write(dir.path().join(name), b"")?;
    }
    fs::create_dir(dir.path().join("model-99"))?;
    assert_eq!(latest_checkpoint_step(dir.path())?, 10);
    Ok(())
}

#[test]
fn empty_or_missing_directory_has_no_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    assert_eq!(latest_checkpoint_step(dir.path())?, -1);
    assert_eq!(latest_checkpoint_step(&dir.path().join("absent"))?, -1);
    Ok(())
}

#[test]
fn saved_parameters_are_restored_by_a_new_task() -> Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.config()?;
    let schema = fixture.schema()?;

    let mut task = build_task(&config, &schema, ModelKind::BiRnn, TrainMode::Single, &Device::Cpu)?;
    assert_eq!(task.ckp_step(), -1);
    task.train(&fixture.test_feed()?)?;
    let written = task.save_model(&config.model_dir, 4)?;
    assert_eq!(written, fixture.model_dir().join("model-4.ckp"));
    assert_eq!(task.get_latest_checkpoint(&config.model_dir)?, 4);

    let restored = build_task(&config, &schema, ModelKind::BiRnn, TrainMode::Single, &Device::Cpu)?;
    assert_eq!(restored.ckp_step(), 4);

    let expected = named_parameters(task.scope())?;
    let actual = named_parameters(restored.scope())?;
    assert_eq!(expected.len(), actual.len());
    for ((name, a), (other, b)) in expected.iter().zip(&actual) {
        assert_eq!(name, other);
        let diff = a
            .as_tensor()
            .sub(b.as_tensor())?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert_eq!(diff, 0.0, "{name} differs after reload");
    }
    Ok(())
}

#[test]
fn checkpoint_of_another_model_is_rejected() -> Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.config()?;
    let schema = fixture.schema()?;

    let task = build_task(&config, &schema, ModelKind::Transformer, TrainMode::Single, &Device::Cpu)?;
    task.save_model(&config.model_dir, 0)?;

    let err = match build_task(&config, &schema, ModelKind::BiRnn, TrainMode::Single, &Device::Cpu) {
        Err(err) => err,
        Ok(_) => panic!("loading a transformer checkpoint into a BiRNN must fail"),
    };
    assert!(err.to_string().contains("checkpoint"));
    Ok(())
}

#[test]
fn explicit_step_can_be_loaded() -> Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.config()?;
    let schema = fixture.schema()?;

    let mut task = build_task(&config, &schema, ModelKind::BiRnn, TrainMode::Single, &Device::Cpu)?;
    task.save_model(&config.model_dir, 0)?;
    task.save_model(&config.model_dir, 1)?;
    assert_eq!(task.load_model(&config.model_dir, Some(0))?, 0);
    assert_eq!(task.ckp_step(), 0);
    assert!(task.load_model(&config.model_dir, Some(5)).is_err());
    Ok(())
}

#[test]
fn loading_from_an_empty_directory_resets_the_step() -> Result<()> {
    let fixture = Fixture::new()?;
    let config = fixture.config()?;
    let schema = fixture.schema()?;

    let mut task = build_task(&config, &schema, ModelKind::BiRnn, TrainMode::Single, &Device::Cpu)?;
    task.save_model(&config.model_dir, 4)?;
    assert_eq!(task.load_model(&config.model_dir, None)?, 4);
    assert_eq!(task.ckp_step(), 4);

    let empty = tempfile::tempdir()?;
    assert_eq!(task.load_model(empty.path(), None)?, -1);
    assert_eq!(task.ckp_step(), -1);
    Ok(())
}
