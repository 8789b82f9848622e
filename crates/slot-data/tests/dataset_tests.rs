use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;
use slot_data::{BatchData, DataError, FieldValues, NpzDataset, SlotSchema};

const SCHEMA: &str = r#"{
    "seq_len_name": "seq_lens",
    "slots": {
        "user_id": { "level": "user", "dtype": "int64", "vocab_size": 100 },
        "item_id": { "level": "item", "dtype": "int64", "vocab_size": 1000 },
        "item_dense": { "level": "item", "dtype": "float32", "shape": [2] },
        "click_id": { "level": "item", "dtype": "int64" }
    }
}"#;

fn requested() -> Vec<String> {
    ["user_id", "item_id", "item_dense", "click_id"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

/// Writes an archive whose item ids encode `archive * 100 + sequence * 10 + position`.
fn write_archive(path: &Path, archive: i64, seq_lens: &[i64], compressed: bool) -> Result<()> {
    let num_items: i64 = seq_lens.iter().sum();
    let mut item_ids = Vec::new();
    for (seq, &len) in seq_lens.iter().enumerate() {
        for pos in 0..len {
            item_ids.push(archive * 100 + seq as i64 * 10 + pos);
        }
    }
    let user_ids: Vec<i64> = (0..seq_lens.len() as i64).map(|seq| archive * 10 + seq).collect();
    let clicks: Vec<i64> = item_ids.iter().map(|id| id % 2).collect();
    let dense = Array2::from_shape_fn((num_items as usize, 2), |(row, col)| {
        (row * 2 + col) as f32
    });

    let file = File::create(path)?;
    let mut npz = if compressed {
        NpzWriter::new_compressed(file)
    } else {
        NpzWriter::new(file)
    };
    npz.add_array("seq_lens.npy", &Array1::from(seq_lens.to_vec()))?;
    npz.add_array("user_id.npy", &Array1::from(user_ids))?;
    npz.add_array("item_id.npy", &Array1::from(item_ids))?;
    npz.add_array("item_dense.npy", &dense)?;
    npz.add_array("click_id.npy", &Array1::from(clicks))?;
    npz.finish()?;
    Ok(())
}

fn write_schema(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("schema.json");
    fs::write(&path, SCHEMA)?;
    Ok(path)
}

fn item_ids(batch: &slot_data::RawBatch) -> Vec<i64> {
    match batch.fields.get("item_id") {
        Some(FieldValues::Int64(values)) => values.iter().copied().collect(),
        other => panic!("unexpected item_id field: {other:?}"),
    }
}

#[test]
fn sequential_batches_never_span_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    let first = dir.path().join("part-0.npz");
    let second = dir.path().join("part-1.npz");
    write_archive(&first, 0, &[2, 3, 1], true)?;
    write_archive(&second, 1, &[4, 2], false)?;

    let dataset = NpzDataset::new(&[first, second], &schema_path, &requested(), false)?;
    let batches = dataset
        .get_data_generator(2)?
        .collect::<Result<Vec<_>, DataError>>()?;

    let seq_lens: Vec<Vec<usize>> = batches.iter().map(|batch| batch.seq_lens.clone()).collect();
    assert_eq!(seq_lens, vec![vec![2, 3], vec![1], vec![4, 2]]);

    assert_eq!(item_ids(&batches[0]), vec![0, 1, 10, 11, 12]);
    assert_eq!(item_ids(&batches[1]), vec![20]);
    assert_eq!(item_ids(&batches[2]), vec![100, 101, 102, 103, 110, 111]);

    match batches[1].fields.get("user_id") {
        Some(FieldValues::Int64(values)) => {
            assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![2]);
        }
        other => panic!("unexpected user_id field: {other:?}"),
    }
    match batches[1].fields.get("item_dense") {
        Some(FieldValues::Float32(values)) => {
            assert_eq!(values.shape(), &[1, 2]);
            assert_eq!(values.iter().copied().collect::<Vec<_>>(), vec![10.0, 11.0]);
        }
        other => panic!("unexpected item_dense field: {other:?}"),
    }
    Ok(())
}

#[test]
fn generator_restarts_on_every_call() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    let path = dir.path().join("data.npz");
    write_archive(&path, 0, &[1, 2, 3], true)?;

    let dataset = NpzDataset::new(&[path], &schema_path, &requested(), false)?;
    let first: Vec<_> = dataset.get_data_generator(4)?.collect::<Result<_, _>>()?;
    let second: Vec<_> = dataset.get_data_generator(4)?.collect::<Result<_, _>>()?;
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
    Ok(())
}

#[test]
fn shuffle_keeps_every_sequence_intact() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    write_archive(&dir.path().join("a.npz"), 0, &[1, 2, 3, 1, 2], true)?;
    write_archive(&dir.path().join("b.npz"), 1, &[3, 3, 1], true)?;

    let dataset = NpzDataset::new(&[dir.path()], &schema_path, &requested(), true)?.with_seed(7);
    assert_eq!(dataset.archive_paths().len(), 2);

    let schema = Arc::new(SlotSchema::from_path(&schema_path)?);
    let mut seen = BTreeSet::new();
    for batch in dataset.get_data_generator(3)? {
        let batch = BatchData::new(&schema, batch?)?;
        let field = batch.require("item_id")?;
        let ids: Vec<i64> = field.values.as_int64().unwrap().iter().copied().collect();
        for window in field.lod.windows(2) {
            let sequence = &ids[window[0]..window[1]];
            let archive = sequence[0] / 100;
            let seq = (sequence[0] % 100) / 10;
            for (pos, id) in sequence.iter().enumerate() {
                assert_eq!(*id, archive * 100 + seq * 10 + pos as i64);
            }
            assert!(seen.insert((archive, seq)));
        }
        let archives: BTreeSet<i64> = ids.iter().map(|id| id / 100).collect();
        assert_eq!(archives.len(), 1, "batch mixes archives");
    }
    assert_eq!(seen.len(), 8);
    Ok(())
}

#[test]
fn archive_with_inconsistent_lengths_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    let path = dir.path().join("broken.npz");

    let mut npz = NpzWriter::new(File::create(&path)?);
    npz.add_array("seq_lens.npy", &Array1::from(vec![2i64, 2]))?;
    npz.add_array("user_id.npy", &Array1::from(vec![0i64, 1]))?;
    npz.add_array("item_id.npy", &Array1::from(vec![0i64, 1, 2]))?;
    npz.add_array("item_dense.npy", &Array2::<f32>::zeros((4, 2)))?;
    npz.add_array("click_id.npy", &Array1::from(vec![0i64, 1, 0, 1]))?;
    npz.finish()?;

    let dataset = NpzDataset::new(&[path], &schema_path, &requested(), false)?;
    let results: Vec<_> = dataset.get_data_generator(8)?.collect();
    assert_eq!(results.len(), 1);
    let message = results[0].as_ref().unwrap_err().to_string();
    assert!(message.contains("broken.npz"), "{message}");
    assert!(message.contains("item_id"), "{message}");
    Ok(())
}

#[test]
fn unknown_requested_name_fails_construction() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    let path = dir.path().join("data.npz");
    write_archive(&path, 0, &[1], true)?;

    let err = NpzDataset::new(&[path], &schema_path, &["nope".to_string()], false).unwrap_err();
    assert!(matches!(err, DataError::UnknownSlot(name) if name == "nope"));
    Ok(())
}

#[test]
fn zero_batch_size_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let schema_path = write_schema(dir.path())?;
    let no_archives: Vec<PathBuf> = Vec::new();
    let dataset = NpzDataset::new(no_archives.as_slice(), &schema_path, &requested(), false)?;
    assert!(dataset.get_data_generator(0).is_err());
    assert_eq!(dataset.get_data_generator(1)?.count(), 0);
    Ok(())
}
