#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::Result;
use candle_core::Device;
use ndarray::{Array1, Array2};
use ndarray_npy::NpzWriter;
use slot_data::{BatchData, NpzDataset, SlotSchema};
use tempfile::TempDir;
use training::{Config, FeedConvertor, TrainFeed};

pub const EXP: &str = "demo";

const SCHEMA: &str = r#"{
    "seq_len_name": "seq_lens",
    "slots": {
        "user_id": { "level": "user", "dtype": "int64", "vocab_size": 16 },
        "item_id": { "level": "item", "dtype": "int64", "vocab_size": 64 },
        "item_dense": { "level": "item", "dtype": "float32", "shape": [2] },
        "click_id": { "level": "item", "dtype": "int64" }
    }
}"#;

const EXPERIMENT: &str = r#"
npz_config_path = "schema.json"
train_npz_list = ["data/train"]
test_npz_list = ["data/test/part-0.npz"]
user_slot_names = ["user_id"]
item_slot_names = ["item_id", "item_dense"]
batch_size = 3
lr = 0.01
max_train_steps = 2
prt_interval = 1
model_dir = "out/model"
summary_dir = "out/summary"

[model]
embed_size = 4
hidden_size = 8
num_heads = 2
max_seq_len = 16
"#;

/// A temporary experiment: schema, train/test archives and `<exp>.toml`.
pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        Self::with_experiment(EXPERIMENT)
    }

    pub fn with_experiment(experiment: &str) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path();
        fs::write(root.join("schema.json"), SCHEMA)?;
        fs::write(root.join(format!("{EXP}.toml")), experiment)?;

        fs::create_dir_all(root.join("data/train"))?;
        fs::create_dir_all(root.join("data/test"))?;
        write_archive(&root.join("data/train/part-0.npz"), 0, &[3, 2, 4, 1])?;
        write_archive(&root.join("data/train/part-1.npz"), 1, &[2, 5, 3])?;
        write_archive(&root.join("data/test/part-0.npz"), 2, &[4, 3, 1, 2])?;
        Ok(Self { dir })
    }

    /// Replaces the archive at `relative` with sequences of the given lengths.
    pub fn rewrite_archive(&self, relative: &str, archive: i64, seq_lens: &[i64]) -> Result<()> {
        write_archive(&self.root().join(relative), archive, seq_lens)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn model_dir(&self) -> PathBuf {
        self.root().join("out/model")
    }

    pub fn summary_dir(&self) -> PathBuf {
        self.root().join("out/summary")
    }

    pub fn config(&self) -> Result<Config> {
        Ok(Config::for_experiment(self.root(), EXP)?)
    }

    pub fn schema(&self) -> Result<SlotSchema> {
        Ok(SlotSchema::from_path(self.root().join("schema.json"))?)
    }

    pub fn convertor(&self) -> Result<FeedConvertor> {
        let config = self.config()?;
        Ok(FeedConvertor::new(
            config.user_slot_names.clone(),
            config.item_slot_names.clone(),
            config.label_name.clone(),
            Device::Cpu,
        ))
    }

    /// The whole test archive as one batch.
    pub fn test_batch(&self) -> Result<BatchData> {
        let config = self.config()?;
        let schema = self.schema()?;
        let dataset = NpzDataset::new(
            &config.test_npz_list,
            self.root().join("schema.json"),
            &config.requested_npz_names,
            false,
        )?;
        let raw = dataset
            .get_data_generator(64)?
            .next()
            .expect("test archive yields a batch")?;
        Ok(BatchData::new(&schema, raw)?)
    }

    pub fn test_feed(&self) -> Result<TrainFeed> {
        Ok(self.convertor()?.train_test(&self.test_batch()?)?)
    }
}

fn write_archive(path: &Path, archive: i64, seq_lens: &[i64]) -> Result<()> {
    let num_items: i64 = seq_lens.iter().sum();
    let item_ids: Vec<i64> = (0..num_items).map(|i| (archive * 17 + i * 5) % 64).collect();
    let user_ids: Vec<i64> = (0..seq_lens.len() as i64).map(|s| (archive * 3 + s) % 16).collect();
    let clicks: Vec<i64> = item_ids.iter().map(|id| (id / 3) % 2).collect();
    let dense = Array2::from_shape_fn((num_items as usize, 2), |(row, col)| {
        ((row + col) % 5) as f32 / 5.0
    });

    let mut npz = NpzWriter::new_compressed(File::create(path)?);
    npz.add_array("seq_lens.npy", &Array1::from(seq_lens.to_vec()))?;
    npz.add_array("user_id.npy", &Array1::from(user_ids))?;
    npz.add_array("item_id.npy", &Array1::from(item_ids))?;
    npz.add_array("item_dense.npy", &dense)?;
    npz.add_array("click_id.npy", &Array1::from(clicks))?;
    npz.finish()?;
    Ok(())
}
