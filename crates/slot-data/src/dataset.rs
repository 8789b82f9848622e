use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ndarray::ArrayD;
use ndarray_npy::{NpzReader, ReadableElement};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::batch::{seq_lens_to_lod, FieldValues, RawBatch};
use crate::error::{DataError, Result};
use crate::schema::{SlotDType, SlotLevel, SlotSchema};

const DEFAULT_SEED: u64 = 42;

/// Streams batches of whole sequences out of a list of `.npz` archives.
///
/// Every call to [`NpzDataset::get_data_generator`] starts a new pass over the
/// archives. In shuffle mode each pass draws a fresh permutation of archive
/// order and of sequence order inside each archive.
#[derive(Debug)]
pub struct NpzDataset {
    archives: Vec<PathBuf>,
    schema: Arc<SlotSchema>,
    requested: Vec<String>,
    shuffle: bool,
    seed: u64,
    passes: AtomicU64,
}

impl NpzDataset {
    pub fn new<P: AsRef<Path>>(
        paths: &[P],
        schema_path: impl AsRef<Path>,
        requested_names: &[String],
        shuffle: bool,
    ) -> Result<Self> {
        let schema = SlotSchema::from_path(schema_path)?;
        Self::with_schema(paths, Arc::new(schema), requested_names, shuffle)
    }

    pub fn with_schema<P: AsRef<Path>>(
        paths: &[P],
        schema: Arc<SlotSchema>,
        requested_names: &[String],
        shuffle: bool,
    ) -> Result<Self> {
        let mut requested: Vec<String> = Vec::with_capacity(requested_names.len());
        for name in requested_names {
            schema.slot(name)?;
            if !requested.contains(name) {
                requested.push(name.clone());
            }
        }

        let archives = expand_archive_paths(paths)?;
        log::info!(
            "npz dataset with {} archive(s), {} field(s), shuffle={}",
            archives.len(),
            requested.len(),
            shuffle
        );

        Ok(Self {
            archives,
            schema,
            requested,
            shuffle,
            seed: DEFAULT_SEED,
            passes: AtomicU64::new(0),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn archive_paths(&self) -> &[PathBuf] {
        &self.archives
    }

    pub fn schema(&self) -> &SlotSchema {
        &self.schema
    }

    pub fn requested_names(&self) -> &[String] {
        &self.requested
    }

    pub fn get_data_generator(&self, batch_size: usize) -> Result<NpzBatchStream> {
        if batch_size == 0 {
            return Err(DataError::InvalidArgument(
                "batch_size must be greater than zero".to_string(),
            ));
        }

        let mut archives = self.archives.clone();
        let rng = if self.shuffle {
            let pass = self.passes.fetch_add(1, Ordering::Relaxed);
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(pass));
            archives.shuffle(&mut rng);
            Some(rng)
        } else {
            None
        };

        Ok(NpzBatchStream {
            archives,
            next_archive: 0,
            schema: Arc::clone(&self.schema),
            requested: self.requested.clone(),
            batch_size,
            rng,
            current: None,
            finished: false,
        })
    }
}

/// Lazy, finite iterator over the batches of one pass.
///
/// Archives are loaded one at a time. The first error ends the pass.
pub struct NpzBatchStream {
    archives: Vec<PathBuf>,
    next_archive: usize,
    schema: Arc<SlotSchema>,
    requested: Vec<String>,
    batch_size: usize,
    rng: Option<StdRng>,
    current: Option<LoadedArchive>,
    finished: bool,
}

impl NpzBatchStream {
    fn advance_archive(&mut self) -> Result<bool> {
        while self.next_archive < self.archives.len() {
            let path = &self.archives[self.next_archive];
            self.next_archive += 1;
            log::debug!(
                "reading archive {} of {} -> {}",
                self.next_archive,
                self.archives.len(),
                path.display()
            );

            let mut archive = read_archive(path, &self.schema, &self.requested)?;
            if archive.order.is_empty() {
                log::warn!("archive {} holds no sequences, skipping", path.display());
                continue;
            }
            if let Some(rng) = self.rng.as_mut() {
                archive.order.shuffle(rng);
            }
            self.current = Some(archive);
            return Ok(true);
        }

        Ok(false)
    }
}

impl Iterator for NpzBatchStream {
    type Item = Result<RawBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(archive) = self.current.as_mut() {
                if let Some(batch) = archive.next_batch(self.batch_size, &self.schema) {
                    return Some(batch);
                }
                self.current = None;
            }

            match self.advance_archive() {
                Ok(true) => continue,
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

struct LoadedArchive {
    seq_lens: Vec<usize>,
    item_lod: Vec<usize>,
    fields: BTreeMap<String, FieldValues>,
    order: Vec<usize>,
    cursor: usize,
}

impl LoadedArchive {
    fn next_batch(&mut self, batch_size: usize, schema: &SlotSchema) -> Option<Result<RawBatch>> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + batch_size).min(self.order.len());
        let sequences = &self.order[self.cursor..end];
        self.cursor = end;

        let seq_lens: Vec<usize> = sequences.iter().map(|&seq| self.seq_lens[seq]).collect();
        let item_rows: Vec<usize> = sequences
            .iter()
            .flat_map(|&seq| self.item_lod[seq]..self.item_lod[seq + 1])
            .collect();

        let mut fields = BTreeMap::new();
        for (name, values) in &self.fields {
            let level = match schema.slot(name) {
                Ok(spec) => spec.level,
                Err(err) => return Some(Err(err)),
            };
            let rows = match level {
                SlotLevel::User => sequences,
                SlotLevel::Item => item_rows.as_slice(),
            };
            fields.insert(name.clone(), values.select_rows(rows));
        }

        Some(Ok(RawBatch { seq_lens, fields }))
    }
}

fn read_archive(path: &Path, schema: &SlotSchema, requested: &[String]) -> Result<LoadedArchive> {
    let file = File::open(path).map_err(|err| DataError::archive(path, err.to_string()))?;
    let mut npz = NpzReader::new(file).map_err(|err| DataError::archive(path, err.to_string()))?;
    let entries = npz
        .names()
        .map_err(|err| DataError::archive(path, err.to_string()))?;

    let raw_lens: ArrayD<i64> = read_entry(&mut npz, &entries, path, &schema.seq_len_name)?;
    let mut seq_lens = Vec::with_capacity(raw_lens.len());
    for &len in raw_lens.iter() {
        if len < 0 {
            return Err(DataError::archive(
                path,
                format!("field '{}' holds negative length {len}", schema.seq_len_name),
            ));
        }
        seq_lens.push(len as usize);
    }
    let item_lod = seq_lens_to_lod(&seq_lens);
    let num_sequences = seq_lens.len();
    let num_items = item_lod[num_sequences];

    let mut fields = BTreeMap::new();
    for name in requested {
        let spec = schema.slot(name)?;
        let values = match spec.dtype {
            SlotDType::Int64 => FieldValues::Int64(read_entry(&mut npz, &entries, path, name)?),
            SlotDType::Float32 => FieldValues::Float32(read_entry(&mut npz, &entries, path, name)?),
        };

        if values.shape().is_empty() {
            return Err(DataError::archive(
                path,
                format!("field '{name}' is a scalar, expected one row per entry"),
            ));
        }
        let expected_rows = match spec.level {
            SlotLevel::User => num_sequences,
            SlotLevel::Item => num_items,
        };
        if values.rows() != expected_rows {
            return Err(DataError::archive(
                path,
                format!(
                    "field '{name}' has {} row(s) but {} are expected from '{}'",
                    values.rows(),
                    expected_rows,
                    schema.seq_len_name
                ),
            ));
        }
        if values.row_width() != spec.row_width() {
            return Err(DataError::archive(
                path,
                format!(
                    "field '{name}' rows hold {} value(s), schema declares {}",
                    values.row_width(),
                    spec.row_width()
                ),
            ));
        }
        fields.insert(name.clone(), values);
    }

    Ok(LoadedArchive {
        order: (0..num_sequences).collect(),
        seq_lens,
        item_lod,
        fields,
        cursor: 0,
    })
}

fn read_entry<T: ReadableElement>(
    npz: &mut NpzReader<File>,
    entries: &[String],
    path: &Path,
    name: &str,
) -> Result<ArrayD<T>> {
    // numpy.savez stores `name` as `name.npy`
    let stored = format!("{name}.npy");
    let key = if entries.iter().any(|entry| *entry == stored) {
        stored
    } else if entries.iter().any(|entry| entry == name) {
        name.to_string()
    } else {
        return Err(DataError::archive(path, format!("missing field '{name}'")));
    };

    npz.by_name(&key)
        .map_err(|err| DataError::archive(path, format!("field '{name}': {err}")))
}

/// Expands directories into their `.npz` children (sorted by name).
pub fn expand_archive_paths<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    for path in paths {
        let path = path.as_ref();
        if path.is_dir() {
            let mut children = Vec::new();
            for entry in fs::read_dir(path)? {
                let child = entry?.path();
                let is_npz = child.extension().map(|ext| ext == "npz").unwrap_or(false);
                if is_npz && child.is_file() {
                    children.push(child);
                }
            }
            children.sort();
            if children.is_empty() {
                log::warn!("directory {} contains no .npz archives", path.display());
            }
            archives.extend(children);
        } else if path.is_file() {
            archives.push(path.to_path_buf());
        } else {
            return Err(DataError::archive(path, "no such file or directory"));
        }
    }
    Ok(archives)
}
