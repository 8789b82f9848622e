//! Slot-feature data handling for list-wise click models.
//!
//! Sessions are stored in `.npz` archives: one array per slot plus a
//! per-sequence length array. [`NpzDataset`] streams them as [`RawBatch`]es
//! and [`BatchData`] attaches the level-of-detail offsets the model needs.

pub mod batch;
pub mod dataset;
pub mod error;
pub mod schema;

pub use batch::{seq_lens_to_lod, sequence_unconcat, BatchData, FieldValues, LodField, RawBatch};
pub use dataset::{expand_archive_paths, NpzBatchStream, NpzDataset};
pub use error::{DataError, Result};
pub use schema::{SlotDType, SlotLevel, SlotSchema, SlotSpec};
