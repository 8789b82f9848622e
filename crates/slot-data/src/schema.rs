use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// Whether a field holds one row per sequence or one row per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotLevel {
    User,
    Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotDType {
    Int64,
    Float32,
}

/// Declaration of a single field stored in the archives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSpec {
    pub level: SlotLevel,
    pub dtype: SlotDType,
    /// Shape of one row, excluding the leading row axis. Empty means scalar rows.
    #[serde(default)]
    pub shape: Vec<usize>,
    /// Number of distinct ids for categorical (int64) slots.
    #[serde(default)]
    pub vocab_size: Option<usize>,
}

impl SlotSpec {
    pub fn row_width(&self) -> usize {
        self.shape.iter().product()
    }
}

fn default_seq_len_name() -> String {
    "seq_lens".to_string()
}

/// Field declarations shared by every archive of a dataset.
///
/// Loaded once from JSON:
///
/// ```json
/// {
///   "seq_len_name": "seq_lens",
///   "slots": {
///     "user_id": { "level": "user", "dtype": "int64", "vocab_size": 1000 },
///     "item_id": { "level": "item", "dtype": "int64", "vocab_size": 5000 },
///     "click_id": { "level": "item", "dtype": "int64" }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotSchema {
    #[serde(default = "default_seq_len_name")]
    pub seq_len_name: String,
    pub slots: BTreeMap<String, SlotSpec>,
}

impl SlotSchema {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let schema = Self::from_json_str(&contents)?;
        log::debug!(
            "loaded slot schema from {} with {} slot(s)",
            path.display(),
            schema.slots.len()
        );
        Ok(schema)
    }

    pub fn from_json_str(contents: &str) -> Result<Self> {
        let schema: SlotSchema = serde_json::from_str(contents)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.seq_len_name.trim().is_empty() {
            errors.push("seq_len_name must not be empty".to_string());
        }
        if self.slots.contains_key(&self.seq_len_name) {
            errors.push(format!(
                "'{}' is the sequence length field and cannot also be a slot",
                self.seq_len_name
            ));
        }
        if self.slots.is_empty() {
            errors.push("at least one slot must be declared".to_string());
        }

        for (name, spec) in &self.slots {
            if spec.shape.iter().any(|&dim| dim == 0) {
                errors.push(format!("slot '{name}' has a zero-sized dimension"));
            }
            match (spec.dtype, spec.vocab_size) {
                (SlotDType::Int64, Some(0)) => {
                    errors.push(format!("slot '{name}' must have a positive vocab_size"));
                }
                (SlotDType::Float32, Some(_)) => {
                    errors.push(format!("float slot '{name}' cannot declare a vocab_size"));
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DataError::Schema(errors.join("; ")))
        }
    }

    pub fn slot(&self, name: &str) -> Result<&SlotSpec> {
        self.slots
            .get(name)
            .ok_or_else(|| DataError::UnknownSlot(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"{
        "slots": {
            "user_id": { "level": "user", "dtype": "int64", "vocab_size": 10 },
            "item_feat": { "level": "item", "dtype": "float32", "shape": [3] },
            "click_id": { "level": "item", "dtype": "int64" }
        }
    }"#;

    #[test]
    fn parses_schema_with_defaults() {
        let schema = SlotSchema::from_json_str(SCHEMA).unwrap();
        assert_eq!(schema.seq_len_name, "seq_lens");
        assert_eq!(schema.slots.len(), 3);

        let user = schema.slot("user_id").unwrap();
        assert_eq!(user.level, SlotLevel::User);
        assert_eq!(user.row_width(), 1);
        assert_eq!(schema.slot("item_feat").unwrap().row_width(), 3);
    }

    #[test]
    fn unknown_slot_is_reported_by_name() {
        let schema = SlotSchema::from_json_str(SCHEMA).unwrap();
        match schema.slot("missing") {
            Err(DataError::UnknownSlot(name)) => assert_eq!(name, "missing"),
            other => panic!("expected unknown slot error, got {other:?}"),
        }
    }

    #[test]
    fn validation_collects_every_problem() {
        let raw = r#"{
            "seq_len_name": "seq_lens",
            "slots": {
                "seq_lens": { "level": "user", "dtype": "int64" },
                "bad_vocab": { "level": "item", "dtype": "int64", "vocab_size": 0 },
                "bad_shape": { "level": "item", "dtype": "float32", "shape": [0] }
            }
        }"#;
        let err = SlotSchema::from_json_str(raw).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sequence length field"));
        assert!(message.contains("bad_vocab"));
        assert!(message.contains("bad_shape"));
    }
}
