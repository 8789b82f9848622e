use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse slot schema: {0}")]
    SchemaFormat(#[from] serde_json::Error),

    #[error("invalid slot schema: {0}")]
    Schema(String),

    #[error("unknown slot '{0}'")]
    UnknownSlot(String),

    #[error("npz archive {}: {message}", path.display())]
    Archive { path: PathBuf, message: String },

    #[error("invalid batch: {0}")]
    Batch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DataError {
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
