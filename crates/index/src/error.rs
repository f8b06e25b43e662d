use config::ConfigError;
use ptable::PTableError;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt index: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Table(#[from] PTableError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IndexError {
    /// Errors that mean the on-disk index cannot be trusted and must be
    /// rebuilt from the log.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            IndexError::Corrupt(_) | IndexError::Table(PTableError::Corrupt(_))
        )
    }

    /// A read raced with the retirement of a table it was reading.
    #[must_use]
    pub fn is_table_retired(&self) -> bool {
        matches!(self, IndexError::Table(PTableError::TableRetired(_)))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
