//! Why a settings load was refused.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {} is not valid JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The merged document no longer matches [`crate::ParleySettings`].
    #[error("settings do not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),

    #[error("{field} must be at least {min}")]
    BelowMinimum { field: &'static str, min: u64 },
}

impl SettingsError {
    /// The settings key at fault, when one is known.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::BelowMinimum { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
