use std::path::PathBuf;
use thiserror::Error;

/// Core error type for testmachine configuration and setup.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {field} pattern `{pattern}`: {source}")]
    InvalidRegex {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex_lite::Error,
    },

    #[error("Invalid router template `{template}`: {reason}")]
    InvalidRouter { template: String, reason: String },

    #[error("Failed to watch {path}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
