//! Application-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid source/endpoint configuration. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The external binary could not be launched.
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable filesystem failure while preparing the segment cache.
    #[error("Cache initialization failed at {path}: {source}")]
    CacheInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The restart policy gave up on a process.
    #[error("{name} gave up after {attempts} attempts")]
    MaxAttemptsExceeded { name: String, attempts: u32 },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether a restart could ever fix this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::CacheInit { .. } | Self::MaxAttemptsExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::config("SOURCE_URL is not set").is_fatal());
        assert!(
            Error::MaxAttemptsExceeded {
                name: "capture".to_string(),
                attempts: 15
            }
            .is_fatal()
        );
        assert!(!Error::spawn("ffmpeg", std::io::Error::other("missing")).is_fatal());
        assert!(!Error::not_found("endpoint", "backup").is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::io_path(
            "reading checkpoint",
            Path::new("/tmp/cache/checkpoint.json"),
            std::io::Error::other("denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("reading checkpoint"));
        assert!(msg.contains("checkpoint.json"));
    }
}
