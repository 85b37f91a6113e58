use std::path::PathBuf;

use thiserror::Error;
use zcl_config::PackageId;

use crate::template::TemplateError;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Config(#[from] zcl_config::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid template manifest {}: {message}", .path.display())]
    InvalidManifest { path: PathBuf, message: String },

    #[error(
        "{} requires feature level {required}, this generator supports up to {supported}",
        .path.display()
    )]
    FeatureLevel {
        path: PathBuf,
        required: u32,
        supported: u32,
    },

    #[error("package {0} is not a template manifest")]
    NotAManifest(PackageId),

    #[error("generating {output} failed: {message}")]
    Output { output: String, message: String },
}

impl GenerationError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;
