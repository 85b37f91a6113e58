//! Code generation from endpoint configurations.
//!
//! A template manifest names the templates to render, the helper files and
//! partials they use, an optional type override file, options offered to the
//! user and extension properties added onto loaded entities. Loading it
//! records one package per file (see [`manifest`]); [`generate`] then renders
//! every template against the configuration of a session.

pub mod context;
pub mod engine;
pub mod error;
pub mod helpers;
pub mod manifest;
pub mod output;
pub mod template;

pub use engine::{
    content_index, generate, generate_single_file_for_preview, GenerateOptions, GenerationResult,
    DEFAULT_LINES_PER_BLOCK,
};
pub use error::{GenerationError, Result};
pub use manifest::{load_manifest, read_manifest, record_manifest, ManifestPlan};
pub use output::{generate_and_write_files, GenerationManifest, WriteOptions};
