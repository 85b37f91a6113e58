//! Endpoint configuration over loaded capability libraries.
//!
//! Definitions are loaded into a [`Store`] as packages, sessions group the
//! packages and endpoint configuration of one user, and every mutation of
//! that configuration is followed by a consistency pass that keeps the
//! session notifications current.

pub mod consistency;
pub mod error;
pub mod feature;
pub mod ids;
pub mod impexp;
pub mod linker;
pub mod loader;
pub mod model;
pub mod notification;
pub mod package;
pub mod resolver;
pub mod session;
pub mod store;
pub mod validation;

pub use error::{Error, Result};
pub use feature::{toggle_feature, FeatureToggleOutcome};
pub use ids::*;
pub use loader::{load_definition, load_definition_files, LoadOptions, LoadResult};
pub use store::{Db, Store, Tables};

/// Version of the data model and file formats this crate understands.
///
/// Template manifests and exported sessions record the level they were
/// written for.
pub const FEATURE_LEVEL: u32 = 106;
