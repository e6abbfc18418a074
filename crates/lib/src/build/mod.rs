//! Build context assembly.
//!
//! A build context is the reproducible input to the external image builder:
//! the parser source plus a generated recipe, packed into a deterministic
//! archive and published to staging under its content hash.
//!
//! # Submodules
//!
//! - [`archive`] - Deterministic tar.gz packaging
//! - [`assemble`] - Fetch, fingerprint, package and publish
//! - [`recipe`] - Per-runtime recipe templates
//! - [`staging`] - Storage for published archives

pub mod archive;
pub mod assemble;
pub mod recipe;
pub mod staging;
mod types;

pub use assemble::{BuildContextAssembler, fingerprint};
pub use recipe::{RecipeSet, RecipeTemplate};
pub use staging::{FsStagingStore, MemoryStagingStore, StagingError, StagingStore};
pub use types::*;
