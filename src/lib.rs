//! Runtime stub for self-extracting application bundles.
//!
//! The stub finds the descriptor and payload appended to its own image,
//! unpacks the payload once into a per-identifier cache directory and runs
//! the configured command from there.

pub mod error;
pub mod extract;
pub mod footer;
pub mod image;
pub mod launch;
pub mod progress;
pub mod settings;
pub mod staging;


pub use error::{CaxaError, CaxaResult};
