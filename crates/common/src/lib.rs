//! Metal Provider Common Library
//!
//! Shared types and errors for reconciling bare-metal machines.

pub mod drift;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use drift::{DriftReport, FieldDrift};
pub use error::{Error, Operation, Result};
pub use types::*;

/// Provider version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
