//! Firmware image model and `.cyacd` file parsing.

pub mod cyacd;
pub mod metadata;

// Re-export for convenience
pub use cyacd::{Image, Row};
pub use metadata::AppMetadata;
