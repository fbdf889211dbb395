//! Run-wide registries shared by every step.
//!
//! - [`DuplicateKeyTracker`]: enforces `_key` uniqueness across the run
//! - [`TypeTracker`]: counts the `_type`s each step writes

mod duplicate_keys;
mod type_tracker;

pub use duplicate_keys::{DuplicateKeyError, DuplicateKeyTracker, KeyMetadata};
pub use type_tracker::{TypeSummary, TypeTracker};
