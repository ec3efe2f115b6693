//! Common utilities and types shared across the XRegion Sync crates.
//!
//! This module provides the error type every layer reports through and the
//! small value types (tags, catalog filters) that cross the provider boundary.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{Filter, Tag};
