//! Shared plumbing: errors and network utilities

pub mod error;
pub mod net;

pub use error::{Error, Result};
