//! HTTP handlers for tenant documents.

pub mod documents;
pub use documents::*;
