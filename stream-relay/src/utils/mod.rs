//! Shared helpers.

pub mod fs;
pub mod redact;
pub mod url;
