//! Model error types

use thiserror::Error;

/// Errors raised while interpreting configuration names
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("Unknown platform '{0}', expected one of: windows, macos, linux")]
    UnknownPlatform(String),

    #[error(
        "Unknown match key '{0}', expected one of: serial, vendor-product-serial, name-and-system-path"
    )]
    UnknownMatchKey(String),
}
