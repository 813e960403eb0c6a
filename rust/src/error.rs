//! Error type shared by every generator and registry in the crate.

use thiserror::Error;

/// Errors that can occur while generating identifiers or handling node state.
#[derive(Error, Debug)]
pub enum IdError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Clock over-clocked: too many timestamps requested within one tick")]
    OverClocked,
    #[error("Postfix space exhausted: no unique identifier left in this tick ({postfix_digits} postfix digits)")]
    CapacityExhausted { postfix_digits: usize },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid node identifier: {0}")]
    InvalidNode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
