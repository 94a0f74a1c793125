//! Error types for the SCST configurator
//!
//! Provides structured error types for all configurator components including
//! configuration parsing, validation, kernel module loading, and control
//! filesystem operations.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for the configurator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("parse error at {file}:{line}:{column}: {message}\n    {excerpt}")]
    Parse {
        file: String,
        line: usize,
        column: usize,
        message: String,
        excerpt: String,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),

    // =========================================================================
    // Environment Errors
    // =========================================================================
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("required kernel module '{module}' failed to load: {reason}")]
    ModuleLoad { module: String, reason: String },

    // =========================================================================
    // Control Filesystem Errors
    // =========================================================================
    #[error("{}: {message}", .path.display())]
    Operation { path: PathBuf, message: String },

    #[error("operation on {} timed out after {seconds}s", .path.display())]
    Timeout { path: PathBuf, seconds: u64 },

    // =========================================================================
    // Run Outcome
    // =========================================================================
    #[error("convergence finished with {} failed operations", .failures.len())]
    PartialConvergence { failures: Vec<String> },

    #[error("convergence cancelled")]
    Cancelled,

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build an operation error for a control filesystem path.
    pub fn operation(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Error::Operation {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for errors that are raised before any mutation is attempted.
    ///
    /// Parse, validation and precondition failures always abort a run before
    /// the first write; operation errors can occur mid-run and may be
    /// aggregated instead of aborting.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(
            self,
            Error::Parse { .. }
                | Error::Validation(_)
                | Error::Precondition(_)
                | Error::ModuleLoad { .. }
        )
    }

    /// Process exit code for this error when surfaced by the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Parse { .. } | Error::Validation(_) => 2,
            _ => 1,
        }
    }
}

/// Result type alias for the configurator
pub type Result<T> = std::result::Result<T, Error>;
