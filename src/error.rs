//! Error types for the microVM sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Driver or sandbox configuration is unusable
    #[error("Configuration error")]
    #[diagnostic(code(mvs::config))]
    Config(#[from] ConfigError),

    /// Request rejected by command policy
    #[error("Request rejected by policy")]
    #[diagnostic(code(mvs::policy))]
    Policy(#[from] PolicyError),

    /// Cost cap refused the execution
    #[error("Cost cap exceeded")]
    #[diagnostic(code(mvs::budget))]
    Budget(#[from] BudgetError),

    /// Sandbox lifecycle or execution failure
    #[error("Sandbox error")]
    #[diagnostic(code(mvs::sandbox))]
    Sandbox(#[from] SandboxError),

    /// Audit log failure
    #[error("Audit log error")]
    #[diagnostic(code(mvs::audit))]
    Audit(#[from] AuditError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(mvs::io))]
    Io(#[from] std::io::Error),
}

/// Errors in driver or sandbox configuration.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// A required binary or image is missing from disk
    #[error("Missing {kind}: {path}")]
    #[diagnostic(
        code(mvs::config::missing_artifact),
        help("Check the driver configuration paths before starting sandboxes")
    )]
    MissingArtifact { kind: &'static str, path: PathBuf },

    /// The same path appears in both read-only and temp sets
    #[error("Path {path} is listed as both read-only and temp")]
    #[diagnostic(
        code(mvs::config::overlapping_paths),
        help("read_only_paths and temp_paths must be disjoint")
    )]
    OverlappingPaths { path: PathBuf },

    /// The HMAC secret is empty
    #[error("Audit secret must not be empty")]
    #[diagnostic(
        code(mvs::config::empty_secret),
        help("Supply the shared HMAC secret externally; it is never defaulted")
    )]
    EmptySecret,

    /// Filesystem failure while preparing configuration-derived directories
    #[error("Failed to prepare {context}: {path}")]
    #[diagnostic(code(mvs::config::fs))]
    Filesystem {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Wraps an I/O error with the path it occurred on.
    pub fn fs(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            context,
            path: path.into(),
            source,
        }
    }
}

/// Errors from the command policy layer.
#[derive(Error, Debug, Diagnostic)]
pub enum PolicyError {
    /// The command is empty
    #[error("Command must not be empty")]
    #[diagnostic(code(mvs::policy::empty_command))]
    EmptyCommand,

    /// The command basename is not on the allowlist
    #[error("Command not allowed: {command}")]
    #[diagnostic(
        code(mvs::policy::not_allowed),
        help("Only a fixed set of interpreter and inspection commands may run in the sandbox")
    )]
    NotAllowed { command: String },
}

/// Errors from cost-cap accounting.
#[derive(Error, Debug, Diagnostic)]
pub enum BudgetError {
    /// The cost cap registry refused the reservation
    #[error("Tool {tool_id} is over budget")]
    #[diagnostic(
        code(mvs::budget::exceeded),
        help("The rejection has been recorded in the audit log")
    )]
    Exceeded { tool_id: String },
}

/// Errors from sandbox lifecycle and execution.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// No sandbox registered under this id
    #[error("Sandbox not found: {id}")]
    #[diagnostic(code(mvs::sandbox::not_found))]
    NotFound { id: String },

    /// Operation invalid for the sandbox's current lifecycle state
    #[error("Sandbox {id} is {actual}, operation requires {required}")]
    #[diagnostic(code(mvs::sandbox::invalid_state))]
    InvalidState {
        id: String,
        actual: &'static str,
        required: &'static str,
    },

    /// The hypervisor process could not be started
    #[error("Failed to spawn hypervisor: {0}")]
    #[diagnostic(code(mvs::sandbox::spawn))]
    SpawnFailed(String),

    /// The hypervisor process could not be stopped
    #[error("Failed to stop hypervisor: {0}")]
    #[diagnostic(code(mvs::sandbox::stop))]
    StopFailed(String),

    /// Guest dispatch failed
    #[error("Execution failed: {0}")]
    #[diagnostic(code(mvs::sandbox::exec))]
    ExecutionFailed(String),

    /// Filesystem failure during sandbox setup or teardown
    #[error("Sandbox filesystem error: {context}")]
    #[diagnostic(code(mvs::sandbox::fs))]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the audit log.
#[derive(Error, Debug, Diagnostic)]
pub enum AuditError {
    /// The event payload could not be canonicalized
    #[error("Failed to encode audit event: {0}")]
    #[diagnostic(code(mvs::audit::encode))]
    Encode(#[from] serde_json::Error),

    /// The record could not be appended to durable storage
    #[error("Failed to write audit record: {path}")]
    #[diagnostic(
        code(mvs::audit::write),
        help("Audit writes are fail-open: the sandbox operation continues, but the gap is operator-visible")
    )]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The log file could not be read for verification
    #[error("Failed to read audit log: {path}")]
    #[diagnostic(code(mvs::audit::read))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
