//! Worker error types.
//!
//! All errors are explicit enum variants - no `Box<dyn Error>`, no
//! `anyhow::Result` anywhere in library code.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::HandlerName;

/// Top-level error type for the worker core.
#[derive(Debug, Error)]
pub enum WorkerError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Handler Lifecycle Errors
    // =========================================================================
    #[error("invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    // =========================================================================
    // Import Cache Errors
    // =========================================================================
    #[error("import cache error: {0}")]
    Cache(#[from] CacheError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Hard validation errors prevent the worker from starting.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// State transition errors for the handler state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("cannot transition from {from} to {to} for handler {handler}")]
    InvalidTransition {
        handler: HandlerName,
        from: &'static str,
        to: &'static str,
    },
}

/// Error returned by the container runtime driver.
///
/// The driver is an external collaborator; every operation it exposes may
/// fail and the failure surfaces to the invocation caller unchanged.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime {op} failed for {name}: {reason}")]
    Driver {
        op: &'static str,
        name: String,
        reason: String,
    },
}

/// Error returned by a sandbox or the cache factory.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox {op} failed: {reason}")]
    Op { op: &'static str, reason: String },
}

/// Import cache errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no fork server available to satisfy the request")]
    NoServers,

    #[error("cache entry failed to initialize after {timeout_secs}s")]
    EntryInitTimeout { timeout_secs: u64 },

    #[error("readiness pipe desync: expected {expected} bytes, read {read}")]
    ReadinessMalformed { expected: usize, read: usize },

    #[error("failed to open readiness pipe {path}: {source}")]
    PipeOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("readiness pipe read failed: {source}")]
    PipeRead {
        #[source]
        source: io::Error,
    },

    #[error("fork request to {sock_path} failed: {reason}")]
    ForkRequest { sock_path: PathBuf, reason: String },

    #[error("package size catalog {path} malformed at line {line}: {reason}")]
    CatalogMalformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Result type alias using WorkerError.
pub type WorkerResult<T> = Result<T, WorkerError>;
