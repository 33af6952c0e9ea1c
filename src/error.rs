use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced at the guest-script boundary.
///
/// None of these are allowed to escape as panics; every call site converts
/// them into the containment result its contract demands (action rejected,
/// behavior idle, handler skipped, script not registered).
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script {path} failed to load: {reason}")]
    Load { path: String, reason: String },
    #[error("script {path} does not export required function {function}")]
    MissingExport { path: String, function: String },
    #[error("script {script}:{function} raised an error: {reason}")]
    Runtime {
        script: String,
        function: String,
        reason: String,
    },
    #[error("script {script}:{function} exceeded its {budget_ms}ms execution budget")]
    Timeout {
        script: String,
        function: String,
        budget_ms: u64,
    },
    #[error("event type {0} is not recognised")]
    UnknownEventType(String),
    #[error("script {} is not registered", .0.display())]
    NotRegistered(PathBuf),
}

impl ScriptError {
    /// True when the offending sandbox must be discarded rather than reused.
    pub fn poisons_sandbox(&self) -> bool {
        matches!(self, ScriptError::Timeout { .. })
    }
}
