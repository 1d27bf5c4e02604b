//! Error types for scratchpad-runtime

use crate::net::NetError;
use crate::transpiler::TranspileError;
use scratchpad_pm::RegistryError;
use thiserror::Error;

/// Engine error type.
///
/// Every failure of a run is normalized into one of these variants before it
/// reaches the caller; the `Display` text is what ends up in
/// `RunResult::error`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Syntax or transform failure before execution started
    #[error("{0}")]
    Compile(String),

    /// Synchronous throw from guest code
    #[error("{0}")]
    Runtime(String),

    /// Guest code exceeded its wall-clock budget
    #[error("Script execution timed out after {0}ms")]
    Timeout(u64),

    /// `require` of a name that is neither builtin nor installed
    #[error(
        "Module \"{name}\" is not installed.\nInstall it from the package manager, then try again.\nInstalled modules: {installed}\nBuiltin modules: {builtins}"
    )]
    ModuleNotAllowed {
        name: String,
        installed: String,
        builtins: String,
    },

    /// `require` of an allowed name whose loading threw
    #[error(
        "Module \"{name}\" failed to load.\nMake sure the package is installed correctly. If you just installed it, restart the application and try again.\nError: {reason}"
    )]
    ModuleLoadFailed { name: String, reason: String },

    /// A tracked listener did not close cleanly
    #[error("Listener cleanup failed: {0}")]
    ListenerCleanup(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The worker thread is gone
    #[error("Engine worker is not running")]
    WorkerGone,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<TranspileError> for EngineError {
    fn from(err: TranspileError) -> Self {
        Self::Compile(err.to_string())
    }
}

impl From<rquickjs::Error> for EngineError {
    fn from(err: rquickjs::Error) -> Self {
        Self::Internal(format!("QuickJS: {err}"))
    }
}

/// Result type using EngineError
pub type EngineResult<T> = Result<T, EngineError>;
