//! Error types for kelp-runtime

use std::io;

use kelp_unit::UnitError;
use thiserror::Error;

use crate::engine::{Engine, ErrorKind, ExceptionReport, Thrown};

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A module delegate could not resolve a specifier
    #[error("could not resolve module '{specifier}' from '{referrer}': {reason}")]
    Resolution {
        /// Requested specifier
        specifier: String,
        /// Canonical name of the requesting module
        referrer: String,
        /// Why resolution failed
        reason: String,
    },

    /// Module source could not be loaded
    #[error("could not load module '{name}': {reason}")]
    Load {
        /// Canonical module name
        name: String,
        /// Why loading failed
        reason: String,
        /// Filesystem failure while loading startup files
        fatal: bool,
    },

    /// A delegate or script handed back a value of the wrong type
    #[error("{0}")]
    Type(String),

    /// The engine raised an exception (compile errors included); it is still
    /// pending in the engine
    #[error(transparent)]
    Thrown(#[from] Thrown),

    /// Corrupt or truncated serialized unit
    #[error("invalid serialized unit: {0}")]
    Unit(#[from] UnitError),

    /// Allocation of a runtime resource failed
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// A native extension module could not be loaded
    #[error("could not load native module '{name}': {reason}")]
    Native {
        /// Path of the shared library
        name: String,
        /// Loader error
        reason: String,
    },

    /// Signal number outside the supported range
    #[error("invalid signal number {0}")]
    InvalidSignal(i32),

    /// Operating system error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Worker creation or messaging failed
    #[error("worker error: {0}")]
    Worker(String),
}

impl RuntimeError {
    /// Create a load error
    pub fn load(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Load {
            name: name.into(),
            reason: reason.into(),
            fatal: false,
        }
    }

    /// Create a worker error
    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker(message.into())
    }

    /// Whether the error must terminate the process when it happens while
    /// loading startup files
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::Load { fatal: true, .. })
    }

    /// Script-visible class this error is raised as
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Resolution { .. } | RuntimeError::Worker(_) => ErrorKind::Error,
            RuntimeError::Load { .. } | RuntimeError::Native { .. } => ErrorKind::ReferenceError,
            RuntimeError::Type(_) => ErrorKind::TypeError,
            RuntimeError::InvalidSignal(_) => ErrorKind::RangeError,
            RuntimeError::Unit(_)
            | RuntimeError::Io(_)
            | RuntimeError::OutOfMemory(_)
            | RuntimeError::Thrown(_) => ErrorKind::InternalError,
        }
    }

    /// Turn this error into a pending exception inside `engine`.
    ///
    /// `Thrown` is passed through untouched so the engine's own exception
    /// reaches the caller unchanged.
    pub fn throw_into<E: Engine>(self, engine: &mut E) -> Thrown {
        match self {
            RuntimeError::Thrown(thrown) => thrown,
            RuntimeError::OutOfMemory(_) => engine.throw_out_of_memory(),
            other => engine.throw_error(other.error_kind(), &other.to_string()),
        }
    }
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// What a diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Exception escaped a job, callback or top-level evaluation
    Uncaught,
    /// Promise rejected with no handler attached by the end of a drain phase
    UnhandledRejection,
}

/// Sink for user-visible diagnostics
pub trait ErrorReporter {
    /// Print one diagnostic
    fn report(&self, kind: ReportKind, report: &ExceptionReport);
}

/// Writes diagnostics to stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrReporter;

impl ErrorReporter for StderrReporter {
    fn report(&self, kind: ReportKind, report: &ExceptionReport) {
        match kind {
            ReportKind::Uncaught => eprintln!("Uncaught {}", report.message),
            ReportKind::UnhandledRejection => {
                eprintln!("Possibly unhandled promise rejection: {}", report.message)
            }
        }
        if let Some(stack) = &report.stack {
            eprintln!("{stack}");
        }
    }
}
