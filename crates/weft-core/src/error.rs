use thiserror::Error;

use crate::persistence::PersistenceError;

/// Top-level error type for the weft-core library.
///
/// Tool and AI failures that happen *inside* a node invocation are not
/// errors at this level: they become `error` steps in the trace. Variants
/// here are the failures that cross a node boundary or are rejected at an
/// input boundary.
#[derive(Debug, Error)]
pub enum WeftError {
    /// Schema or invariant violation at a boundary. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// The process-wide spending cap was reached.
    #[error("spending cap exceeded: ${total:.4} spent against limit ${limit:.2}")]
    SpendingExceeded { limit: f64, total: f64 },

    /// A tool could not be resolved or initialized.
    #[error("tool error: {0}")]
    Tool(String),

    /// Provider-connectivity fault the caller cannot recover from.
    #[error("ai provider error: {0}")]
    AiProvider(String),

    /// Wraps a persistence port error after retries are exhausted.
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// The cancellation token fired at a suspension point.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The DSL carries a schema version this build does not understand.
    /// Refused at version creation, never at run time.
    #[error("unsupported dsl schema version {found} (this build supports {supported})")]
    SchemaVersion { found: u32, supported: u32 },

    /// Configuration parse or validation error.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, WeftError>;
