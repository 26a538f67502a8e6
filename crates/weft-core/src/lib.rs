//! weft-core: a multi-agent workflow execution platform.
//!
//! Workflows are declarative graphs of AI agent nodes. The executor
//! routes messages between nodes, each node invocation runs a bounded
//! tool loop through the pipeline, and every step, cost, and message is
//! recorded through the persistence port so invocations can be audited
//! and replayed.

pub mod ai;
pub mod config;
pub mod dsl;
pub mod error;
pub mod executor;
pub mod handoff;
pub mod model;
pub mod payload;
pub mod persistence;
pub mod pipeline;
pub mod redact;
pub mod spending;
pub mod strategy;
pub mod tools;
pub mod trace;

pub use error::{Result, WeftError};

use tracing::info;

/// Initialise a default tracing subscriber for the library consumer.
///
/// Call this once at program start. Uses `RUST_LOG` env var for filtering,
/// defaulting to `info` level.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).init();

    info!("weft tracing initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WeftError::Config("missing field".into());
        assert_eq!(err.to_string(), "config error: missing field");
    }

    #[test]
    fn persistence_error_conversion() {
        let perr = persistence::PersistenceError::Backend("driver blew up".into());
        let err: WeftError = perr.into();
        assert!(matches!(err, WeftError::Persistence(_)));
    }
}
