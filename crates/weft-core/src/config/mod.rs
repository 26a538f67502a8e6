use std::path::Path;

use thiserror::Error;

mod schema;

pub use schema::{
    CoordinationType, ExecutorConfig, HandoffConfig, HandoffContentMode, MultiStepStrategy,
    PersistenceBackend, PersistenceConfig, PipelineConfig, SpendingConfig, WeftConfig,
    HARD_STEP_CAP,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadFailed {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("config validation error: {message}")]
    Validation { message: String },
}

/// Load and validate a `WeftConfig` from a TOML file path, then apply
/// environment overrides.
///
/// Returns the default config (plus env overrides) if the file does not
/// exist.
pub fn load_config(path: &Path) -> Result<WeftConfig, ConfigError> {
    let mut config = if path.exists() {
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source: e,
        })?;
        parse_config(&data)?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        WeftConfig::default()
    };

    apply_env_overrides(&mut config)?;
    validate(&config)?;
    Ok(config)
}

/// Parse and validate a `WeftConfig` from a TOML string.
pub fn parse_config(data: &str) -> Result<WeftConfig, ConfigError> {
    let config: WeftConfig = toml::from_str(data)?;
    validate(&config)?;
    Ok(config)
}

/// Environment overrides recognized at startup:
/// `SPENDING_CAP_USD`, and `WEFT_PERSISTENCE_BACKEND` (with the bare
/// `PERSISTENCE_BACKEND` spelling also honored).
fn apply_env_overrides(config: &mut WeftConfig) -> Result<(), ConfigError> {
    if let Ok(cap) = std::env::var("SPENDING_CAP_USD") {
        config.spending.cap_usd = cap.parse().map_err(|_| ConfigError::Validation {
            message: format!("SPENDING_CAP_USD is not a number: '{cap}'"),
        })?;
    }

    let backend = std::env::var("WEFT_PERSISTENCE_BACKEND")
        .or_else(|_| std::env::var("PERSISTENCE_BACKEND"))
        .ok();
    if let Some(backend) = backend {
        config.persistence.backend = match backend.as_str() {
            "memory" => PersistenceBackend::Memory,
            "sql" => PersistenceBackend::Sql,
            other => {
                return Err(ConfigError::Validation {
                    message: format!("unknown persistence backend '{other}'"),
                })
            }
        };
    }

    Ok(())
}

fn validate(config: &WeftConfig) -> Result<(), ConfigError> {
    if config.executor.max_nodes_per_invocation == 0 {
        return Err(ConfigError::Validation {
            message: "executor.max_nodes_per_invocation must be > 0".to_string(),
        });
    }

    if config.executor.wall_clock_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "executor.wall_clock_seconds must be > 0".to_string(),
        });
    }

    if config.pipeline.multi_step_max_rounds_default > HARD_STEP_CAP {
        return Err(ConfigError::Validation {
            message: format!(
                "pipeline.multi_step_max_rounds_default must be <= {HARD_STEP_CAP}, got {}",
                config.pipeline.multi_step_max_rounds_default
            ),
        });
    }

    if config.pipeline.single_call_max_steps_default > HARD_STEP_CAP {
        return Err(ConfigError::Validation {
            message: format!(
                "pipeline.single_call_max_steps_default must be <= {HARD_STEP_CAP}, got {}",
                config.pipeline.single_call_max_steps_default
            ),
        });
    }

    if !config.spending.cap_usd.is_finite() || config.spending.cap_usd < 0.0 {
        return Err(ConfigError::Validation {
            message: "spending.cap_usd must be a finite number >= 0".to_string(),
        });
    }

    if config.persistence.stale_cleanup_grace_seconds == 0 {
        return Err(ConfigError::Validation {
            message: "persistence.stale_cleanup_grace_seconds must be > 0".to_string(),
        });
    }

    Ok(())
}
