pub mod parse;
pub mod types;
pub mod validation;

pub use parse::{parse_config, strip_jsonc_comments, ConfigFormat};
pub use types::{
    default_storage_root, ConnectorConfig, ListenConfig, ProxyCacheConfig, ProxyConfig,
    ReadinessConfig, RoutingConfig, SelectionPolicy, SharedStorageConfig, SideChannelConfig,
    StageServerConfig, StageTimeouts, StageTopology,
};
pub use validation::{
    validate_proxy_config, validate_stage_config, ValidationMessage, ValidationResult,
    ValidationSeverity,
};

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

// ============================================================================
// SBIO: I/O wrapper - thin layer over pure functions
// ============================================================================

fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, ConfigFormat::from_path(path))
}

fn check(result: ValidationResult) -> Result<(), ConfigError> {
    for msg in &result.messages {
        match msg.severity {
            ValidationSeverity::Info => info!("config: [{}] {}", msg.code, msg.message),
            ValidationSeverity::Warning => warn!("config: [{}] {}", msg.code, msg.message),
            ValidationSeverity::Error => {}
        }
    }
    if result.has_errors() {
        return Err(ConfigError::Invalid(result.errors()));
    }
    Ok(())
}

/// Load, parse and validate the proxy configuration
pub fn load_proxy_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = load_file(path)?;
    check(validate_proxy_config(&config))?;
    Ok(config)
}

/// Load, parse and validate a stage server configuration
pub fn load_stage_config(path: &Path) -> Result<StageServerConfig, ConfigError> {
    let config: StageServerConfig = load_file(path)?;
    check(validate_stage_config(&config))?;
    Ok(config)
}
