//! Startup validation of proxy and stage configuration
//!
//! Configuration is checked once before anything binds or connects. Errors
//! stop startup; warnings are logged and startup continues.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::types::{ConnectorConfig, ProxyConfig, StageServerConfig};
use crate::context::StageRole;

/// Validation result with severity levels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ValidationSeverity {
    /// Informational hint
    Info,
    /// Warning - may work but suboptimal
    Warning,
    /// Error - will not start
    Error,
}

/// A single validation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: ValidationSeverity,
    pub code: String,
    pub message: String,
    pub suggestion: Option<String>,
}

/// Validation result containing all messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub messages: Vec<ValidationMessage>,
    pub passed: bool,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            passed: true,
        }
    }

    pub fn add(&mut self, msg: ValidationMessage) {
        if msg.severity == ValidationSeverity::Error {
            self.passed = false;
        }
        self.messages.push(msg);
    }

    pub fn info(mut self, code: &str, message: &str) -> Self {
        self.add(ValidationMessage {
            severity: ValidationSeverity::Info,
            code: code.to_string(),
            message: message.to_string(),
            suggestion: None,
        });
        self
    }

    pub fn warning(mut self, code: &str, message: &str, suggestion: Option<&str>) -> Self {
        self.add(ValidationMessage {
            severity: ValidationSeverity::Warning,
            code: code.to_string(),
            message: message.to_string(),
            suggestion: suggestion.map(String::from),
        });
        self
    }

    pub fn error(mut self, code: &str, message: &str, suggestion: Option<&str>) -> Self {
        self.add(ValidationMessage {
            severity: ValidationSeverity::Error,
            code: code.to_string(),
            message: message.to_string(),
            suggestion: suggestion.map(String::from),
        });
        self
    }

    pub fn has_errors(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.severity == ValidationSeverity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.severity == ValidationSeverity::Warning)
    }

    pub fn errors(&self) -> Vec<String> {
        self.of(ValidationSeverity::Error)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.of(ValidationSeverity::Warning)
    }

    fn of(&self, severity: ValidationSeverity) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| m.severity == severity)
            .map(|m| format!("[{}] {}", m.code, m.message))
            .collect()
    }
}

// ============================================================================
// SBIO: Pure validation logic (no I/O)
// ============================================================================

fn check_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("unsupported scheme '{}'", other)),
    }
}

/// Validate the proxy's stage topology, timeouts and cache settings
pub fn validate_proxy_config(config: &ProxyConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    for role in StageRole::ALL {
        let endpoints = config.stages.endpoints(role);

        if endpoints.is_empty() {
            result = match role {
                StageRole::Encode => result.warning(
                    "NO_ENCODE_STAGE",
                    "No encode endpoints configured; multimodal requests will fail",
                    Some("Add at least one URL under stages.encode"),
                ),
                _ => result.error(
                    "MISSING_STAGE",
                    &format!("No {} endpoints configured", role),
                    Some(&format!("Add at least one URL under stages.{}", role)),
                ),
            };
            continue;
        }

        let mut seen = HashSet::new();
        for url in endpoints {
            if let Err(reason) = check_url(url) {
                result = result.error(
                    "INVALID_URL",
                    &format!("{} endpoint '{}' is not a valid URL: {}", role, url, reason),
                    None,
                );
            }
            if !seen.insert(url.trim_end_matches('/')) {
                result = result.error(
                    "DUPLICATE_ENDPOINT",
                    &format!("{} endpoint '{}' is listed twice", role, url),
                    None,
                );
            }
        }

        if config.routing.timeouts.for_role(role).is_zero() {
            result = result.error(
                "ZERO_TIMEOUT",
                &format!("Timeout for {} stage must be greater than zero", role),
                None,
            );
        }
    }

    let listed = |role: StageRole, url: &str| {
        config
            .stages
            .endpoints(role)
            .iter()
            .any(|e| e.trim_end_matches('/') == url.trim_end_matches('/'))
    };
    for (prefill, decode) in &config.stages.pairs {
        if !listed(StageRole::Prefill, prefill) {
            result = result.error(
                "UNKNOWN_PAIR_ENDPOINT",
                &format!("Pair key '{}' is not a prefill endpoint", prefill),
                Some("Keys of stages.pairs must appear in stages.prefill"),
            );
        }
        if !listed(StageRole::Decode, decode) {
            result = result.error(
                "UNKNOWN_PAIR_ENDPOINT",
                &format!("Pair target '{}' is not a decode endpoint", decode),
                Some("Values of stages.pairs must appear in stages.decode"),
            );
        }
    }
    if config.stages.decode.len() > 1 {
        for prefill in &config.stages.prefill {
            let paired = config
                .stages
                .pairs
                .keys()
                .any(|k| k.trim_end_matches('/') == prefill.trim_end_matches('/'));
            if !paired {
                result = result.warning(
                    "UNPAIRED_PREFILL",
                    &format!(
                        "Prefill '{}' has no decode pair; its requests may decode on any endpoint",
                        prefill
                    ),
                    Some("Map it under stages.pairs when prefill pushes KV over a side channel"),
                );
            }
        }
    }

    if config.routing.connect_timeout_ms == 0 {
        result = result.error(
            "ZERO_TIMEOUT",
            "routing.connect_timeout_ms must be greater than zero",
            None,
        );
    }

    if config.readiness.poll_interval_ms == 0 {
        result = result.error(
            "ZERO_POLL_INTERVAL",
            "readiness.poll_interval_ms must be greater than zero",
            None,
        );
    }
    if config.readiness.startup_timeout_secs == 0 {
        result = result.error(
            "ZERO_TIMEOUT",
            "readiness.startup_timeout_secs must be greater than zero",
            None,
        );
    }
    if config.readiness.recheck_interval_secs == Some(0) {
        result = result.error(
            "ZERO_RECHECK_INTERVAL",
            "readiness.recheck_interval_secs must be greater than zero when set",
            Some("Remove the field to disable re-checking"),
        );
    }

    if config.max_concurrent_requests == Some(0) {
        result = result.error(
            "ZERO_CONCURRENCY",
            "max_concurrent_requests must be greater than zero when set",
            None,
        );
    }

    match &config.cache.shared_storage {
        Some(storage) if storage.root.trim().is_empty() => {
            result = result.error("EMPTY_STORAGE_ROOT", "cache.shared_storage.root is empty", None);
        }
        Some(_) => {}
        None if !config.stages.encode.is_empty() => {
            result = result.info(
                "NO_PROXY_CLEANUP",
                "cache.shared_storage not set; encoder artifacts of failed requests are left to eviction",
            );
        }
        None => {}
    }

    result
}

fn validate_connector(
    mut result: ValidationResult,
    field: &str,
    connector: &ConnectorConfig,
    consumer: bool,
) -> ValidationResult {
    match connector {
        ConnectorConfig::SharedStorage(cfg) => {
            if cfg.root.trim().is_empty() {
                result = result.error(
                    "EMPTY_STORAGE_ROOT",
                    &format!("{}.root is empty", field),
                    None,
                );
            }
        }
        ConnectorConfig::SideChannel(cfg) => {
            if consumer && cfg.listen.is_none() {
                result = result.error(
                    "SIDE_CHANNEL_NO_LISTEN",
                    &format!("{} uses the side channel but sets no listen address", field),
                    Some("Set a fixed listen address the producer's peer points at"),
                );
            }
            if !consumer && cfg.peer.is_none() {
                result = result.error(
                    "SIDE_CHANNEL_NO_PEER",
                    &format!("{} uses the side channel but sets no peer address", field),
                    Some("Point peer at the consumer's side-channel listen address"),
                );
            }
            if matches!(cfg.listen, Some(addr) if addr.port() == 0) {
                result = result.warning(
                    "SIDE_CHANNEL_EPHEMERAL_PORT",
                    &format!("{}.listen uses port 0; producers cannot know the address", field),
                    None,
                );
            }
            if cfg.connect_timeout_ms == 0 || cfg.transfer_timeout_ms == 0 {
                result = result.error(
                    "ZERO_TIMEOUT",
                    &format!("{} timeouts must be greater than zero", field),
                    None,
                );
            }
        }
    }
    result
}

/// Validate that a stage's connectors match its role
pub fn validate_stage_config(config: &StageServerConfig) -> ValidationResult {
    let mut result = ValidationResult::new();
    let role = config.role;

    if config.listen.port == 0 {
        result = result.error("NO_PORT", "listen.port must be set for a stage", None);
    }

    match (&config.consumes, role.producer()) {
        (Some(_), None) => {
            result = result.error(
                "UNEXPECTED_CONSUMER",
                &format!("The {} stage has no upstream artifact to consume", role),
                Some("Remove the consumes section"),
            );
        }
        (None, Some(producer)) => {
            let message = format!(
                "The {} stage cannot recover {} artifacts without a consumes connector",
                role, producer
            );
            result = if role == StageRole::Prefill {
                // Text-only traffic skips encode, so prefill can run without one
                result.warning("NO_CONSUMER", &message, None)
            } else {
                result.error("NO_CONSUMER", &message, None)
            };
        }
        (Some(connector), Some(_)) => {
            result = validate_connector(result, "consumes", connector, true);
        }
        (None, None) => {}
    }

    match (&config.produces, role.consumer()) {
        (Some(_), None) => {
            result = result.error(
                "UNEXPECTED_PRODUCER",
                &format!("The {} stage has no downstream consumer", role),
                Some("Remove the produces section"),
            );
        }
        (None, Some(consumer)) => {
            result = result.error(
                "NO_PRODUCER",
                &format!(
                    "The {} stage must publish artifacts for the {} stage",
                    role, consumer
                ),
                None,
            );
        }
        (Some(connector), Some(_)) => {
            result = validate_connector(result, "produces", connector, false);
        }
        (None, None) => {}
    }

    if config.eviction_interval_secs == 0 {
        result = result.error(
            "ZERO_EVICTION_INTERVAL",
            "eviction_interval_secs must be greater than zero",
            None,
        );
    }

    result
}
