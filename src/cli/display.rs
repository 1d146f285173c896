//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use std::path::Path;

use crate::config::{
    ConnectorConfig, ProxyConfig, StageServerConfig, ValidationResult, ValidationSeverity,
};
use crate::context::StageRole;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect::<Vec<_>>()
            .join("   ");
        output.push_str(line.trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

fn describe_connector(connector: &ConnectorConfig) -> String {
    match connector {
        ConnectorConfig::SharedStorage(cfg) => {
            let mut text = format!("shared_storage {}", cfg.root);
            if cfg.single_read {
                text.push_str(" (single read)");
            }
            text
        }
        ConnectorConfig::SideChannel(cfg) => {
            let mut parts = vec!["side_channel".to_string()];
            if let Some(listen) = cfg.listen {
                parts.push(format!("listen {}", listen));
            }
            if let Some(peer) = cfg.peer {
                parts.push(format!("peer {}", peer));
            }
            parts.join(" ")
        }
    }
}

// ============================================================================
// Proxy and stage summaries
// ============================================================================

/// Format a dry-run output showing the stage topology.
pub fn format_dry_run(config: &ProxyConfig, path: &Path) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "epd-proxy v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n", path.display()));
    output.push_str(&format!("Listen: {}\n", config.listen.addr()));
    output.push_str(&format!("Model:  {}\n\n", config.model));

    let rows = StageRole::ALL
        .into_iter()
        .flat_map(|role| {
            let timeout = config.routing.timeouts.for_role(role);
            config
                .stages
                .endpoints(role)
                .iter()
                .map(move |url| vec![role.to_string(), url.clone(), format!("{}s", timeout.as_secs())])
        })
        .collect();
    output.push_str("Stages:\n");
    output.push_str(&format_table(&["role", "url", "deadline"], rows));
    output.push('\n');

    if !config.stages.pairs.is_empty() {
        output.push_str("Pairs:\n");
        for (prefill, decode) in &config.stages.pairs {
            output.push_str(&format!("  {} -> {}\n", prefill, decode));
        }
        output.push('\n');
    }

    output.push_str(&format!("Selection: {:?}\n", config.routing.policy));
    output.push_str(&format!(
        "Readiness: {}s deadline, poll every {}ms",
        config.readiness.startup_timeout_secs, config.readiness.poll_interval_ms
    ));
    match config.readiness.recheck_interval_secs {
        Some(secs) => output.push_str(&format!(", re-check every {}s\n", secs)),
        None => output.push('\n'),
    }
    if let Some(storage) = &config.cache.shared_storage {
        output.push_str(&format!("Cleanup:   shared_storage {}\n", storage.root));
    }

    output.push_str("\nValidation: PASSED\n");
    output.push_str("Ready to start proxy. Remove --dry-run to execute.\n");

    output
}

/// One-line description of a stage server's handoff wiring
pub fn format_stage_summary(config: &StageServerConfig) -> String {
    let consumes = config
        .consumes
        .as_ref()
        .map(describe_connector)
        .unwrap_or_else(|| "-".to_string());
    let produces = config
        .produces
        .as_ref()
        .map(describe_connector)
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} stage on {} (consumes: {}, produces: {})",
        config.role,
        config.listen.addr(),
        consumes,
        produces
    )
}

/// Format validation messages, errors first
pub fn format_validation(result: &ValidationResult) -> String {
    let mut output = String::new();

    for severity in [
        ValidationSeverity::Error,
        ValidationSeverity::Warning,
        ValidationSeverity::Info,
    ] {
        for msg in result.messages.iter().filter(|m| m.severity == severity) {
            let label = match msg.severity {
                ValidationSeverity::Error => "error",
                ValidationSeverity::Warning => "warning",
                ValidationSeverity::Info => "info",
            };
            output.push_str(&format!("{:7} [{}] {}\n", label, msg.code, msg.message));
            if let Some(ref suggestion) = msg.suggestion {
                output.push_str(&format!("        hint: {}\n", suggestion));
            }
        }
    }

    output.push_str(if result.passed {
        "Validation: PASSED\n"
    } else {
        "Validation: FAILED\n"
    });
    output
}
