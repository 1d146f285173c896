use std::path::Path;

use serde::de::DeserializeOwned;

use super::ConfigError;

/// Serialization format of a configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// JSON, with `//` and `/* */` comments allowed
    Jsonc,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Jsonc,
        }
    }
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content.
/// This is a pure function - no I/O.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        if c == '\\' && in_string {
            result.push(c);
            escape_next = true;
            continue;
        }

        if c == '"' {
            in_string = !in_string;
            result.push(c);
            continue;
        }

        if !in_string && c == '/' {
            if chars.peek() == Some(&'/') {
                chars.next();
                for nc in chars.by_ref() {
                    if nc == '\n' {
                        result.push('\n');
                        break;
                    }
                }
                continue;
            } else if chars.peek() == Some(&'*') {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    prev = nc;
                }
                continue;
            }
        }

        result.push(c);
    }

    result
}

/// Parse configuration text in the given format.
/// This is a pure function - no I/O.
pub fn parse_config<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> Result<T, ConfigError> {
    match format {
        ConfigFormat::Jsonc => serde_json::from_str(&strip_jsonc_comments(content))
            .map_err(|e| ConfigError::Parse(e.to_string())),
        ConfigFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, StageServerConfig};
    use crate::context::StageRole;

    #[test]
    fn test_strip_line_comments() {
        let input = "{\n  // comment\n  \"a\": 1\n}";
        let stripped = strip_jsonc_comments(input);
        assert!(!stripped.contains("comment"));
        assert!(stripped.contains("\"a\": 1"));
    }

    #[test]
    fn test_strip_block_comments() {
        let input = r#"{ /* block */ "a": 1 }"#;
        assert_eq!(strip_jsonc_comments(input), r#"{  "a": 1 }"#);
    }

    #[test]
    fn test_url_slashes_survive() {
        let input = r#"{"url": "http://localhost:19534"}"#;
        assert_eq!(strip_jsonc_comments(input), input);
    }

    #[test]
    fn test_parse_jsonc_proxy_config() {
        let content = r#"{
            // Encode tier on GPU 0
            "stages": {
                "encode": ["http://127.0.0.1:19534"],
                "prefill": ["http://127.0.0.1:19535"],
                "decode": ["http://127.0.0.1:19536"]
            },
            "routing": {"policy": "least_outstanding"}
        }"#;
        let config: ProxyConfig = parse_config(content, ConfigFormat::Jsonc).unwrap();
        assert_eq!(config.stages.encode.len(), 1);
    }

    #[test]
    fn test_parse_yaml_stage_config() {
        let content = "\
role: decode
listen:
  port: 19536
consumes:
  backend: side_channel
  listen: 127.0.0.1:19540
";
        let config: StageServerConfig = parse_config(content, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.role, StageRole::Decode);
        assert!(config.produces.is_none());
    }

    #[test]
    fn test_parse_error() {
        let result = parse_config::<ProxyConfig>("{ not json", ConfigFormat::Jsonc);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("epd.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("epd.yml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("epd.jsonc")), ConfigFormat::Jsonc);
    }
}
