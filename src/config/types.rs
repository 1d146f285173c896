use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::StageRole;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8000
}

/// Address an HTTP service binds to
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_proxy_port(),
        }
    }
}

impl ListenConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Base URLs of the stage services, per role, in selection order
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StageTopology {
    #[serde(default)]
    pub encode: Vec<String>,
    #[serde(default)]
    pub prefill: Vec<String>,
    #[serde(default)]
    pub decode: Vec<String>,
    /// Prefill URL -> the decode URL its KV artifacts are pushed to. A request
    /// that prefilled on a paired endpoint decodes on its partner.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pairs: BTreeMap<String, String>,
}

impl StageTopology {
    pub fn endpoints(&self, role: StageRole) -> &[String] {
        match role {
            StageRole::Encode => &self.encode,
            StageRole::Prefill => &self.prefill,
            StageRole::Decode => &self.decode,
        }
    }
}

/// How the router picks among several endpoints of one role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    #[default]
    RoundRobin,
    LeastOutstanding,
}

/// Deadline for one call to a stage of each role
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageTimeouts {
    #[serde(default = "default_encode_timeout")]
    pub encode_secs: u64,
    #[serde(default = "default_prefill_timeout")]
    pub prefill_secs: u64,
    #[serde(default = "default_decode_timeout")]
    pub decode_secs: u64,
}

fn default_encode_timeout() -> u64 {
    120
}

fn default_prefill_timeout() -> u64 {
    300
}

fn default_decode_timeout() -> u64 {
    600
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            encode_secs: default_encode_timeout(),
            prefill_secs: default_prefill_timeout(),
            decode_secs: default_decode_timeout(),
        }
    }
}

impl StageTimeouts {
    pub fn for_role(&self, role: StageRole) -> Duration {
        Duration::from_secs(match role {
            StageRole::Encode => self.encode_secs,
            StageRole::Prefill => self.prefill_secs,
            StageRole::Decode => self.decode_secs,
        })
    }
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub policy: SelectionPolicy,
    #[serde(default)]
    pub timeouts: StageTimeouts,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::default(),
            timeouts: StageTimeouts::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_startup_timeout() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadinessConfig {
    /// How long every stage gets to come up before startup fails
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Re-probe endpoints while serving; disabled when absent
    #[serde(default)]
    pub recheck_interval_secs: Option<u64>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            recheck_interval_secs: None,
        }
    }
}

/// Cache backends the proxy itself can reach, used for best-effort cleanup
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ProxyCacheConfig {
    #[serde(default)]
    pub shared_storage: Option<SharedStorageConfig>,
}

fn default_model() -> String {
    "default".to_string()
}

/// Configuration of the front-door proxy
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Model name used in readiness probes
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub listen: ListenConfig,
    pub stages: StageTopology,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub cache: ProxyCacheConfig,
    /// Cap on concurrently served client requests; unlimited when absent
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
}

pub fn default_storage_root() -> String {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("epd-proxy")
        .join("artifacts")
        .to_string_lossy()
        .into_owned()
}

fn default_max_age_secs() -> u64 {
    600
}

fn default_max_bytes() -> u64 {
    64 * 1024 * 1024 * 1024
}

/// Durable filesystem backend; `root` accepts `~`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SharedStorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Remove the file on first fetch; the reader keeps a copy until release
    #[serde(default)]
    pub single_read: bool,
}

impl Default for SharedStorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_age_secs: default_max_age_secs(),
            max_bytes: default_max_bytes(),
            single_read: false,
        }
    }
}

fn default_transfer_timeout_ms() -> u64 {
    30_000
}

/// Direct push backend. Consumers set `listen`, producers set `peer`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SideChannelConfig {
    #[serde(default)]
    pub listen: Option<SocketAddr>,
    #[serde(default)]
    pub peer: Option<SocketAddr>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u64,
    /// Unclaimed artifacts are dropped after this long
    #[serde(default = "default_max_age_secs")]
    pub ttl_secs: u64,
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            listen: None,
            peer: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            transfer_timeout_ms: default_transfer_timeout_ms(),
            ttl_secs: default_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ConnectorConfig {
    SharedStorage(SharedStorageConfig),
    SideChannel(SideChannelConfig),
}

impl ConnectorConfig {
    pub fn backend(&self) -> &'static str {
        match self {
            ConnectorConfig::SharedStorage(_) => "shared_storage",
            ConnectorConfig::SideChannel(_) => "side_channel",
        }
    }
}

fn default_eviction_interval() -> u64 {
    60
}

/// Configuration of one reference stage server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageServerConfig {
    pub role: StageRole,
    #[serde(default = "default_model")]
    pub model: String,
    pub listen: ListenConfig,
    /// Backend this stage fetches its input artifact from
    #[serde(default)]
    pub consumes: Option<ConnectorConfig>,
    /// Backend this stage publishes its output artifact to
    #[serde(default)]
    pub produces: Option<ConnectorConfig>,
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_defaults() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"stages": {"prefill": ["http://p:1"], "decode": ["http://d:1"]}}"#,
        )
        .unwrap();

        assert_eq!(config.listen.addr(), "0.0.0.0:8000");
        assert!(config.stages.encode.is_empty());
        assert_eq!(config.routing.policy, SelectionPolicy::RoundRobin);
        assert_eq!(config.readiness.poll_interval_ms, 1_000);
        assert_eq!(
            config.routing.timeouts.for_role(StageRole::Decode),
            Duration::from_secs(600)
        );
        assert!(config.cache.shared_storage.is_none());
    }

    #[test]
    fn test_connector_config_tagging() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{"backend": "side_channel", "listen": "127.0.0.1:19540"}"#,
        )
        .unwrap();
        match config {
            ConnectorConfig::SideChannel(cfg) => {
                assert_eq!(cfg.listen, Some("127.0.0.1:19540".parse().unwrap()));
                assert!(cfg.peer.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let config: ConnectorConfig =
            serde_json::from_str(r#"{"backend": "shared_storage", "root": "/tmp/ec"}"#).unwrap();
        assert_eq!(config.backend(), "shared_storage");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let result = serde_json::from_str::<ConnectorConfig>(r#"{"backend": "nixl"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_stage_config() {
        let config: StageServerConfig = serde_json::from_str(
            r#"{
                "role": "prefill",
                "listen": {"port": 19535},
                "consumes": {"backend": "shared_storage", "root": "/tmp/ec"},
                "produces": {"backend": "side_channel", "peer": "127.0.0.1:19540"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.role, StageRole::Prefill);
        assert_eq!(config.listen.addr(), "0.0.0.0:19535");
        assert_eq!(config.eviction_interval_secs, 60);
    }
}
