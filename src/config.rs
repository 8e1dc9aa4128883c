//! Relay configuration

use crate::identity::UserId;
use crate::ingress::DEFAULT_INGRESS_CAPACITY;
use crate::RelayError;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Public DNS-over-HTTPS resolver used for UDP/53 sessions
pub const DEFAULT_DOH_ENDPOINT: &str = "https://1.1.1.1/dns-query";

/// Main relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address for WebSocket upgrades
    pub listen_addr: SocketAddr,

    /// Accepted user identity (`8-4-4-4-12` hex)
    #[serde(default)]
    pub user_id: String,

    /// Only upgrade requests for this path when set
    #[serde(default)]
    pub ws_path: Option<String>,

    /// TCP fallback outbound
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// DNS-over-HTTPS upstream
    #[serde(default)]
    pub dns: DnsConfig,

    /// WebSocket limits
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            user_id: String::new(),
            ws_path: None,
            fallback: FallbackConfig::default(),
            dns: DnsConfig::default(),
            websocket: WebSocketConfig::default(),
        }
    }
}

/// When the fallback host is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackMode {
    /// Only after the first attempt closed without receiving data
    #[default]
    OnFailure,
    /// For the first attempt as well
    Prefer,
}

/// Fallback outbound configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Candidate hosts; one is picked per session
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub mode: FallbackMode,
}

/// DNS-over-HTTPS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Resolver URL
    pub endpoint: String,

    /// Per-query timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DOH_ENDPOINT.to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// WebSocket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Maximum message size in bytes
    pub max_message_size: Option<usize>,

    /// Maximum frame size in bytes
    pub max_frame_size: Option<usize>,

    /// Client chunks buffered ahead of the outbound writer
    pub ingress_capacity: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: Some(64 * 1024 * 1024),
            max_frame_size: Some(16 * 1024 * 1024),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Replace the fallback hosts with a comma-separated list
    pub fn set_fallback_hosts(&mut self, list: &str) {
        self.fallback.hosts = parse_host_list(list);
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.user_id.is_empty() {
            return Err("user_id must be set".to_string());
        }
        UserId::parse(&self.user_id).map_err(|e| format!("user_id: {}", e))?;

        if !(self.dns.endpoint.starts_with("https://") || self.dns.endpoint.starts_with("http://"))
        {
            return Err(format!(
                "dns endpoint must be an http(s) URL: {}",
                self.dns.endpoint
            ));
        }

        if self.dns.timeout.is_zero() {
            return Err("dns timeout must be greater than zero".to_string());
        }

        if let Some(path) = &self.ws_path {
            if !path.starts_with('/') {
                return Err(format!("ws_path must start with '/': {}", path));
            }
        }

        if self.websocket.ingress_capacity == 0 {
            return Err("websocket ingress_capacity must be at least 1".to_string());
        }

        Ok(())
    }

    /// Freeze the per-session part of the configuration
    pub fn session_config(&self) -> Result<SessionConfig, RelayError> {
        self.validate().map_err(RelayError::InvalidConfig)?;
        let user_id = UserId::parse(&self.user_id)
            .map_err(|e| RelayError::InvalidConfig(e.to_string()))?;

        Ok(SessionConfig {
            user_id,
            fallback_hosts: self.fallback.hosts.clone(),
            fallback_mode: self.fallback.mode,
            ingress_capacity: self.websocket.ingress_capacity,
        })
    }
}

/// Immutable configuration handed to every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub user_id: UserId,
    pub fallback_hosts: Vec<String>,
    pub fallback_mode: FallbackMode,
    pub ingress_capacity: usize,
}

impl SessionConfig {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            fallback_hosts: Vec::new(),
            fallback_mode: FallbackMode::default(),
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
        }
    }

    pub fn with_fallback(mut self, hosts: Vec<String>, mode: FallbackMode) -> Self {
        self.fallback_hosts = hosts;
        self.fallback_mode = mode;
        self
    }

    /// Pick a fallback host for one session
    pub fn pick_fallback(&self) -> Option<String> {
        self.fallback_hosts
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

/// Split a comma-separated host list, dropping blanks
pub fn parse_host_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}
