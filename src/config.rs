use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::time::Duration;

use crate::error::{OcppgError, Result};
use crate::forwarding::ForwardingConfig;
use crate::messages::DEFAULT_SUBPROTOCOL;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: SocketAddr,
    /// Accepted WebSocket subprotocols, most preferred first
    pub subprotocols: Vec<String>,
    /// Accept clients that offer none of `subprotocols`
    pub lenient_subprotocol: bool,
    /// Heartbeat interval handed to charge points in BootNotification replies
    pub heartbeat_interval_secs: u32,
    pub watchdog: WatchdogConfig,
    /// Deadline for a gateway-originated Call (milliseconds)
    pub call_timeout_ms: u64,
    /// Calls a session may have outstanding at once; OCPP allows one
    pub max_outstanding_calls: usize,
    /// Malformed frames tolerated before the session is faulted
    pub max_decode_errors: u32,
    /// Frames buffered towards one charge point
    pub outbound_capacity: usize,
    /// How long a superseded session gets to finish closing (milliseconds)
    pub supersede_timeout_ms: u64,
    /// Ask the backend for business replies before answering a Call
    pub consult_backend_replies: bool,
    pub backend_reply_timeout_ms: u64,
    pub backend: BackendConfig,
    pub forwarding: ForwardingConfig,
    pub async_runtime: AsyncRuntime,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9000)),
            subprotocols: vec![DEFAULT_SUBPROTOCOL.to_string()],
            lenient_subprotocol: true,
            heartbeat_interval_secs: 60,
            watchdog: WatchdogConfig::default(),
            call_timeout_ms: 30_000,
            max_outstanding_calls: 1,
            max_decode_errors: 5,
            outbound_capacity: 1024,
            supersede_timeout_ms: 5_000,
            consult_backend_replies: false,
            backend_reply_timeout_ms: 2_000,
            backend: BackendConfig::Disabled,
            forwarding: ForwardingConfig::default(),
            async_runtime: AsyncRuntime::MultiThread,
        }
    }
}

impl GatewayConfig {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: GatewayConfig = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(OcppgError::InvalidConfig(msg.to_string()));
        if self.subprotocols.is_empty() {
            return invalid("subprotocols must not be empty");
        }
        if self
            .subprotocols
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_graphic() && b != b','))
        {
            return invalid("subprotocol tokens must be non-empty printable ASCII without commas");
        }
        if self.watchdog.interval_ms == 0 || self.watchdog.tick_ms == 0 {
            return invalid("watchdog intervals must be positive");
        }
        if self.call_timeout_ms == 0 {
            return invalid("call_timeout_ms must be positive");
        }
        if self.max_outstanding_calls == 0 {
            return invalid("max_outstanding_calls must be at least 1");
        }
        if self.outbound_capacity == 0 {
            return invalid("outbound_capacity must be positive");
        }
        if self.forwarding.queue_capacity == 0 || self.forwarding.max_in_flight == 0 {
            return invalid("forwarding capacities must be positive");
        }
        if self.forwarding.delivery_timeout_ms == 0 {
            return invalid("forwarding.delivery_timeout_ms must be positive");
        }
        // A reply must reach the charge point before liveness could evict it.
        if self.backend_reply_timeout_ms >= self.watchdog.interval_ms {
            return invalid("backend_reply_timeout_ms must be shorter than watchdog.interval_ms");
        }
        if let BackendConfig::Http { base_url } = &self.backend {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return invalid("backend.base_url must be an http(s) URL");
            }
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn supersede_timeout(&self) -> Duration {
        Duration::from_millis(self.supersede_timeout_ms)
    }

    pub fn backend_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_reply_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Liveness interval N: probe after N idle, evict after 2N
    pub interval_ms: u64,
    /// How often sessions are swept for liveness and expired calls
    pub tick_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { interval_ms: 30_000, tick_ms: 1_000 }
    }
}

impl WatchdogConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Where forwarded messages go.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum BackendConfig {
    /// Forwarded records are discarded
    Disabled,
    /// Append-only JSON-Lines journal, one file per charge point
    Journal { directory: PathBuf },
    /// HTTP system of record
    Http { base_url: String },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsyncRuntime {
    CurrentThread,
    MultiThread,
}

impl AsyncRuntime {
    /// Builds a tokio runtime of this flavour with all drivers enabled.
    pub fn build(&self) -> std::io::Result<tokio::runtime::Runtime> {
        match self {
            AsyncRuntime::CurrentThread => tokio::runtime::Builder::new_current_thread().enable_all().build(),
            AsyncRuntime::MultiThread => tokio::runtime::Builder::new_multi_thread().enable_all().build(),
        }
    }
}
