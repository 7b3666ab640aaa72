//! Session Configuration
//!
//! Settings for the virtual interface, the proxy engine, the bridge
//! engine, readiness detection and telemetry. Every field has a default,
//! so an empty TOML document is a valid configuration.
//!
//! ```toml
//! [interface]
//! name = "tunvisor0"
//! mtu = 1380
//! routes = ["0.0.0.0/0"]
//!
//! [engine]
//! binary = "/usr/local/bin/sing-box"
//! template = "/etc/tunvisor/engine.json"
//!
//! [readiness]
//! timeout_ms = 10000
//! survival_grace_ms = 2000
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Well-known local inbound port of the proxy engine
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Interface name patterns treated as tunnel-like by the telemetry sampler
pub const DEFAULT_TUNNEL_KEYWORDS: &[&str] =
    &["wintun", "sing-box", "tun", "tap", "openvpn", "wireguard", "wg"];

/// A destination prefix routed through the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Route {
    /// Network address
    pub addr: IpAddr,
    /// Prefix length
    pub prefix_len: u8,
}

impl Route {
    /// Default IPv4 route (all traffic)
    pub fn default_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    fn max_prefix(&self) -> u8 {
        if self.addr.is_ipv4() { 32 } else { 128 }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl std::str::FromStr for Route {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidRoute(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let route = Route {
            addr: addr.trim().parse().map_err(|_| invalid())?,
            prefix_len: prefix.trim().parse().map_err(|_| invalid())?,
        };
        if route.prefix_len > route.max_prefix() {
            return Err(invalid());
        }
        Ok(route)
    }
}

impl TryFrom<String> for Route {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Route> for String {
    fn from(route: Route) -> Self {
        route.to_string()
    }
}

/// Virtual interface settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface name requested from the OS
    pub name: String,
    /// Local address of the interface
    pub address: IpAddr,
    /// Prefix length of `address`
    pub prefix_len: u8,
    /// Link MTU (also handed to the bridge engine)
    pub mtu: u32,
    /// DNS servers used inside the tunnel
    pub dns: Vec<IpAddr>,
    /// Prefixes routed through the tunnel
    pub routes: Vec<Route>,
    /// Keep this process (and the proxy engine it spawns) out of the tunnel
    pub exclude_self: bool,
    /// Additional uids that bypass the tunnel
    pub disallowed_uids: Vec<u32>,
    /// Policy routing table holding the tunnel routes
    pub route_table: u32,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "tunvisor0".to_string(),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            prefix_len: 24,
            mtu: 1380,
            dns: vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))],
            routes: vec![Route::default_v4()],
            exclude_self: true,
            disallowed_uids: Vec::new(),
            route_table: 7890,
        }
    }
}

/// Proxy engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Executable to launch
    pub binary: PathBuf,
    /// Arguments; `{config}` is replaced by the materialised config path
    pub args: Vec<String>,
    /// Configuration template passed through to the engine
    pub template: PathBuf,
    /// Directory the materialised config is written to
    pub work_dir: PathBuf,
    /// Time between SIGTERM and SIGKILL on shutdown
    pub terminate_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sing-box"),
            args: ["run", "-c", "{config}", "--disable-color"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            template: PathBuf::from("engine.json"),
            work_dir: std::env::temp_dir().join("tunvisor"),
            terminate_grace_ms: 2000,
        }
    }
}

impl EngineSettings {
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Arguments with `{config}` substituted
    pub fn render_args(&self, config_path: &Path) -> Vec<String> {
        let config = config_path.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &config))
            .collect()
    }
}

/// Which bridge engine implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeKind {
    /// External tun2socks-style executable inheriting the descriptor
    Command,
    /// In-process hev-socks5-tunnel (requires the `native-bridge` feature)
    Native,
}

/// What to do when the bridge engine ignores its quit signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StuckPolicy {
    /// Terminate the host process so the kernel reclaims the descriptors
    TerminateHost,
    /// Log and leave the engine running
    Abandon,
}

/// Bridge engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub kind: BridgeKind,
    /// Executable for [`BridgeKind::Command`]
    pub command: PathBuf,
    /// Arguments; `{port}` and `{fd}` are substituted
    pub args: Vec<String>,
    /// Relay UDP natively (otherwise over TCP)
    pub udp: bool,
    /// Bounded wait for the bridge to finish after quit
    pub join_timeout_ms: u64,
    pub on_stuck: StuckPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            kind: BridgeKind::Command,
            command: PathBuf::from("tun2socks"),
            args: ["-device", "fd://{fd}", "-proxy", "socks5://127.0.0.1:{port}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            udp: true,
            join_timeout_ms: 3000,
            on_stuck: StuckPolicy::TerminateHost,
        }
    }
}

impl BridgeSettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// Readiness detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Upper bound on the whole detection
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Engine survival treated as success; 0 disables the heuristic
    pub survival_grace_ms: u64,
    /// Extra local ports to probe (the engine's inbound port is always probed)
    pub ports: Vec<u16>,
    pub connect_timeout_ms: u64,
    /// Interface expected to appear; defaults to the template's TUN inbound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_name: Option<String>,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 300,
            survival_grace_ms: 2000,
            ports: Vec::new(),
            connect_timeout_ms: 200,
            interface_name: None,
        }
    }
}

impl ReadinessSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn survival_grace(&self) -> Option<Duration> {
        (self.survival_grace_ms > 0).then(|| Duration::from_millis(self.survival_grace_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Throughput sampler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub interval_ms: u64,
    /// Exponential smoothing factor in [0, 1]; 0 disables smoothing
    pub ema_alpha: f64,
    /// Samples closer together than this reuse the previous value
    pub min_interval_ms: u64,
    /// Interface name fragments identifying tunnel-like interfaces
    pub keywords: Vec<String>,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            ema_alpha: 0.0,
            min_interval_ms: 500,
            keywords: DEFAULT_TUNNEL_KEYWORDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl TelemetrySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Complete session configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub interface: InterfaceConfig,
    pub engine: EngineSettings,
    pub bridge: BridgeSettings,
    pub readiness: ReadinessSettings,
    pub telemetry: TelemetrySettings,
}

impl SessionConfig {
    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let iface = &self.interface;
        if !(576..=9000).contains(&iface.mtu) {
            return Err(ConfigError::InvalidMtu(iface.mtu));
        }
        let max_prefix = if iface.address.is_ipv4() { 32 } else { 128 };
        if iface.prefix_len > max_prefix {
            return Err(ConfigError::InvalidPrefix(iface.prefix_len, iface.address));
        }
        if iface.name.is_empty() || iface.name.len() >= 16 {
            return Err(ConfigError::InvalidInterfaceName(iface.name.clone()));
        }
        if self.engine.binary.as_os_str().is_empty() {
            return Err(ConfigError::MissingEngineBinary);
        }

        let readiness = &self.readiness;
        if readiness.poll_interval_ms == 0 || readiness.poll_interval_ms >= readiness.timeout_ms {
            return Err(ConfigError::InvalidTiming(
                "readiness poll interval must be positive and below the timeout",
            ));
        }
        if self.bridge.join_timeout_ms == 0 {
            return Err(ConfigError::InvalidTiming("bridge join timeout must be positive"));
        }
        if self.telemetry.interval_ms == 0 {
            return Err(ConfigError::InvalidTiming("telemetry interval must be positive"));
        }
        if !self.telemetry.ema_alpha.is_finite() {
            return Err(ConfigError::InvalidAlpha(self.telemetry.ema_alpha));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid MTU {0} (expected 576..=9000)")]
    InvalidMtu(u32),

    #[error("Invalid prefix length /{0} for {1}")]
    InvalidPrefix(u8, IpAddr),

    #[error("Invalid interface name '{0}'")]
    InvalidInterfaceName(String),

    #[error("Invalid route '{0}'")]
    InvalidRoute(String),

    #[error("Engine binary is not set")]
    MissingEngineBinary,

    #[error("Invalid timing: {0}")]
    InvalidTiming(&'static str),

    #[error("Invalid EMA smoothing factor {0}")]
    InvalidAlpha(f64),
}
