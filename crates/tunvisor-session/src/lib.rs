//! Tunvisor Session - VPN Session Orchestration
//!
//! Brings a device-wide packet tunnel up and tears it down safely. A
//! session coordinates three resources that fail independently: the
//! virtual interface granted by the OS, a local proxy engine process, and
//! the bridge engine relaying packets between them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Host Process                             │
//! │                                                                 │
//! │  start()/stop() ──▶ SessionOrchestrator ──▶ StatusSink          │
//! │                        │      │      │                          │
//! │            ┌───────────┘      │      └──────────────┐           │
//! │            ▼                  ▼                     ▼           │
//! │     InterfaceHandle ──dup──▶ BridgeEngine ──▶ EngineProcess     │
//! │        (TUN fd)             (tun-bridge)     (127.0.0.1:10808)  │
//! │                                                     │           │
//! └─────────────────────────────────────────────────────│───────────┘
//!                                                       ▼
//!                                               Upstream proxy
//! ```
//!
//! # Guarantees
//!
//! - At most one start or stop sequence runs at a time
//! - A failed start releases everything it acquired before returning
//! - `stop()` always ends in `Idle` and never returns an error
//! - The duplicated descriptor is closed once, after the bridge has quiesced

mod bridge;
mod config;
mod engine;
mod interface;
mod orchestrator;
mod platform;
mod readiness;
mod status;
mod telemetry;
mod template;

pub use bridge::{BridgeConfig, BridgeEngine, BridgeError, BridgeHandle, BridgeStats, CommandBridge};
#[cfg(feature = "native-bridge")]
pub use bridge::HevBridge;
pub use config::{
    BridgeKind, BridgeSettings, ConfigError, DEFAULT_SOCKS_PORT, EngineSettings,
    InterfaceConfig, ReadinessSettings, Route, SessionConfig, StuckPolicy, TelemetrySettings,
};
pub use engine::EngineProcess;
pub use interface::{InterfaceHandle, TunFd};
pub use orchestrator::{SessionError, SessionOrchestrator};
#[cfg(target_os = "linux")]
pub use platform::LinuxPlatform;
pub use platform::{Platform, STUCK_EXIT_CODE};
pub use readiness::{InterfaceTable, Readiness, ReadinessDetector, ReadySignal, SystemInterfaces};
pub use status::{
    AuthorizationGate, NullSink, SessionState, SessionStatus, StatusDispatcher, StatusSink,
};
pub use telemetry::{
    CounterSource, Counters, InterfaceCounters, Rate, RateMeter, SessionTelemetry,
    TelemetrySampler, format_bytes_per_sec,
};
pub use template::{EngineTemplate, TemplateError};
