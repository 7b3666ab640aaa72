//! Platform Capabilities
//!
//! Everything the orchestrator needs from the operating system sits behind
//! [`Platform`]: granting and releasing the virtual interface, launching
//! the proxy engine, picking a bridge engine, inspecting interfaces and
//! ending the host process as a last resort.
//!
//! Only the interface calls are mandatory; the rest default to the
//! portable implementations in this crate.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;

use crate::bridge::{self, BridgeEngine};
use crate::config::{BridgeSettings, EngineSettings, InterfaceConfig, TelemetrySettings};
use crate::engine::EngineProcess;
use crate::interface::InterfaceHandle;
use crate::orchestrator::SessionError;
use crate::readiness::{InterfaceTable, SystemInterfaces};
use crate::telemetry::{CounterSource, InterfaceCounters};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Exit code used when a stuck in-process bridge forces the host down
pub const STUCK_EXIT_CODE: i32 = 70;

#[async_trait]
pub trait Platform: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Ask the OS for a virtual interface configured per `config`.
    ///
    /// Fails with `ConsentDenied` if the user or OS refuses, and with
    /// `InterfaceUnavailable` for any other reason.
    async fn acquire_interface(&self, config: &InterfaceConfig) -> Result<InterfaceHandle, SessionError>;

    /// Undo whatever `acquire_interface` set up and close the handle
    async fn release_interface(&self, handle: InterfaceHandle) -> anyhow::Result<()>;

    async fn launch_engine(
        &self,
        settings: &EngineSettings,
        config_path: &Path,
    ) -> Result<EngineProcess, SessionError> {
        EngineProcess::launch(settings, config_path)
    }

    fn bridge_engine(&self, settings: &BridgeSettings) -> Result<Arc<dyn BridgeEngine>, SessionError> {
        bridge::select(settings)
    }

    fn interface_table(&self) -> &dyn InterfaceTable {
        &SystemInterfaces
    }

    /// Counter source for the telemetry sampler of a session on `interface`
    fn counter_source(&self, settings: &TelemetrySettings, interface: &str) -> Box<dyn CounterSource> {
        Box::new(InterfaceCounters::new(settings, Some(interface.to_string())))
    }

    /// End the host process. Only reached when an in-process bridge
    /// refused to stop and still holds the tunnel descriptor.
    fn terminate_host(&self, code: i32) {
        std::process::exit(code);
    }
}
