//! Tunvisor: VPN session host
//!
//! Loads the session configuration, installs logging, brings one tunnel
//! session up and keeps it until Ctrl-C or SIGTERM. SIGHUP is treated as
//! an out-of-band revocation of the interface.

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunvisor_session::{
    AuthorizationGate, Platform, SessionConfig, SessionError, SessionOrchestrator, SessionState,
    StatusSink,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "tunvisor", version, about = "Device-wide tunnel through a local proxy engine")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tunvisor.toml")]
    config: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Host settings: the session config plus the authorization source
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostConfig {
    #[serde(flatten)]
    session: SessionConfig,
    auth: AuthSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AuthSettings {
    /// Session token written by the login flow; absent means always allowed
    token_file: Option<PathBuf>,
}

impl HostConfig {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }
}

/// Authorized while the token file exists and is non-empty
struct TokenFileGate {
    path: Option<PathBuf>,
}

impl AuthorizationGate for TokenFileGate {
    fn is_authorized(&self) -> bool {
        match &self.path {
            None => true,
            Some(path) => std::fs::metadata(path).is_ok_and(|m| m.len() > 0),
        }
    }
}

/// Renders status to the log
struct LogSink;

impl StatusSink for LogSink {
    fn on_state_changed(&self, state: SessionState) {
        info!(target: "tunvisor::status", %state, "VPN {state}");
    }

    fn on_telemetry(&self, rate_text: &str) {
        info!(target: "tunvisor::status", "{rate_text}");
    }

    fn on_fault(&self, error: &SessionError) {
        error!(target: "tunvisor::status", kind = error.kind(), "{error}");
    }
}

fn platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(tunvisor_session::LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        bail!("no tunnel platform available for this OS")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let host = HostConfig::load(&args.config)?;
    if args.print_config {
        print!("{}", host.session.to_toml());
        return Ok(());
    }

    info!(config = %args.config.display(), "Tunvisor starting");
    let session = SessionOrchestrator::new(
        host.session,
        platform()?,
        Arc::new(TokenFileGate {
            path: host.auth.token_file,
        }),
        Arc::new(LogSink),
    )?;

    if let Err(e) = session.start().await {
        bail!("session failed to start ({}): {e}", e.kind());
    }

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut status = session.subscribe();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = terminate.recv() => info!("Terminated"),
        _ = hangup.recv() => {
            warn!("SIGHUP received, revoking session");
            session.revoke().await;
        }
        _ = status.wait_for(|s| s.state == SessionState::Idle) => {
            warn!("Session ended on its own");
        }
    }

    session.stop().await;
    let last_error = session.status().last_error;
    info!("Tunvisor shutting down");

    match last_error {
        Some(e) => bail!("session ended: {e}"),
        None => Ok(()),
    }
}
