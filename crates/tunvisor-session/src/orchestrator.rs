//! Session Orchestrator
//!
//! Owns the session state machine and the three session resources: the
//! virtual interface, the proxy engine process and the bridge engine.
//!
//! # Usage
//!
//! ```rust,ignore
//! let session = SessionOrchestrator::new(config, platform, gate, sink)?;
//!
//! match session.start().await {
//!     Ok(state) => info!(%state, "Tunnel up"),
//!     Err(e) => warn!(kind = e.kind(), "Start failed: {e}"),
//! }
//!
//! // Never fails
//! session.stop().await;
//! ```
//!
//! # Teardown order
//!
//! ```text
//! cancel sampler + supervisor
//! quit bridge ─▶ bounded join ─▶ (abort ─▶ bounded join) ─▶ stuck?
//! close duplicated descriptor   (kept while a stuck in-process bridge uses it)
//! terminate proxy engine        (SIGTERM, grace, SIGKILL)
//! log bridge stats, release interface
//! stuck ─▶ fault to sink ─▶ terminate host | abandon
//! ```

use crate::bridge::{BridgeConfig, BridgeHandle};
use crate::config::{ConfigError, SessionConfig, StuckPolicy};
use crate::interface::{InterfaceHandle, TunFd};
use crate::engine::EngineProcess;
use crate::platform::{Platform, STUCK_EXIT_CODE};
use crate::readiness::{Readiness, ReadinessDetector};
use crate::status::{AuthorizationGate, SessionState, SessionStatus, StatusDispatcher, StatusSink};
use crate::telemetry::{RateMeter, SessionTelemetry, TelemetrySampler};
use crate::template::EngineTemplate;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Bounded wait for the telemetry sampler after cancellation
const SAMPLER_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Time given to the status dispatcher before the host is terminated
const FAULT_DELIVERY_GRACE: Duration = Duration::from_millis(100);

/// Session errors, as surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Not authorized to start a session")]
    Unauthorized,

    #[error("Interface consent denied: {0}")]
    ConsentDenied(String),

    #[error("Interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("Failed to launch proxy engine: {0}")]
    SubprocessLaunchFailed(String),

    #[error("Proxy engine not ready after {}ms", .0.as_millis())]
    StartupTimeout(Duration),

    #[error("Proxy engine exited during startup: {0}")]
    SubprocessDiedEarly(String),

    #[error("Bridge engine did not stop: {0}")]
    TeardownStuck(String),

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SessionError {
    /// Stable short code
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::Unauthorized => "unauthorized",
            SessionError::ConsentDenied(_) => "consent_denied",
            SessionError::InterfaceUnavailable(_) => "interface_unavailable",
            SessionError::SubprocessLaunchFailed(_) => "subprocess_launch_failed",
            SessionError::StartupTimeout(_) => "startup_timeout",
            SessionError::SubprocessDiedEarly(_) => "subprocess_died_early",
            SessionError::TeardownStuck(_) => "teardown_stuck",
            SessionError::StartupFailed(_) => "startup_failed",
            SessionError::Config(_) => "config",
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(e.to_string())
    }
}

/// Everything a session holds. Fields fill in acquisition order and
/// drain in teardown order.
#[derive(Default)]
struct Resources {
    interface: Option<InterfaceHandle>,
    bridge_fd: Option<Arc<TunFd>>,
    engine: Option<EngineProcess>,
    bridge: Option<BridgeHandle>,
    sampler: Option<(CancellationToken, JoinHandle<()>)>,
    supervisor: Option<CancellationToken>,
}

impl Resources {
    fn engine_pid(&self) -> Option<u32> {
        self.engine.as_ref().and_then(EngineProcess::pid)
    }
}

struct Slot {
    state: SessionState,
    active: Option<Resources>,
}

struct Inner {
    config: SessionConfig,
    platform: Arc<dyn Platform>,
    gate: Arc<dyn AuthorizationGate>,
    dispatcher: StatusDispatcher,
    status: watch::Sender<SessionStatus>,
    telemetry: Arc<RwLock<SessionTelemetry>>,
    session: Mutex<Slot>,
}

impl Inner {
    /// Reason to stop if a running session lost its engine or bridge.
    /// Skips the check while a start or stop holds the session.
    fn check_health(&self) -> Option<String> {
        let mut slot = self.session.try_lock().ok()?;
        let resources = slot.active.as_mut()?;

        if let Some(status) = resources.engine.as_mut().and_then(EngineProcess::try_exited) {
            return Some(format!("proxy engine exited ({status})"));
        }
        if resources.bridge.as_ref().is_some_and(BridgeHandle::is_finished) {
            return Some("bridge engine exited".to_string());
        }
        None
    }
}

/// The single VPN session of this process
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<Inner>,
}

impl SessionOrchestrator {
    /// Create an idle orchestrator. Must be called inside a tokio runtime.
    pub fn new(
        config: SessionConfig,
        platform: Arc<dyn Platform>,
        gate: Arc<dyn AuthorizationGate>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        info!(platform = platform.name(), "Session orchestrator ready");

        let (status, _) = watch::channel(SessionStatus::idle());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                platform,
                gate,
                dispatcher: StatusDispatcher::spawn(sink),
                status,
                telemetry: Arc::new(RwLock::new(SessionTelemetry::default())),
                session: Mutex::new(Slot {
                    state: SessionState::Idle,
                    active: None,
                }),
            }),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Snapshot of the caller-visible status
    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.status.borrow().state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Receive every caller-visible status change
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Snapshot of the throughput counters
    pub async fn telemetry(&self) -> SessionTelemetry {
        self.inner.telemetry.read().await.clone()
    }

    /// Bring the tunnel up.
    ///
    /// Returns the current state without doing anything if a session is
    /// already running or a start/stop is in flight. On failure every
    /// partially acquired resource has been released by the time this
    /// returns.
    pub async fn start(&self) -> Result<SessionState, SessionError> {
        let Ok(mut slot) = self.inner.session.try_lock() else {
            let state = self.state();
            debug!(%state, "Start ignored, another sequence is in flight");
            return Ok(state);
        };
        if slot.active.is_some() {
            debug!("Start ignored, session already running");
            return Ok(slot.state);
        }

        if !self.inner.gate.is_authorized() {
            warn!("Start refused: not authorized");
            return Err(SessionError::Unauthorized);
        }

        let started = Instant::now();
        self.publish(&mut slot, SessionState::Starting, None, None);
        *self.inner.telemetry.write().await = SessionTelemetry::default();

        let mut resources = Resources::default();
        match self.acquire(&mut resources).await {
            Ok(()) => {
                self.spawn_background(&mut resources);
                let pid = resources.engine_pid();
                slot.active = Some(resources);
                self.publish(&mut slot, SessionState::Running, pid, None);
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    engine_pid = ?pid,
                    "Session running"
                );
                Ok(SessionState::Running)
            }
            Err(e) => {
                slot.state = SessionState::Failed;
                error!(kind = e.kind(), error = %e, "Session start failed, tearing down");
                self.teardown(resources).await;
                self.inner.dispatcher.fault(e.clone());
                self.publish(&mut slot, SessionState::Idle, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tear the tunnel down. Always ends in `Idle`; waits for an in-flight
    /// start to settle first.
    pub async fn stop(&self) -> SessionState {
        self.stop_with(None, None).await
    }

    /// Out-of-band revocation, handled like [`stop`](Self::stop)
    pub async fn revoke(&self) -> SessionState {
        info!("Session revoked");
        self.stop_with(None, None).await
    }

    /// `only_if` guards a supervisor against stopping a later session
    async fn stop_with(&self, reason: Option<String>, only_if: Option<&CancellationToken>) -> SessionState {
        let mut slot = self.inner.session.lock().await;
        if only_if.is_some_and(CancellationToken::is_cancelled) {
            return slot.state;
        }
        let Some(resources) = slot.active.take() else {
            debug!(state = %slot.state, "Stop ignored, no active session");
            return slot.state;
        };

        let started = Instant::now();
        self.publish(&mut slot, SessionState::Stopping, resources.engine_pid(), None);
        self.teardown(resources).await;
        self.publish(&mut slot, SessionState::Idle, None, reason);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Session stopped");
        slot.state
    }

    async fn acquire(&self, res: &mut Resources) -> Result<(), SessionError> {
        let config = &self.inner.config;
        let platform = &self.inner.platform;

        let handle = platform.acquire_interface(&config.interface).await?;
        info!(interface = handle.name(), fd = handle.raw_fd(), "Interface acquired");
        let mtu = handle.mtu();
        let duplicate = handle.duplicate();
        res.interface = Some(handle);

        let fd = Arc::new(duplicate.map_err(|e| {
            SessionError::InterfaceUnavailable(format!("failed to duplicate descriptor: {e}"))
        })?);
        res.bridge_fd = Some(fd.clone());

        let template = EngineTemplate::load(&config.engine.template)
            .map_err(|e| SessionError::SubprocessLaunchFailed(e.to_string()))?;
        let config_path = template
            .materialize(&config.engine.work_dir)
            .map_err(|e| SessionError::SubprocessLaunchFailed(e.to_string()))?;

        let engine = platform.launch_engine(&config.engine, &config_path).await?;
        let engine = res.engine.insert(engine);

        let bridge_engine = platform.bridge_engine(&config.bridge)?;
        let bridge_config = BridgeConfig::new(&config.bridge, template.local_port(), mtu);
        let bridge = BridgeHandle::start(bridge_engine, fd, bridge_config)
            .map_err(|e| SessionError::StartupFailed(format!("bridge engine: {e}")))?;
        res.bridge = Some(bridge);

        let detector = ReadinessDetector::new(
            &config.readiness,
            template.local_port(),
            template.tun_interface().map(str::to_string),
        );
        match detector.wait(engine, platform.interface_table()).await {
            Readiness::Ready(_) => {}
            Readiness::SubprocessDied(status) => {
                return Err(SessionError::SubprocessDiedEarly(status.to_string()));
            }
            Readiness::TimedOut => {
                return Err(SessionError::StartupTimeout(config.readiness.timeout()));
            }
        }

        if res.bridge.as_ref().is_some_and(BridgeHandle::is_finished) {
            return Err(SessionError::StartupFailed(
                "bridge engine exited during startup".into(),
            ));
        }
        Ok(())
    }

    /// Start the telemetry sampler and the session supervisor
    fn spawn_background(&self, res: &mut Resources) {
        let config = &self.inner.config;
        let Some(interface) = res.interface.as_ref() else {
            return;
        };

        let token = CancellationToken::new();
        let handle = TelemetrySampler::spawn(
            self.inner.platform.counter_source(&config.telemetry, interface.name()),
            RateMeter::from_settings(&config.telemetry),
            config.telemetry.interval(),
            self.inner.telemetry.clone(),
            self.inner.dispatcher.clone(),
            token.clone(),
        );
        res.sampler = Some((token, handle));

        let token = CancellationToken::new();
        Self::supervise(
            Arc::downgrade(&self.inner),
            interface.revocation(),
            token.clone(),
            config.readiness.poll_interval(),
        );
        res.supervisor = Some(token);
    }

    /// Stop the session when the OS revokes the interface or a session
    /// component dies on its own
    fn supervise(inner: Weak<Inner>, revocation: CancellationToken, token: CancellationToken, every: Duration) {
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = revocation.cancelled() => {
                        info!("Interface revoked by the OS");
                        break None;
                    }
                    _ = tokio::time::sleep(every) => {
                        let Some(inner) = inner.upgrade() else { return };
                        if let Some(reason) = inner.check_health() {
                            warn!(%reason, "Session component died, stopping");
                            break Some(reason);
                        }
                    }
                }
            };

            if let Some(inner) = inner.upgrade() {
                SessionOrchestrator { inner }.stop_with(reason, Some(&token)).await;
            }
        });
    }

    async fn teardown(&self, mut res: Resources) {
        let config = &self.inner.config;

        if let Some(token) = res.supervisor.take() {
            token.cancel();
        }
        if let Some((token, handle)) = res.sampler.take() {
            token.cancel();
            if tokio::time::timeout(SAMPLER_STOP_TIMEOUT, handle).await.is_err() {
                warn!("Telemetry sampler did not stop in time");
            }
        }

        let mut stuck = None;
        let mut bridge_stats = None;
        if let Some(mut bridge) = res.bridge.take() {
            bridge.quit();
            if !bridge.join(config.bridge.join_timeout()).await {
                warn!(
                    engine = bridge.name(),
                    timeout_ms = config.bridge.join_timeout_ms,
                    "Bridge engine ignored quit"
                );
                let aborted = bridge.abort() && bridge.join(config.bridge.join_timeout()).await;
                if aborted {
                    info!(engine = bridge.name(), "Bridge engine aborted");
                } else {
                    error!(engine = bridge.name(), "Bridge engine is stuck");
                    stuck = Some((bridge.name(), bridge.shares_host_process()));
                }
            }
            bridge_stats = bridge.stats();
        }

        if let Some(fd) = res.bridge_fd.take() {
            if stuck.is_some_and(|(_, shares_host)| shares_host) {
                warn!(fd = fd.number(), "Leaving duplicated descriptor to the stuck bridge");
            } else if !fd.close() {
                debug!(fd = fd.number(), "Duplicated descriptor already closed");
            }
        }

        if let Some(engine) = res.engine.take() {
            engine.terminate(config.engine.terminate_grace()).await;
        }

        if let Some(stats) = bridge_stats {
            info!(%stats, "Bridge statistics");
        }
        if let Some(handle) = res.interface.take() {
            let name = handle.name().to_string();
            match self.inner.platform.release_interface(handle).await {
                Ok(()) => info!(interface = %name, "Interface released"),
                Err(e) => warn!(interface = %name, error = %format!("{e:#}"), "Interface release failed"),
            }
        }

        if let Some((engine, shares_host)) = stuck {
            let fault = SessionError::TeardownStuck(format!(
                "{engine} did not finish within {}ms of quit",
                config.bridge.join_timeout_ms
            ));
            self.inner.dispatcher.fault(fault);

            if shares_host && config.bridge.on_stuck == StuckPolicy::TerminateHost {
                error!(code = STUCK_EXIT_CODE, "Terminating host to reclaim the tunnel descriptor");
                tokio::time::sleep(FAULT_DELIVERY_GRACE).await;
                self.inner.platform.terminate_host(STUCK_EXIT_CODE);
            } else {
                error!(engine, "Abandoning stuck bridge engine");
            }
        }
    }

    fn publish(
        &self,
        slot: &mut Slot,
        state: SessionState,
        engine_pid: Option<u32>,
        last_error: Option<String>,
    ) {
        slot.state = state;
        self.inner.status.send_replace(SessionStatus {
            state,
            last_error,
            engine_pid,
            since: Instant::now(),
        });
        self.inner.dispatcher.state_changed(state);
        debug!(%state, "Session state changed");
    }
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("platform", &self.inner.platform.name())
            .field("state", &self.state())
            .finish()
    }
}
