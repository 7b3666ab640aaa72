//! Session Status
//!
//! The caller-visible state machine values, the authorization gate the
//! orchestrator consults before acquiring anything, and the status sink
//! that renders state and throughput somewhere else.
//!
//! Sink callbacks never run on the orchestrator's task: every event goes
//! through [`StatusDispatcher`], which forwards it over a channel to a
//! dedicated dispatch task.

use crate::orchestrator::SessionError;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No resources held
    Idle,
    /// Start sequence in flight
    Starting,
    /// Interface, engine and bridge all up
    Running,
    /// Teardown in flight
    Stopping,
    /// Start failed; teardown runs before settling back in `Idle`.
    /// Never published to callers.
    Failed,
}

impl SessionState {
    /// Check if the tunnel is up
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if a start or stop sequence is in flight
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionState::Starting | SessionState::Stopping)
    }

    /// Short lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent snapshot of the session, as seen by callers
#[derive(Debug, Clone)]
pub struct SessionStatus {
    /// Current state (never `Failed`)
    pub state: SessionState,
    /// Human-readable cause of the last failed start, cleared on success
    pub last_error: Option<String>,
    /// PID of the proxy engine while running
    pub engine_pid: Option<u32>,
    /// When `state` was entered
    pub since: Instant,
}

impl SessionStatus {
    pub(crate) fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            last_error: None,
            engine_pid: None,
            since: Instant::now(),
        }
    }
}

/// Decides whether a session may start.
///
/// Consulted synchronously on every `start()`; a previous `true` is never
/// cached.
pub trait AuthorizationGate: Send + Sync {
    fn is_authorized(&self) -> bool;
}

impl<F> AuthorizationGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_authorized(&self) -> bool {
        self()
    }
}

/// Receives state and telemetry changes for rendering
/// (notification text, quick-settings tile, UI labels).
pub trait StatusSink: Send + Sync + 'static {
    /// A caller-visible state was entered
    fn on_state_changed(&self, state: SessionState);

    /// The formatted throughput text changed
    fn on_telemetry(&self, rate_text: &str);

    /// A start failed, or teardown got stuck
    fn on_fault(&self, _error: &SessionError) {}
}

/// Sink that drops everything
pub struct NullSink;

impl StatusSink for NullSink {
    fn on_state_changed(&self, _state: SessionState) {}
    fn on_telemetry(&self, _rate_text: &str) {}
}

#[derive(Debug)]
enum StatusEvent {
    State(SessionState),
    Telemetry(String),
    Fault(SessionError),
}

/// Fire-and-forget front of a [`StatusSink`].
///
/// Events are queued on an unbounded channel and delivered in order by a
/// background task, so a slow sink can never stall a start or stop.
#[derive(Clone)]
pub struct StatusDispatcher {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusDispatcher {
    /// Spawn the dispatch task. Must be called inside a tokio runtime.
    pub fn spawn(sink: Arc<dyn StatusSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StatusEvent>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    StatusEvent::State(state) => sink.on_state_changed(state),
                    StatusEvent::Telemetry(text) => sink.on_telemetry(&text),
                    StatusEvent::Fault(error) => sink.on_fault(&error),
                }
            }
            debug!("Status dispatcher stopped");
        });

        Self { tx }
    }

    pub fn state_changed(&self, state: SessionState) {
        self.send(StatusEvent::State(state));
    }

    pub fn telemetry(&self, rate_text: String) {
        self.send(StatusEvent::Telemetry(rate_text));
    }

    pub fn fault(&self, error: SessionError) {
        self.send(StatusEvent::Fault(error));
    }

    fn send(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("Status sink gone, dropping event");
        }
    }
}
