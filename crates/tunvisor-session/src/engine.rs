//! Proxy Engine Process
//!
//! Supervises the external proxy engine (sing-box or compatible).
//!
//! # Lifecycle
//! ```text
//! EngineProcess::launch(settings, config)
//!   → spawns `binary args...` with stdout/stderr piped
//!   → drain task forwards every output line to the log
//!
//! engine.terminate(grace)
//!   → SIGTERM
//!   → waits up to `grace`
//!   → SIGKILL if still alive
//! ```

use crate::config::EngineSettings;
use crate::orchestrator::SessionError;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded wait for the drain task once the engine has exited
const DRAIN_LINGER: Duration = Duration::from_millis(500);

/// A running proxy engine child process
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    pid: Option<u32>,
    exit: Option<ExitStatus>,
    drain: Option<JoinHandle<()>>,
}

impl EngineProcess {
    /// Spawn the engine with its materialised config.
    ///
    /// Must be called inside a tokio runtime.
    pub fn launch(settings: &EngineSettings, config_path: &Path) -> Result<Self, SessionError> {
        let args = settings.render_args(config_path);
        let mut child = Command::new(&settings.binary)
            .args(&args)
            .current_dir(&settings.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::SubprocessLaunchFailed(format!(
                    "{}: {e}",
                    settings.binary.display()
                ))
            })?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let drain = tokio::spawn(async move {
            tokio::join!(drain_lines(stdout), drain_lines(stderr));
        });

        info!(
            binary = %settings.binary.display(),
            pid = ?pid,
            config = %config_path.display(),
            "Proxy engine launched"
        );

        Ok(Self {
            child,
            pid,
            exit: None,
            drain: Some(drain),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking exit check. The status is remembered once observed.
    pub fn try_exited(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => warn!(error = %e, "Failed to poll proxy engine"),
            }
        }
        self.exit
    }

    /// Stop the engine: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Returns the exit status if one could be collected.
    pub async fn terminate(mut self, grace: Duration) -> Option<ExitStatus> {
        if let Some(status) = self.try_exited() {
            debug!(pid = ?self.pid, %status, "Proxy engine already exited");
            self.finish_drain().await;
            return Some(status);
        }

        if let Some(pid) = self.pid {
            signal(pid, libc::SIGTERM);
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(pid = ?self.pid, error = %e, "Failed to wait for proxy engine");
                None
            }
            Err(_) => {
                warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Proxy engine ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(pid = ?self.pid, error = %e, "Failed to kill proxy engine");
                }
                self.child.try_wait().ok().flatten()
            }
        };

        info!(pid = ?self.pid, status = ?status, "Proxy engine stopped");
        self.finish_drain().await;
        status
    }

    async fn finish_drain(&mut self) {
        if let Some(mut drain) = self.drain.take() {
            if tokio::time::timeout(DRAIN_LINGER, &mut drain).await.is_err() {
                drain.abort();
            }
        }
    }
}

fn signal(pid: u32, sig: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        debug!(pid, sig, error = %std::io::Error::last_os_error(), "kill() failed");
    }
}

async fn drain_lines<R>(stream: Option<R>)
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return;
    };
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "tunvisor::engine", "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "tunvisor::engine", error = %e, "Engine output closed");
                break;
            }
        }
    }
}
