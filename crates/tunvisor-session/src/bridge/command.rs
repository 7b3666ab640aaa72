//! Bridge engine backed by an external tun2socks-style executable.
//!
//! The child inherits the duplicated tun descriptor under its own number
//! and is told about it through the `{fd}` argument placeholder.

use super::{BridgeConfig, BridgeEngine, BridgeError};
use crate::config::BridgeSettings;
use crate::interface::TunFd;
use std::io::{BufRead, BufReader};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, info, warn};

pub struct CommandBridge {
    command: PathBuf,
    args: Vec<String>,
    /// Child pid, 0 while no child is running
    pid: AtomicI32,
    quit: AtomicBool,
}

impl CommandBridge {
    pub fn new(settings: &BridgeSettings) -> Self {
        Self {
            command: settings.command.clone(),
            args: settings.args.clone(),
            pid: AtomicI32::new(0),
            quit: AtomicBool::new(false),
        }
    }

    fn render_args(&self, fd: i32, config: &BridgeConfig) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{fd}", &fd.to_string())
                    .replace("{port}", &config.proxy_port.to_string())
                    .replace("{mtu}", &config.mtu.to_string())
            })
            .collect()
    }

    fn signal(&self, sig: libc::c_int) -> bool {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid <= 0 {
            return false;
        }
        let rc = unsafe { libc::kill(pid, sig) };
        if rc != 0 {
            debug!(pid, sig, error = %std::io::Error::last_os_error(), "Bridge signal failed");
        }
        rc == 0
    }
}

impl BridgeEngine for CommandBridge {
    fn name(&self) -> &'static str {
        "command"
    }

    fn prepare(&self, _config: &BridgeConfig) -> Result<(), BridgeError> {
        if !self.args.iter().any(|arg| arg.contains("{fd}")) {
            return Err(BridgeError::Prepare(
                "bridge arguments never reference the {fd} placeholder".into(),
            ));
        }
        self.quit.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn run(&self, fd: Arc<TunFd>, config: &BridgeConfig) -> Result<i32, BridgeError> {
        if self.quit.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let raw = fd.raw_fd().ok_or(BridgeError::DescriptorClosed)?;

        let mut command = Command::new(&self.command);
        command
            .args(self.render_args(raw, config))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        // The descriptor carries FD_CLOEXEC; clear it in the child only
        unsafe {
            command.pre_exec(move || {
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags < 0 || libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = i32::try_from(child.id()).unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        info!(command = %self.command.display(), pid, fd = raw, "Bridge process started");

        // Quit may have raced the spawn
        if self.quit.load(Ordering::SeqCst) {
            self.signal(libc::SIGTERM);
        }

        if let Some(stderr) = child.stderr.take() {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => info!(target: "tunvisor::bridge", "{line}"),
                    Err(_) => break,
                }
            }
        }

        let status = child.wait();
        self.pid.store(0, Ordering::SeqCst);
        let status = status?;

        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(code),
            (None, Some(sig)) if self.quit.load(Ordering::SeqCst) => Ok(128 + sig),
            (None, sig) => {
                warn!(pid, signal = ?sig, "Bridge process killed");
                Err(BridgeError::Exited(format!("terminated by signal {sig:?}")))
            }
        }
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.signal(libc::SIGTERM);
    }

    fn abort(&self) -> bool {
        self.signal(libc::SIGKILL)
    }

    fn shares_host_process(&self) -> bool {
        false
    }
}
