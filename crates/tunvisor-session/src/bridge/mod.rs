//! Bridge Engine
//!
//! The bridge relays packets between the virtual interface descriptor and
//! the proxy engine's local SOCKS inbound. Its run entry point blocks for
//! the whole session, so it is driven from a dedicated OS thread.
//!
//! ```text
//!   TunFd ──▶ BridgeEngine::run (thread "tun-bridge") ──▶ socks5://127.0.0.1:{port}
//!                 ▲
//!   quit() ───────┘   (run returns; the join is bounded by the caller)
//! ```

mod command;
#[cfg(feature = "native-bridge")]
mod native;

pub use command::CommandBridge;
#[cfg(feature = "native-bridge")]
pub use native::HevBridge;

use crate::config::{BridgeKind, BridgeSettings};
use crate::interface::TunFd;
use crate::orchestrator::SessionError;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Parameters handed to a bridge engine at start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub proxy_addr: IpAddr,
    pub proxy_port: u16,
    pub mtu: u32,
    pub udp: bool,
}

impl BridgeConfig {
    pub fn new(settings: &BridgeSettings, proxy_port: u16, mtu: u32) -> Self {
        Self {
            proxy_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy_port,
            mtu,
            udp: settings.udp,
        }
    }

    /// Render as a hev-socks5-tunnel YAML document
    pub fn to_yaml(&self) -> String {
        format!(
            "tunnel:\n  mtu: {}\nsocks5:\n  address: {}\n  port: {}\n  udp: {}\n",
            self.mtu,
            self.proxy_addr,
            self.proxy_port,
            if self.udp { "udp" } else { "tcp" }
        )
    }
}

/// Packet and byte counters reported by a bridge engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
}

impl std::fmt::Display for BridgeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tx={}/{} rx={}/{}",
            self.tx_packets, self.tx_bytes, self.rx_packets, self.rx_bytes
        )
    }
}

/// Bridge engine errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bridge configuration rejected: {0}")]
    Prepare(String),

    #[error("Failed to spawn bridge: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Tun descriptor was closed before the bridge started")]
    DescriptorClosed,

    #[error("Bridge exited abnormally: {0}")]
    Exited(String),
}

/// A packet relay between a tun descriptor and a local SOCKS endpoint
pub trait BridgeEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate the config before the worker thread is spawned
    fn prepare(&self, _config: &BridgeConfig) -> Result<(), BridgeError> {
        Ok(())
    }

    /// Relay until quit. Blocks the calling thread and returns the exit code.
    fn run(&self, fd: Arc<TunFd>, config: &BridgeConfig) -> Result<i32, BridgeError>;

    /// Ask `run` to return. Must be safe to call from any thread, at any time.
    fn quit(&self);

    /// Forcefully stop an engine that ignored `quit`.
    /// Returns `false` if the engine has no such means.
    fn abort(&self) -> bool {
        false
    }

    fn stats(&self) -> Option<BridgeStats> {
        None
    }

    /// Whether the engine runs inside this process rather than a child
    fn shares_host_process(&self) -> bool;
}

/// Pick the bridge implementation named by the settings
pub fn select(settings: &BridgeSettings) -> Result<Arc<dyn BridgeEngine>, SessionError> {
    match settings.kind {
        BridgeKind::Command => Ok(Arc::new(CommandBridge::new(settings))),
        #[cfg(feature = "native-bridge")]
        BridgeKind::Native => Ok(Arc::new(HevBridge::new())),
        #[cfg(not(feature = "native-bridge"))]
        BridgeKind::Native => Err(SessionError::Config(
            "native bridge requested but the native-bridge feature is disabled".into(),
        )),
    }
}

/// A bridge engine running on its worker thread
pub struct BridgeHandle {
    engine: Arc<dyn BridgeEngine>,
    thread: Option<std::thread::JoinHandle<()>>,
    done: Option<oneshot::Receiver<Result<i32, BridgeError>>>,
}

impl BridgeHandle {
    /// Prepare the engine and start it on a dedicated thread
    pub fn start(
        engine: Arc<dyn BridgeEngine>,
        fd: Arc<TunFd>,
        config: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        engine.prepare(&config)?;

        let (tx, rx) = oneshot::channel();
        let worker = engine.clone();
        let thread = std::thread::Builder::new()
            .name("tun-bridge".into())
            .spawn(move || {
                info!(
                    engine = worker.name(),
                    fd = fd.number(),
                    port = config.proxy_port,
                    "Bridge engine running"
                );
                let result = worker.run(fd, &config);
                let _ = tx.send(result);
            })?;

        Ok(Self {
            engine,
            thread: Some(thread),
            done: Some(rx),
        })
    }

    pub fn name(&self) -> &'static str {
        self.engine.name()
    }

    /// Whether the worker thread has returned
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn quit(&self) {
        debug!(engine = self.engine.name(), "Signalling bridge quit");
        self.engine.quit();
    }

    pub fn abort(&self) -> bool {
        self.engine.abort()
    }

    /// Wait up to `timeout` for the worker to return. Returns `false` on timeout.
    pub async fn join(&mut self, timeout: Duration) -> bool {
        let Some(done) = self.done.as_mut() else {
            return true;
        };

        match tokio::time::timeout(timeout, done).await {
            Ok(outcome) => {
                match outcome {
                    Ok(Ok(code)) => info!(engine = self.engine.name(), code, "Bridge engine exited"),
                    Ok(Err(e)) => warn!(engine = self.engine.name(), error = %e, "Bridge engine failed"),
                    Err(_) => warn!(engine = self.engine.name(), "Bridge thread ended without a result"),
                }
                self.done = None;
                // The thread is past its last statement; detach it
                self.thread.take();
                true
            }
            Err(_) => false,
        }
    }

    pub fn stats(&self) -> Option<BridgeStats> {
        self.engine.stats()
    }

    pub fn shares_host_process(&self) -> bool {
        self.engine.shares_host_process()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("engine", &self.engine.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::OwnedFd;
    use std::sync::{Condvar, Mutex};

    /// Blocks in `run` until quit is signalled
    #[derive(Default)]
    struct Parked {
        quit: Mutex<bool>,
        cond: Condvar,
        ignore_quit: bool,
    }

    impl BridgeEngine for Parked {
        fn name(&self) -> &'static str {
            "parked"
        }

        fn run(&self, _fd: Arc<TunFd>, _config: &BridgeConfig) -> Result<i32, BridgeError> {
            let mut quit = self.quit.lock().unwrap();
            while !*quit {
                quit = self.cond.wait(quit).unwrap();
            }
            Ok(0)
        }

        fn quit(&self) {
            if !self.ignore_quit {
                *self.quit.lock().unwrap() = true;
                self.cond.notify_all();
            }
        }

        fn shares_host_process(&self) -> bool {
            true
        }
    }

    fn tun_fd() -> Arc<TunFd> {
        Arc::new(TunFd::new(OwnedFd::from(File::open("/dev/null").unwrap())))
    }

    fn config() -> BridgeConfig {
        BridgeConfig::new(&BridgeSettings::default(), 10808, 1380)
    }

    #[test]
    fn test_yaml_rendering() {
        let yaml = config().to_yaml();
        assert!(yaml.contains("mtu: 1380"));
        assert!(yaml.contains("address: 127.0.0.1"));
        assert!(yaml.contains("port: 10808"));
        assert!(yaml.contains("udp: udp"));

        let tcp = BridgeConfig {
            udp: false,
            ..config()
        };
        assert!(tcp.to_yaml().contains("udp: tcp"));
    }

    #[test]
    fn test_select_command_by_default() {
        let engine = select(&BridgeSettings::default()).unwrap();
        assert_eq!(engine.name(), "command");
        assert!(!engine.shares_host_process());
    }

    #[tokio::test]
    async fn test_handle_quit_and_join() {
        let engine = Arc::new(Parked::default());
        let mut handle = BridgeHandle::start(engine, tun_fd(), config()).unwrap();

        assert!(!handle.join(Duration::from_millis(50)).await);
        assert!(!handle.is_finished());

        handle.quit();
        assert!(handle.join(Duration::from_secs(2)).await);
        assert!(handle.is_finished());
        // Joining again is immediate
        assert!(handle.join(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_handle_join_times_out_when_stuck() {
        let engine = Arc::new(Parked {
            ignore_quit: true,
            ..Parked::default()
        });
        let mut handle = BridgeHandle::start(engine.clone(), tun_fd(), config()).unwrap();

        handle.quit();
        assert!(!handle.join(Duration::from_millis(100)).await);
        assert!(!handle.abort());

        // Release the thread so the test process can exit cleanly
        *engine.quit.lock().unwrap() = true;
        engine.cond.notify_all();
        assert!(handle.join(Duration::from_secs(2)).await);
    }
}
