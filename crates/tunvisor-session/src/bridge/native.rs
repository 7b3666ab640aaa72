//! In-process bridge engine linking hev-socks5-tunnel.
//!
//! The library keeps global state, so only one instance may run at a time
//! and it shares the host's descriptor table. If it ignores quit there is
//! no way to stop it short of ending the process.

use super::{BridgeConfig, BridgeEngine, BridgeError, BridgeStats};
use crate::interface::TunFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[link(name = "hev-socks5-tunnel")]
unsafe extern "C" {
    fn hev_socks5_tunnel_main_from_str(
        config: *const u8,
        config_len: libc::c_uint,
        tun_fd: libc::c_int,
    ) -> libc::c_int;

    fn hev_socks5_tunnel_quit();

    fn hev_socks5_tunnel_stats(
        tx_packets: *mut libc::size_t,
        tx_bytes: *mut libc::size_t,
        rx_packets: *mut libc::size_t,
        rx_bytes: *mut libc::size_t,
    );
}

static ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Default)]
pub struct HevBridge {
    running: AtomicBool,
    quit_requested: AtomicBool,
}

impl HevBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BridgeEngine for HevBridge {
    fn name(&self) -> &'static str {
        "hev-socks5-tunnel"
    }

    fn prepare(&self, config: &BridgeConfig) -> Result<(), BridgeError> {
        if ACTIVE.load(Ordering::SeqCst) {
            return Err(BridgeError::Prepare(
                "another hev-socks5-tunnel instance is still running".into(),
            ));
        }
        self.quit_requested.store(false, Ordering::SeqCst);
        libc::c_uint::try_from(config.to_yaml().len())
            .map(|_| ())
            .map_err(|_| BridgeError::Prepare("config too large".into()))
    }

    fn run(&self, fd: Arc<TunFd>, config: &BridgeConfig) -> Result<i32, BridgeError> {
        let raw = fd.raw_fd().ok_or(BridgeError::DescriptorClosed)?;
        let yaml = config.to_yaml();
        let len = libc::c_uint::try_from(yaml.len())
            .map_err(|_| BridgeError::Prepare("config too large".into()))?;

        if ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Prepare(
                "another hev-socks5-tunnel instance is still running".into(),
            ));
        }
        self.running.store(true, Ordering::SeqCst);
        if self.quit_requested.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            ACTIVE.store(false, Ordering::SeqCst);
            return Ok(0);
        }
        debug!(fd = raw, "Entering hev-socks5-tunnel");

        // `fd` stays alive for the whole call, so `raw` remains valid
        let rc = unsafe { hev_socks5_tunnel_main_from_str(yaml.as_ptr(), len, raw) };

        self.running.store(false, Ordering::SeqCst);
        ACTIVE.store(false, Ordering::SeqCst);
        info!(rc, "hev-socks5-tunnel returned");

        if rc < 0 {
            return Err(BridgeError::Exited(format!("hev-socks5-tunnel rc={rc}")));
        }
        Ok(rc)
    }

    fn quit(&self) {
        self.quit_requested.store(true, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            unsafe { hev_socks5_tunnel_quit() };
        }
    }

    /// No hard stop exists; re-issue quit instead. A quit that landed
    /// between `run` marking itself running and the engine loop starting
    /// is lost, and this second one reaches the live loop.
    fn abort(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        debug!("Re-issuing hev-socks5-tunnel quit");
        unsafe { hev_socks5_tunnel_quit() };
        true
    }

    fn stats(&self) -> Option<BridgeStats> {
        let (mut tx_packets, mut tx_bytes, mut rx_packets, mut rx_bytes) = (0, 0, 0, 0);
        unsafe {
            hev_socks5_tunnel_stats(&mut tx_packets, &mut tx_bytes, &mut rx_packets, &mut rx_bytes);
        }
        Some(BridgeStats {
            tx_packets: tx_packets as u64,
            tx_bytes: tx_bytes as u64,
            rx_packets: rx_packets as u64,
            rx_bytes: rx_bytes as u64,
        })
    }

    fn shares_host_process(&self) -> bool {
        true
    }
}
