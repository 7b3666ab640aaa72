//! Interface Handle
//!
//! Resource wrappers for the virtual network interface granted by the OS.
//!
//! # Ownership
//!
//! ```text
//!  InterfaceHandle ──owns──▶ original descriptor   (released by the platform)
//!        │
//!        └─duplicate()──▶ TunFd ──shared──▶ bridge engine
//!                          (closed once by the orchestrator after the
//!                           bridge has quiesced)
//! ```
//!
//! Both descriptors refer to the same kernel object but carry independent
//! close obligations. The kernel tears the interface down only after the
//! last of them is closed.

use crate::config::InterfaceConfig;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Close-once wrapper around the duplicated interface descriptor.
///
/// Engines borrow the raw number while the wrapper holds ownership; the
/// first [`close`](TunFd::close) drops it and later calls are no-ops.
#[derive(Debug)]
pub struct TunFd {
    fd: Mutex<Option<OwnedFd>>,
    raw: RawFd,
}

impl TunFd {
    pub fn new(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            fd: Mutex::new(Some(fd)),
            raw,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<OwnedFd>> {
        self.fd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw descriptor number, `None` once closed
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.slot().as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Descriptor number this wrapper was created with (for logs)
    pub fn number(&self) -> RawFd {
        self.raw
    }

    /// Close the descriptor. Returns `true` if this call closed it.
    pub fn close(&self) -> bool {
        match self.slot().take() {
            Some(fd) => {
                drop(fd);
                debug!(fd = self.raw, "Closed duplicated tun descriptor");
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slot().is_none()
    }
}

/// The OS-granted virtual interface.
///
/// Owned by the orchestrator from acquisition until it is handed back to
/// the platform for release. Dropping the handle closes the descriptor.
#[derive(Debug)]
pub struct InterfaceHandle {
    name: String,
    fd: OwnedFd,
    config: InterfaceConfig,
    revoked: CancellationToken,
    released: CancellationToken,
}

impl InterfaceHandle {
    pub fn new(name: impl Into<String>, fd: OwnedFd, config: InterfaceConfig) -> Self {
        Self {
            name: name.into(),
            fd,
            config,
            revoked: CancellationToken::new(),
            released: CancellationToken::new(),
        }
    }

    /// Name the OS actually assigned
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn mtu(&self) -> u32 {
        self.config.mtu
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Duplicate the descriptor for hand-off to the bridge engine
    pub fn duplicate(&self) -> io::Result<TunFd> {
        let dup = self.fd.try_clone()?;
        debug!(original = self.raw_fd(), duplicate = dup.as_raw_fd(), "Duplicated tun descriptor");
        Ok(TunFd::new(dup))
    }

    /// Cancelled when the OS withdraws the interface out of band
    pub fn revocation(&self) -> CancellationToken {
        self.revoked.clone()
    }

    /// Signal out-of-band revocation
    pub fn revoke(&self) {
        self.revoked.cancel();
    }

    /// Cancelled once the handle has been released
    pub fn release_signal(&self) -> CancellationToken {
        self.released.clone()
    }

    /// Mark released and close the original descriptor
    pub fn close(self) {
        self.released.cancel();
        debug!(interface = %self.name, fd = self.raw_fd(), "Closing original tun descriptor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn devnull() -> OwnedFd {
        OwnedFd::from(File::open("/dev/null").unwrap())
    }

    #[test]
    fn test_tun_fd_closes_once() {
        let fd = TunFd::new(devnull());
        assert!(fd.raw_fd().is_some());

        assert!(fd.close());
        assert!(!fd.close());
        assert!(fd.is_closed());
        assert_eq!(fd.raw_fd(), None);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let handle = InterfaceHandle::new("tv-test", devnull(), InterfaceConfig::default());
        let dup = handle.duplicate().unwrap();

        assert_ne!(dup.raw_fd(), Some(handle.raw_fd()));
        assert!(dup.close());

        // Original is still usable after the duplicate is gone
        assert!(handle.duplicate().is_ok());
    }

    #[test]
    fn test_revocation_token() {
        let handle = InterfaceHandle::new("tv-test", devnull(), InterfaceConfig::default());
        let token = handle.revocation();
        assert!(!token.is_cancelled());

        handle.revoke();
        assert!(token.is_cancelled());

        let released = handle.release_signal();
        handle.close();
        assert!(released.is_cancelled());
    }
}
