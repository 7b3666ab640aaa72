//! Linux TUN platform.
//!
//! The interface comes from `/dev/net/tun` via `TUNSETIFF` and is
//! configured with iproute2. Tunnel routes live in a dedicated table
//! selected by a policy rule; uids excluded from the tunnel get
//! higher-priority rules pointing back at `main`.
//!
//! ```text
//!   prio 9000+i  uidrange U-U lookup main     (self, disallowed_uids)
//!   prio 9100    lookup <route_table>         (routes via tunvisor0)
//! ```

use super::Platform;
use crate::config::{InterfaceConfig, Route};
use crate::interface::InterfaceHandle;
use crate::orchestrator::SessionError;
use anyhow::{Context, bail};
use async_trait::async_trait;
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

const UID_RULE_PRIORITY: u32 = 9000;
const TABLE_RULE_PRIORITY: u32 = 9100;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Open a TUN device named `name`; returns the descriptor and the name
/// the kernel actually assigned
fn open_tun(name: &str) -> io::Result<(OwnedFd, String)> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }

    let file = OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;

    let mut req = IfReq {
        name: [0; libc::IFNAMSIZ],
        flags: IFF_TUN | IFF_NO_PI,
        _pad: [0; 22],
    };
    for (dst, src) in req.name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    let assigned = unsafe { CStr::from_ptr(req.name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok((OwnedFd::from(file), assigned))
}

fn family_flag(ipv6: bool) -> &'static str {
    if ipv6 { "-6" } else { "-4" }
}

/// `ip` argument vectors for the policy rules of a session, without the
/// leading `add`/`del` verb position filled in
fn rule_specs(config: &InterfaceConfig, self_uid: Option<u32>) -> Vec<Vec<String>> {
    let mut uids: Vec<u32> = self_uid.into_iter().collect();
    for uid in &config.disallowed_uids {
        if !uids.contains(uid) {
            uids.push(*uid);
        }
    }

    let mut families = Vec::new();
    if config.routes.iter().any(|r| r.addr.is_ipv4()) {
        families.push(false);
    }
    if config.routes.iter().any(|r| r.addr.is_ipv6()) {
        families.push(true);
    }

    let mut specs = Vec::new();
    for ipv6 in families {
        for (i, uid) in uids.iter().enumerate() {
            specs.push(vec![
                family_flag(ipv6).to_string(),
                "rule".into(),
                format!("uidrange {uid}-{uid}"),
                "lookup main".into(),
                format!("priority {}", UID_RULE_PRIORITY + i as u32),
            ]);
        }
        specs.push(vec![
            family_flag(ipv6).to_string(),
            "rule".into(),
            format!("lookup {}", config.route_table),
            format!("priority {TABLE_RULE_PRIORITY}"),
        ]);
    }
    specs
}

/// Expand a rule spec into `ip` arguments with the given verb
fn rule_args(spec: &[String], verb: &str) -> Vec<String> {
    let mut args: Vec<String> = spec[..2].to_vec();
    args.push(verb.to_string());
    args.extend(spec[2..].iter().flat_map(|part| part.split(' ').map(str::to_string)));
    args
}

fn route_args(route: &Route, name: &str, table: u32) -> Vec<String> {
    vec![
        family_flag(route.addr.is_ipv6()).to_string(),
        "route".into(),
        "replace".into(),
        route.to_string(),
        "dev".into(),
        name.to_string(),
        "table".into(),
        table.to_string(),
    ]
}

async fn run(program: &str, args: &[String]) -> anyhow::Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    debug!(program, args = %args.join(" "), "Command ok");
    Ok(())
}

#[derive(Debug)]
pub struct LinuxPlatform {
    presence_poll: Duration,
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self {
            presence_poll: Duration::from_secs(2),
        }
    }
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn self_uid(config: &InterfaceConfig) -> Option<u32> {
        config.exclude_self.then(|| unsafe { libc::getuid() })
    }

    async fn configure(&self, name: &str, config: &InterfaceConfig) -> anyhow::Result<()> {
        let ip = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        run(
            "ip",
            &ip(&["addr", "add", &format!("{}/{}", config.address, config.prefix_len), "dev", name]),
        )
        .await
        .context("assigning interface address")?;
        run("ip", &ip(&["link", "set", "dev", name, "mtu", &config.mtu.to_string(), "up"]))
            .await
            .context("bringing interface up")?;

        for route in &config.routes {
            run("ip", &route_args(route, name, config.route_table))
                .await
                .with_context(|| format!("adding route {route}"))?;
        }
        for spec in rule_specs(config, Self::self_uid(config)) {
            run("ip", &rule_args(&spec, "add"))
                .await
                .context("adding policy rule")?;
        }

        if !config.dns.is_empty() {
            let mut args = vec!["dns".to_string(), name.to_string()];
            args.extend(config.dns.iter().map(|d| d.to_string()));
            let dns = async {
                run("resolvectl", &args).await?;
                run("resolvectl", &ip(&["domain", name, "~."])).await
            };
            if let Err(e) = dns.await {
                warn!(interface = name, error = %e, "Could not set tunnel DNS, continuing");
            }
        }
        Ok(())
    }

    async fn remove_rules(config: &InterfaceConfig) -> anyhow::Result<()> {
        let mut first_error = None;
        for spec in rule_specs(config, Self::self_uid(config)) {
            if let Err(e) = run("ip", &rule_args(&spec, "del")).await {
                warn!(error = %e, "Failed to remove policy rule");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Treat the interface vanishing from sysfs as revocation
    fn watch_presence(&self, name: String, revoked: CancellationToken, released: CancellationToken) {
        let poll = self.presence_poll;
        tokio::spawn(async move {
            let path = Path::new("/sys/class/net").join(&name);
            loop {
                tokio::select! {
                    _ = released.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {
                        if !path.exists() {
                            warn!(interface = %name, "Interface disappeared, treating as revoked");
                            revoked.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    async fn acquire_interface(&self, config: &InterfaceConfig) -> Result<InterfaceHandle, SessionError> {
        let (fd, name) = open_tun(&config.name).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => {
                SessionError::ConsentDenied(format!("{TUN_DEVICE}: {e} (CAP_NET_ADMIN required)"))
            }
            _ => SessionError::InterfaceUnavailable(format!("{TUN_DEVICE}: {e}")),
        })?;
        info!(interface = %name, fd = fd.as_raw_fd(), "TUN interface created");

        if let Err(e) = self.configure(&name, config).await {
            // Dropping `fd` removes the interface together with its routes
            let _ = Self::remove_rules(config).await;
            return Err(SessionError::InterfaceUnavailable(format!("{e:#}")));
        }

        let handle = InterfaceHandle::new(name.clone(), fd, config.clone());
        self.watch_presence(name, handle.revocation(), handle.release_signal());
        info!(
            interface = handle.name(),
            address = %config.address,
            mtu = config.mtu,
            routes = config.routes.len(),
            "TUN interface configured"
        );
        Ok(handle)
    }

    async fn release_interface(&self, handle: InterfaceHandle) -> anyhow::Result<()> {
        let result = Self::remove_rules(handle.config()).await;
        info!(interface = handle.name(), "Releasing TUN interface");
        handle.close();
        result
    }
}
