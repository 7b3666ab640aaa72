//! Readiness Detection
//!
//! Decides when a freshly launched proxy engine is usable. Every poll
//! interval the checks run in a fixed order and the first decisive one
//! wins:
//!
//! 1. engine exited → [`Readiness::SubprocessDied`]
//! 2. expected interface present → ready
//! 3. a local port accepts connections → ready
//! 4. engine survived the grace period → ready (heuristic)
//! 5. overall timeout elapsed → [`Readiness::TimedOut`]
//!
//! The survival heuristic can report success for an engine that is alive
//! but unusable. Set `survival_grace_ms = 0` to disable it.

use crate::config::ReadinessSettings;
use crate::engine::EngineProcess;
use std::net::Ipv4Addr;
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Lookup of the host's network interfaces by name
pub trait InterfaceTable: Send + Sync {
    fn contains(&self, name: &str) -> bool;
}

/// Interfaces as reported by the OS
#[derive(Debug, Default)]
pub struct SystemInterfaces;

impl InterfaceTable for SystemInterfaces {
    fn contains(&self, name: &str) -> bool {
        sysinfo::Networks::new_with_refreshed_list()
            .list()
            .contains_key(name)
    }
}

/// Which check declared the engine ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    InterfacePresent(String),
    PortAccepting(u16),
    Survived(Duration),
}

impl std::fmt::Display for ReadySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadySignal::InterfacePresent(name) => write!(f, "interface {name} present"),
            ReadySignal::PortAccepting(port) => write!(f, "port {port} accepting"),
            ReadySignal::Survived(elapsed) => write!(f, "survived {}ms", elapsed.as_millis()),
        }
    }
}

/// Outcome of a readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready(ReadySignal),
    SubprocessDied(ExitStatus),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    timeout: Duration,
    poll_interval: Duration,
    survival_grace: Option<Duration>,
    connect_timeout: Duration,
    ports: Vec<u16>,
    interface: Option<String>,
}

impl ReadinessDetector {
    /// `local_port` is always probed first; `interface` is only checked if given
    pub fn new(settings: &ReadinessSettings, local_port: u16, interface: Option<String>) -> Self {
        let mut ports = vec![local_port];
        for port in &settings.ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }

        Self {
            timeout: settings.timeout(),
            poll_interval: settings.poll_interval(),
            survival_grace: settings.survival_grace(),
            connect_timeout: settings.connect_timeout(),
            ports,
            interface: settings.interface_name.clone().or(interface),
        }
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Poll until the engine is ready, dies, or the timeout elapses
    pub async fn wait(&self, engine: &mut EngineProcess, interfaces: &dyn InterfaceTable) -> Readiness {
        let started = Instant::now();
        debug!(
            ports = ?self.ports,
            interface = ?self.interface,
            timeout_ms = self.timeout.as_millis() as u64,
            "Waiting for proxy engine"
        );

        loop {
            tokio::time::sleep(self.poll_interval).await;

            if let Some(status) = engine.try_exited() {
                info!(%status, elapsed_ms = started.elapsed().as_millis() as u64, "Proxy engine exited during startup");
                return Readiness::SubprocessDied(status);
            }

            if let Some(signal) = self.probe(interfaces).await {
                info!(%signal, elapsed_ms = started.elapsed().as_millis() as u64, "Proxy engine ready");
                return Readiness::Ready(signal);
            }

            let elapsed = started.elapsed();
            if let Some(grace) = self.survival_grace {
                if elapsed >= grace {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        "No readiness signal observed; engine still alive, assuming ready"
                    );
                    return Readiness::Ready(ReadySignal::Survived(elapsed));
                }
            }

            if elapsed >= self.timeout {
                return Readiness::TimedOut;
            }
        }
    }

    async fn probe(&self, interfaces: &dyn InterfaceTable) -> Option<ReadySignal> {
        if let Some(name) = &self.interface {
            if interfaces.contains(name) {
                return Some(ReadySignal::InterfacePresent(name.clone()));
            }
        }

        for &port in &self.ports {
            if self.port_accepts(port).await {
                return Some(ReadySignal::PortAccepting(port));
            }
        }
        None
    }

    async fn port_accepts(&self, port: u16) -> bool {
        matches!(
            tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            )
            .await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use std::path::{Path, PathBuf};

    struct Table(Vec<&'static str>);

    impl InterfaceTable for Table {
        fn contains(&self, name: &str) -> bool {
            self.0.contains(&name)
        }
    }

    fn engine(script: &str) -> EngineProcess {
        let settings = EngineSettings {
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            work_dir: std::env::temp_dir(),
            ..EngineSettings::default()
        };
        EngineProcess::launch(&settings, Path::new("/tmp/engine.json")).unwrap()
    }

    fn settings(survival_grace_ms: u64) -> ReadinessSettings {
        ReadinessSettings {
            timeout_ms: 600,
            poll_interval_ms: 50,
            survival_grace_ms,
            ..ReadinessSettings::default()
        }
    }

    #[test]
    fn test_ports_deduplicated() {
        let detector = ReadinessDetector::new(
            &ReadinessSettings {
                ports: vec![8080, 10808, 1080],
                ..ReadinessSettings::default()
            },
            10808,
            None,
        );
        assert_eq!(detector.ports(), &[10808, 8080, 1080]);
    }

    #[test]
    fn test_configured_interface_wins() {
        let detector = ReadinessDetector::new(
            &ReadinessSettings {
                interface_name: Some("wintun".into()),
                ..ReadinessSettings::default()
            },
            10808,
            Some("from-template".into()),
        );
        assert_eq!(detector.interface(), Some("wintun"));
    }

    #[tokio::test]
    async fn test_port_accepting() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut engine = engine("sleep 30");

        let detector = ReadinessDetector::new(&settings(0), port, None);
        let outcome = detector.wait(&mut engine, &Table(vec![])).await;
        assert_eq!(outcome, Readiness::Ready(ReadySignal::PortAccepting(port)));

        engine.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_interface_present() {
        let mut engine = engine("sleep 30");

        let detector = ReadinessDetector::new(&settings(0), 1, Some("tv-ready".into()));
        let outcome = detector.wait(&mut engine, &Table(vec!["lo", "tv-ready"])).await;
        assert_eq!(outcome, Readiness::Ready(ReadySignal::InterfacePresent("tv-ready".into())));

        engine.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_subprocess_died() {
        let mut engine = engine("exit 3");

        let detector = ReadinessDetector::new(&settings(2000), 1, None);
        match detector.wait(&mut engine, &Table(vec![])).await {
            Readiness::SubprocessDied(status) => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_survival_heuristic() {
        let mut engine = engine("sleep 30");

        let detector = ReadinessDetector::new(&settings(200), 1, None);
        match detector.wait(&mut engine, &Table(vec![])).await {
            Readiness::Ready(ReadySignal::Survived(elapsed)) => {
                assert!(elapsed >= Duration::from_millis(200))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        engine.terminate(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_timeout_without_heuristic() {
        let mut engine = engine("sleep 30");
        let started = Instant::now();

        let detector = ReadinessDetector::new(&settings(0), 1, None);
        assert_eq!(detector.wait(&mut engine, &Table(vec![])).await, Readiness::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(600));

        engine.terminate(Duration::from_secs(1)).await;
    }
}
