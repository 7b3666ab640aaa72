//! Proxy engine configuration template.
//!
//! The template is an opaque JSON document owned by whoever packages the
//! engine. Only two fields are read from it: the local inbound port the
//! bridge connects to, and the name of a TUN inbound if the engine brings
//! up its own interface. The bytes are passed through unmodified.

use crate::config::DEFAULT_SOCKS_PORT;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the materialised config inside the work directory
pub const MATERIALIZED_NAME: &str = "engine.json";

/// Inbound types that expose a local SOCKS endpoint
const LOCAL_INBOUND_TYPES: &[&str] = &["socks", "mixed"];

#[derive(Debug, Clone)]
pub struct EngineTemplate {
    raw: String,
    local_port: u16,
    tun_interface: Option<String>,
}

impl EngineTemplate {
    /// Read and inspect a template file
    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(raw)
    }

    /// Inspect a template held in memory
    pub fn parse(raw: String) -> Result<Self, TemplateError> {
        let doc: Value = serde_json::from_str(&raw)?;
        let inbounds = doc
            .get("inbounds")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let local_port = inbounds
            .iter()
            .filter(|inbound| {
                inbound
                    .get("type")
                    .and_then(Value::as_str)
                    .is_some_and(|kind| LOCAL_INBOUND_TYPES.contains(&kind))
            })
            .find_map(|inbound| inbound.get("listen_port").and_then(Value::as_u64))
            .ok_or(TemplateError::NoLocalInbound)?;
        let local_port =
            u16::try_from(local_port).map_err(|_| TemplateError::InvalidPort(local_port))?;

        if local_port != DEFAULT_SOCKS_PORT {
            info!(
                port = local_port,
                expected = DEFAULT_SOCKS_PORT,
                "Template overrides the local inbound port"
            );
        }

        let tun_interface = inbounds
            .iter()
            .find(|inbound| inbound.get("type").and_then(Value::as_str) == Some("tun"))
            .and_then(|inbound| inbound.get("interface_name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            raw,
            local_port,
            tun_interface,
        })
    }

    /// Port of the local SOCKS inbound
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Interface name of a TUN inbound, if the engine creates one
    pub fn tun_interface(&self) -> Option<&str> {
        self.tun_interface.as_deref()
    }

    /// Write the template unmodified into `work_dir` and return its path.
    ///
    /// The returned path is absolute: the engine runs with `work_dir` as
    /// its current directory, where a relative path would no longer resolve.
    pub fn materialize(&self, work_dir: &Path) -> Result<PathBuf, TemplateError> {
        let work_dir = std::path::absolute(work_dir).map_err(write_error(work_dir))?;
        let path = work_dir.join(MATERIALIZED_NAME);
        std::fs::create_dir_all(&work_dir)
            .and_then(|()| std::fs::write(&path, self.raw.as_bytes()))
            .map_err(write_error(&path))?;

        debug!(path = %path.display(), bytes = self.raw.len(), "Engine config materialised");
        Ok(path)
    }
}

fn write_error(path: &Path) -> impl FnOnce(std::io::Error) -> TemplateError {
    let path = path.to_path_buf();
    move |source| TemplateError::Write { path, source }
}

/// Template errors
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Failed to read template {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Template is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Template has no local socks/mixed inbound with a listen_port")]
    NoLocalInbound,

    #[error("Template inbound port {0} is out of range")]
    InvalidPort(u64),

    #[error("Failed to write engine config {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const SING_BOX: &str = r#"{
        "log": { "level": "warn" },
        "inbounds": [
            { "type": "socks", "tag": "socks-in", "listen": "127.0.0.1", "listen_port": 10808 }
        ],
        "outbounds": [
            { "type": "vless", "server": "example.com", "server_port": 443 }
        ]
    }"#;

    #[test]
    fn test_reads_local_port() {
        let template = EngineTemplate::parse(SING_BOX.to_string()).unwrap();
        assert_eq!(template.local_port(), DEFAULT_SOCKS_PORT);
        assert_eq!(template.tun_interface(), None);
    }

    #[test]
    fn test_reads_tun_interface_and_mixed_port() {
        let raw = r#"{ "inbounds": [
            { "type": "tun", "interface_name": "BarbarisProxy" },
            { "type": "mixed", "listen_port": 1080 }
        ] }"#;
        let template = EngineTemplate::parse(raw.to_string()).unwrap();
        assert_eq!(template.local_port(), 1080);
        assert_eq!(template.tun_interface(), Some("BarbarisProxy"));
    }

    #[test]
    fn test_rejects_missing_inbound() {
        let raw = r#"{ "inbounds": [ { "type": "http", "listen_port": 8080 } ] }"#;
        assert!(matches!(
            EngineTemplate::parse(raw.to_string()),
            Err(TemplateError::NoLocalInbound)
        ));
        assert!(matches!(
            EngineTemplate::parse("{}".to_string()),
            Err(TemplateError::NoLocalInbound)
        ));
        assert!(matches!(
            EngineTemplate::parse("not json".to_string()),
            Err(TemplateError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_port() {
        let raw = r#"{ "inbounds": [ { "type": "socks", "listen_port": 70000 } ] }"#;
        assert!(matches!(
            EngineTemplate::parse(raw.to_string()),
            Err(TemplateError::InvalidPort(70000))
        ));
    }

    #[test]
    fn test_materialize_passes_bytes_through() {
        let dir = tempfile::tempdir().unwrap();
        let template = EngineTemplate::parse(SING_BOX.to_string()).unwrap();

        let path = template.materialize(&dir.path().join("nested")).unwrap();
        assert_eq!(path.file_name().unwrap(), MATERIALIZED_NAME);
        assert_eq!(std::fs::read_to_string(path).unwrap(), SING_BOX);
    }

    #[test]
    fn test_materialize_relative_work_dir_yields_absolute_path() {
        // tempdir_in(".") hands back a path relative to the current directory
        let dir = tempfile::tempdir_in(".").unwrap();
        let work_dir = dir.path().join("run");
        assert!(work_dir.is_relative());

        let template = EngineTemplate::parse(SING_BOX.to_string()).unwrap();
        let path = template.materialize(&work_dir).unwrap();

        assert!(path.is_absolute());
        assert!(path.ends_with(Path::new("run").join(MATERIALIZED_NAME)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SING_BOX);
    }
}
