//! On-disk daemon configuration (spec §6): `~/.goconnect/config.yaml`, the
//! one place this daemon parses YAML rather than TOML like
//! `goconnect_control::ControlPlaneConfig` — a human is expected to hand-edit
//! this file, and YAML tolerates that better than TOML's stricter quoting.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DaemonConfig {
    /// Base URL of the control-plane HTTP API, e.g. `https://control.example.com`.
    pub control_plane_url: String,
    pub device_name: String,
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    #[serde(default)]
    pub tcp_ipc_enabled: bool,
    #[serde(default = "default_ipc_socket_path")]
    pub ipc_socket_path: PathBuf,
    #[serde(default)]
    pub no_write_hosts: bool,
}

fn default_interface() -> String {
    "goconnect0".to_string()
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_ipc_socket_path() -> PathBuf {
    PathBuf::from("/run/goconnectd.sock")
}

impl DaemonConfig {
    pub fn default_path() -> PathBuf {
        crate::identity::dirs_home().join(".goconnect").join("config.yaml")
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(crate::identity::Identity::default_path)
    }
}
