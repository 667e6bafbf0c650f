//! The daemon's per-network connection record: everything needed to bring
//! up an overlay interface for one joined network without re-contacting the
//! control plane's join endpoint. Grounded on the teacher's
//! `InterfaceConfig`/`InterfaceInfo`/`ServerInfo` triad in
//! `shared/src/interface_config.rs`, trimmed of the admin-CLI invitation
//! file writer (`PeerInvitation`) since network join now happens over the
//! HTTP API (C6) rather than an out-of-band `.toml` file.

use crate::{chmod, ensure_dirs_exist, peer::Endpoint, Error, IoErrorContext, WrappedIoError};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use wireguard_control::InterfaceName;

/// Everything necessary to establish a goconnect overlay connection for one
/// network: local interface parameters plus how to reach the control plane.
#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    pub interface: InterfaceInfo,
    pub server: ServerInfo,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceInfo {
    /// The interface name (derived from the network name, e.g. "gc-eng").
    pub network_name: String,

    /// The IP allocated to this device inside the network's CIDR.
    pub address: IpNet,

    /// WireGuard private key (base64). Distinct from the long-lived device
    /// identity key in `~/.goconnect/identity.json` — a device may hold one
    /// overlay key per network.
    pub private_key: String,

    /// The local listen port. A random port is used if `None`.
    pub listen_port: Option<u16>,
}

#[derive(Clone, Deserialize, Serialize, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct ServerInfo {
    /// The control plane's own WireGuard public key, for the peer entry that
    /// represents the coordination API itself.
    pub public_key: String,

    /// The external endpoint WireGuard should dial.
    pub external_endpoint: Endpoint,

    /// The internal endpoint (inside the overlay) hosting the HTTP API.
    pub internal_endpoint: SocketAddr,
}

impl InterfaceConfig {
    /// Save a new config file, failing if it already exists.
    pub fn save_new(&self, path: impl AsRef<Path>, mode: u32) -> Result<(), WrappedIoError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .with_path(path)?;

        chmod(&file, mode).with_path(path)?;

        file.write_all(self.contents().as_bytes()).with_path(path)?;

        Ok(())
    }

    /// Overwrites the config file if it already exists.
    pub fn save(&self, config_dir: &Path, interface: &InterfaceName) -> Result<PathBuf, Error> {
        let path = Self::build_config_file_path(config_dir, interface)?;
        File::create(&path)
            .with_path(&path)?
            .write_all(self.contents().as_bytes())?;

        Ok(path)
    }

    fn contents(&self) -> String {
        toml::to_string(self).unwrap()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Ok(toml::from_str(
            &std::fs::read_to_string(&path).with_path(path)?,
        )?)
    }

    pub fn from_interface(config_dir: &Path, interface: &InterfaceName) -> Result<Self, Error> {
        let path = Self::build_config_file_path(config_dir, interface)?;
        crate::warn_on_dangerous_mode(&path).with_path(&path)?;
        Self::from_file(path)
    }

    pub fn get_path(config_dir: &Path, interface: &InterfaceName) -> PathBuf {
        config_dir
            .join(interface.to_string())
            .with_extension("conf")
    }

    fn build_config_file_path(
        config_dir: &Path,
        interface: &InterfaceName,
    ) -> Result<PathBuf, WrappedIoError> {
        ensure_dirs_exist(&[config_dir])?;
        Ok(Self::get_path(config_dir, interface))
    }
}

impl InterfaceInfo {
    pub fn public_key(&self) -> Result<String, Error> {
        Ok(wireguard_control::Key::from_base64(&self.private_key)?
            .get_public()
            .to_base64())
    }
}
