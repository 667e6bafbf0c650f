//! Daemon identity & keyring (spec §4.7/§4.8). One `Identity` per device,
//! generated on first run and pinned to disk — the daemon's analogue of the
//! teacher's `ConfigFile::write_to_path`/`from_file` create-with-chmod-0600
//! pattern in `server/src/lib.rs`, and `innernet_shared::chmod`.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use wireguard_control::KeyPair;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

fn chmod_owner_only(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms)?;
    }
    #[cfg(not(unix))]
    {
        let _ = file;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub device_id: String,
    pub private_key: String,
    pub public_key: String,
}

impl Identity {
    pub fn generate(device_id: String) -> Self {
        let keypair = KeyPair::generate();
        Self {
            device_id,
            private_key: keypair.private.to_base64(),
            public_key: keypair.public.to_base64(),
        }
    }

    pub fn default_path() -> PathBuf {
        dirs_home().join(".goconnect").join("identity.json")
    }

    /// Loads the identity at `path`, generating and persisting a fresh one
    /// (mode 0600) if absent — mirroring the teacher's config bootstrap.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        match Self::load(path) {
            Ok(identity) => Ok(identity),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let device_id = uuid::Uuid::new_v4().to_string();
                let identity = Self::generate(device_id);
                identity.write(path)?;
                Ok(identity)
            },
            Err(e) => Err(e),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut json = String::new();
        file.read_to_string(&mut json)?;
        serde_json::from_str(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        chmod_owner_only(&file)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

pub(crate) fn dirs_home() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Abstracts over where secrets (the identity keypair, the daemon's bearer
/// token from the control plane's login flow) are persisted. Spec §4.7
/// treats OS keyring integration (Windows DPAPI, macOS/Linux keyring) as an
/// external capability — `FileSecretStore` is the default, portable
/// implementation; platform backends are extension points, not delivered
/// here.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
    fn delete(&self, key: &str) -> io::Result<()>;
}

pub struct FileSecretStore {
    dir: PathBuf,
}

impl FileSecretStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.secret"))
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(key);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        chmod_owner_only(&file)?;
        std::fs::write(&path, value)
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// A real build would back `SecretStore` with DPAPI (Windows) or the system
// keyring (macOS/Linux); `FileSecretStore` is the portable fallback and the
// only backend wired up here.

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let identity = Identity::load_or_generate(&path).unwrap();
        let reloaded = Identity::load(&path).unwrap();
        assert_eq!(identity.device_id, reloaded.device_id);
        assert_eq!(identity.public_key, reloaded.public_key);
    }

    #[test]
    fn file_secret_store_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().to_path_buf());
        assert!(store.get("token").unwrap().is_none());
        store.set("token", "abc123").unwrap();
        assert_eq!(store.get("token").unwrap().as_deref(), Some("abc123"));
        store.delete("token").unwrap();
        assert!(store.get("token").unwrap().is_none());
    }
}
