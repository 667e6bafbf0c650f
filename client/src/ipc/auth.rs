//! IPC token authenticator (spec §4.11). A 256-bit token, generated at
//! daemon startup and written to `~/.goconnect/ipc.token` mode 0600,
//! gates every local RPC. The constant-time compare mirrors the teacher's
//! own innernet-pubkey header check in `server/src/lib.rs::get_session`.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tonic::{service::Interceptor, Request, Status};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub struct IpcToken(String);

impl IpcToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex_encode(&bytes))
    }

    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".goconnect")
            .join("ipc.token")
    }

    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        #[cfg(unix)]
        {
            let mut perms = file.metadata()?.permissions();
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }
        (&file).write_all(self.0.as_bytes())?;
        Ok(())
    }

    pub fn delete(path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut token = String::new();
        file.read_to_string(&mut token)?;
        Ok(Self(token.trim().to_string()))
    }

    fn matches(&self, candidate: &str) -> bool {
        let expected = self.0.as_bytes();
        let actual = candidate.as_bytes();
        expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[derive(Clone)]
pub struct TokenInterceptor {
    token: std::sync::Arc<IpcToken>,
}

impl TokenInterceptor {
    pub fn new(token: IpcToken) -> Self {
        Self { token: std::sync::Arc::new(token) }
    }
}

impl Interceptor for TokenInterceptor {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        let header = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let candidate = header.strip_prefix("Bearer ").unwrap_or("");
        if self.token.matches(candidate) {
            Ok(req)
        } else {
            Err(Status::unauthenticated("invalid or missing IPC token"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_token_is_rejected() {
        let token = IpcToken("a".repeat(64));
        assert!(token.matches(&"a".repeat(64)));
        assert!(!token.matches(&"b".repeat(64)));
        assert!(!token.matches("short"));
    }
}
