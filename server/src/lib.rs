//! `goconnect-control`: the control-plane network service (C2-C6).
//!
//! Wires together the repository layer (C2), IPAM allocator (C3), audit
//! chain (C4), the network/membership service (C5), and the HTTP/WebSocket
//! API (C6) behind one [`AppState`], the equivalent of the teacher's
//! `Context` in `server/src/lib.rs`.

use std::{path::PathBuf, sync::Arc};

use goconnect_shared::domain::TenantId;

pub mod api;
pub mod audit;
pub mod ipam;
pub mod repo;
pub mod service;

#[cfg(test)]
mod test;

pub use goconnect_shared::error::{GoConnectError, Result};

/// On-disk configuration for the control plane daemon, analogous to the
/// teacher's `ConfigFile`/`ServerConfig` pair in `server/src/lib.rs`, but
/// scoped to the control-plane's own concerns (no WireGuard interface here
/// — that's the daemon's job, C7-C9).
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ControlPlaneConfig {
    pub listen_addr: std::net::SocketAddr,
    pub database_path: PathBuf,
    pub jwt_secret: String,
    /// Every Nth audit event gets an anchor row (spec §4.4).
    #[serde(default = "default_anchor_interval")]
    pub anchor_interval: u64,
    #[serde(default = "default_idempotency_retention_hours")]
    pub idempotency_retention_hours: i64,
}

fn default_anchor_interval() -> u64 {
    100
}

fn default_idempotency_retention_hours() -> i64 {
    24
}

impl ControlPlaneConfig {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Claims decoded from the bearer JWT by the auth middleware (spec §4.6(ii)).
/// Login/2FA mechanics that *produce* this token are out of scope (spec §1);
/// this struct is the documented boundary the external auth front-end must
/// satisfy.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: TenantId,
    pub is_admin: bool,
    pub is_moderator: bool,
    pub exp: i64,
}

/// The shared, cloneable application state every axum handler extracts.
/// Cheap to clone: everything inside is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn repo::Repository>,
    pub ipam: Arc<ipam::IpamService>,
    pub audit: Arc<audit::AuditChain>,
    pub service: Arc<service::MembershipService>,
    pub signaling: Arc<api::ws::SignalingBus>,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new_in_memory(jwt_secret: impl Into<String>) -> Self {
        let repo: Arc<dyn repo::Repository> = Arc::new(repo::memory::MemoryRepository::new());
        Self::new(repo, 100, jwt_secret)
    }

    pub fn new(
        repo: Arc<dyn repo::Repository>,
        anchor_interval: u64,
        jwt_secret: impl Into<String>,
    ) -> Self {
        let audit = Arc::new(audit::AuditChain::new(repo.clone(), anchor_interval));
        let ipam = Arc::new(ipam::IpamService::new());
        let service = Arc::new(service::MembershipService::new(
            repo.clone(),
            ipam.clone(),
            audit.clone(),
        ));
        Self {
            repo,
            ipam,
            audit,
            service,
            signaling: Arc::new(api::ws::SignalingBus::new()),
            jwt_secret: jwt_secret.into(),
        }
    }
}
