//! `SqlRepository`: a `rusqlite::Connection` behind `Arc<parking_lot::Mutex<_>>`
//! (the teacher's `Db` type alias in `server/src/lib.rs`), schema-migrated
//! idempotently (`CREATE TABLE IF NOT EXISTS`) per spec §4.2/§6.
//!
//! A `SqlDialect` renders the handful of queries that differ between
//! PostgreSQL (`$1`) and SQLite (`?1`); only `Sqlite` is wired to a live
//! driver here (see DESIGN.md for why Postgres is left as a dialect-only
//! stub — concrete driver selection is out of scope per spec §1) but the
//! abstraction means a `Postgres` backend is additive.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goconnect_shared::{
    domain::*,
    error::{ConflictKind, GoConnectError, Result},
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio_util::sync::CancellationToken;

use super::idempotency::{IdempotencyRecord, IdempotencyStore};
use super::{AuditRepo, ChatRepo, DeviceRepo, InviteRepo, MembershipRepo, NetworkRepo, TenantRepo};

/// Placeholder-rendering dialect, per spec §9 ("the SQL dialect difference
/// ... is encapsulated in a driver-private query builder").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    /// Renders the Nth (1-indexed) positional placeholder for this dialect.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            SqlDialect::Sqlite => format!("?{n}"),
            SqlDialect::Postgres => format!("${n}"),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    visibility TEXT NOT NULL,
    join_policy TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    email TEXT NOT NULL,
    display_name TEXT NOT NULL,
    is_admin INTEGER NOT NULL,
    is_moderator INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS networks (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    cidr TEXT NOT NULL,
    visibility TEXT NOT NULL,
    join_policy TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS memberships (
    network_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    role TEXT NOT NULL,
    joined_at TEXT NOT NULL,
    allocated_ip TEXT,
    last_seen TEXT,
    PRIMARY KEY (network_id, user_id)
);
CREATE TABLE IF NOT EXISTS ip_allocations (
    network_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    ip TEXT NOT NULL,
    PRIMARY KEY (network_id, user_id)
);
CREATE TABLE IF NOT EXISTS devices (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    platform TEXT NOT NULL,
    public_key TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    os_version TEXT,
    daemon_version TEXT,
    last_seen TEXT,
    disabled_at TEXT
);
CREATE TABLE IF NOT EXISTS invites (
    id TEXT PRIMARY KEY,
    scope_kind TEXT NOT NULL,
    scope_id TEXT NOT NULL,
    code TEXT NOT NULL UNIQUE,
    max_uses INTEGER NOT NULL,
    use_count INTEGER NOT NULL,
    expires_at TEXT,
    created_by TEXT NOT NULL,
    revoked_at TEXT
);
CREATE TABLE IF NOT EXISTS audit_events (
    seq INTEGER PRIMARY KEY,
    ts TEXT NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    object TEXT NOT NULL,
    details TEXT NOT NULL,
    request_id TEXT NOT NULL,
    chain_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_chain_anchors (
    seq INTEGER PRIMARY KEY,
    ts TEXT NOT NULL,
    chain_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    body TEXT NOT NULL,
    attachments TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT
);
CREATE TABLE IF NOT EXISTS chat_message_edits (
    message_id TEXT NOT NULL,
    prev_body TEXT NOT NULL,
    new_body TEXT NOT NULL,
    editor_id TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS idempotency_records (
    key TEXT PRIMARY KEY,
    fingerprint TEXT NOT NULL,
    response_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .map_err(|e| GoConnectError::Dependency(e.to_string()))
}

pub struct SqlRepository {
    conn: Arc<Mutex<Connection>>,
    dialect: SqlDialect,
}

impl SqlRepository {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| GoConnectError::Dependency(e.to_string()))?;
        conn.pragma_update(None, "foreign_keys", 1)
            .map_err(|e| GoConnectError::Dependency(e.to_string()))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: SqlDialect::Sqlite,
        })
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }
}

fn map_sqlite(e: rusqlite::Error) -> GoConnectError {
    GoConnectError::Dependency(e.to_string())
}

fn row_to_tenant(row: &rusqlite::Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: TenantId(row.get(0)?),
        name: row.get(1)?,
        visibility: parse_visibility(row.get::<_, String>(2)?),
        join_policy: parse_join_policy(row.get::<_, String>(3)?),
        created_at: parse_ts(row.get::<_, String>(4)?),
    })
}

fn parse_visibility(s: String) -> Visibility {
    if s == "private" {
        Visibility::Private
    } else {
        Visibility::Public
    }
}

fn parse_join_policy(s: String) -> JoinPolicy {
    match s.as_str() {
        "code" => JoinPolicy::Code,
        "approval" => JoinPolicy::Approval,
        _ => JoinPolicy::Open,
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl TenantRepo for SqlRepository {
    async fn create_tenant(&self, _ct: CancellationToken, tenant: Tenant) -> Result<Tenant> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tenants (id, name, visibility, join_policy, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tenant.id.0,
                tenant.name,
                format!("{:?}", tenant.visibility).to_lowercase(),
                format!("{:?}", tenant.join_policy).to_lowercase(),
                tenant.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                GoConnectError::conflict(ConflictKind::AlreadyExists, "tenant already exists")
            },
            other => map_sqlite(other),
        })?;
        Ok(tenant)
    }

    async fn get_tenant(&self, _ct: CancellationToken, id: &TenantId) -> Result<Tenant> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, visibility, join_policy, created_at FROM tenants WHERE id = ?1",
            params![id.0],
            row_to_tenant,
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or_else(|| GoConnectError::not_found("tenant"))
    }

    async fn list_public_tenants(&self, _ct: CancellationToken) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, visibility, join_policy, created_at FROM tenants WHERE visibility = 'public'")
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], row_to_tenant)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn search_tenants(&self, _ct: CancellationToken, q: &str) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock();
        let like = format!("%{}%", q.to_lowercase());
        let mut stmt = conn
            .prepare(
                "SELECT id, name, visibility, join_policy, created_at FROM tenants WHERE visibility = 'public' AND lower(name) LIKE ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![like], row_to_tenant)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn update_tenant(&self, _ct: CancellationToken, tenant: Tenant) -> Result<Tenant> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE tenants SET name = ?2, visibility = ?3, join_policy = ?4 WHERE id = ?1",
                params![
                    tenant.id.0,
                    tenant.name,
                    format!("{:?}", tenant.visibility).to_lowercase(),
                    format!("{:?}", tenant.join_policy).to_lowercase(),
                ],
            )
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("tenant"));
        }
        Ok(tenant)
    }

    async fn delete_tenant(&self, _ct: CancellationToken, id: &TenantId) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM tenants WHERE id = ?1", params![id.0])
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("tenant"));
        }
        Ok(())
    }

    async fn get_user(&self, _ct: CancellationToken, id: &UserId) -> Result<User> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, email, display_name, is_admin, is_moderator FROM users WHERE id = ?1",
            params![id.0],
            |row| {
                Ok(User {
                    id: UserId(row.get(0)?),
                    tenant_id: TenantId(row.get(1)?),
                    email: row.get(2)?,
                    display_name: row.get(3)?,
                    is_admin: row.get::<_, i64>(4)? != 0,
                    is_moderator: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or_else(|| GoConnectError::not_found("user"))
    }
}

#[async_trait]
impl NetworkRepo for SqlRepository {
    async fn create_network(&self, _ct: CancellationToken, network: Network) -> Result<Network> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO networks (id, tenant_id, name, cidr, visibility, join_policy, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                network.id.0,
                network.tenant_id.0,
                network.name,
                network.cidr.to_string(),
                format!("{:?}", network.visibility).to_lowercase(),
                format!("{:?}", network.join_policy).to_lowercase(),
                network.created_by.0,
                network.created_at.to_rfc3339(),
                network.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                GoConnectError::conflict(ConflictKind::AlreadyExists, "network already exists")
            },
            other => map_sqlite(other),
        })?;
        Ok(network)
    }

    async fn get_network(&self, _ct: CancellationToken, id: &NetworkId) -> Result<Network> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, tenant_id, name, cidr, visibility, join_policy, created_by, created_at, updated_at
             FROM networks WHERE id = ?1",
            params![id.0],
            row_to_network,
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or_else(|| GoConnectError::not_found("network"))
    }

    async fn list_networks_for_tenant(
        &self,
        _ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Network>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, tenant_id, name, cidr, visibility, join_policy, created_by, created_at, updated_at
                 FROM networks WHERE tenant_id = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![tenant_id.0], row_to_network)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn update_network(&self, _ct: CancellationToken, network: Network) -> Result<Network> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE networks SET name = ?2, visibility = ?3, join_policy = ?4, updated_at = ?5 WHERE id = ?1",
                params![
                    network.id.0,
                    network.name,
                    format!("{:?}", network.visibility).to_lowercase(),
                    format!("{:?}", network.join_policy).to_lowercase(),
                    network.updated_at.to_rfc3339(),
                ],
            )
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("network"));
        }
        Ok(network)
    }

    async fn delete_network(&self, _ct: CancellationToken, id: &NetworkId) -> Result<()> {
        let conn = self.conn.lock();
        let members: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memberships WHERE network_id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .map_err(map_sqlite)?;
        if members > 0 {
            return Err(GoConnectError::validation(
                "network cannot be destroyed while memberships exist; remove them explicitly first",
            ));
        }
        let affected = conn
            .execute("DELETE FROM networks WHERE id = ?1", params![id.0])
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("network"));
        }
        Ok(())
    }
}

fn row_to_network(row: &rusqlite::Row) -> rusqlite::Result<Network> {
    Ok(Network {
        id: NetworkId(row.get(0)?),
        tenant_id: TenantId(row.get(1)?),
        name: row.get(2)?,
        cidr: row
            .get::<_, String>(3)?
            .parse()
            .unwrap_or_else(|_| "0.0.0.0/32".parse().unwrap()),
        visibility: parse_visibility(row.get(4)?),
        join_policy: parse_join_policy(row.get(5)?),
        created_by: UserId(row.get(6)?),
        created_at: parse_ts(row.get(7)?),
        updated_at: parse_ts(row.get(8)?),
    })
}

#[async_trait]
impl MembershipRepo for SqlRepository {
    async fn get_membership(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<Option<Membership>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT network_id, user_id, status, role, joined_at, allocated_ip, last_seen
             FROM memberships WHERE network_id = ?1 AND user_id = ?2",
            params![network_id.0, user_id.0],
            row_to_membership,
        )
        .optional()
        .map_err(map_sqlite)
    }

    async fn put_membership(&self, _ct: CancellationToken, m: Membership) -> Result<Membership> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memberships (network_id, user_id, status, role, joined_at, allocated_ip, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(network_id, user_id) DO UPDATE SET
                status = excluded.status, role = excluded.role, allocated_ip = excluded.allocated_ip,
                last_seen = excluded.last_seen",
            params![
                m.network_id.0,
                m.user_id.0,
                format!("{:?}", m.status).to_lowercase(),
                format!("{:?}", m.role).to_lowercase(),
                m.joined_at.to_rfc3339(),
                m.allocated_ip.map(|ip| ip.to_string()),
                m.last_seen.map(|ts| ts.to_rfc3339()),
            ],
        )
        .map_err(map_sqlite)?;
        Ok(m)
    }

    async fn list_memberships_for_network(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<Membership>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT network_id, user_id, status, role, joined_at, allocated_ip, last_seen
                 FROM memberships WHERE network_id = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![network_id.0], row_to_membership)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn delete_membership(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM memberships WHERE network_id = ?1 AND user_id = ?2",
            params![network_id.0, user_id.0],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }
}

fn row_to_membership(row: &rusqlite::Row) -> rusqlite::Result<Membership> {
    Ok(Membership {
        network_id: NetworkId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        status: parse_membership_status(row.get(2)?),
        role: parse_role(row.get(3)?),
        joined_at: parse_ts(row.get(4)?),
        allocated_ip: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| s.parse().ok()),
        last_seen: row.get::<_, Option<String>>(6)?.map(parse_ts),
    })
}

fn parse_membership_status(s: String) -> MembershipStatus {
    match s.as_str() {
        "approved" => MembershipStatus::Approved,
        "banned" => MembershipStatus::Banned,
        "kicked" => MembershipStatus::Kicked,
        _ => MembershipStatus::Pending,
    }
}

fn parse_role(s: String) -> Role {
    match s.as_str() {
        "owner" => Role::Owner,
        "admin" => Role::Admin,
        "moderator" => Role::Moderator,
        _ => Role::Member,
    }
}

#[async_trait]
impl DeviceRepo for SqlRepository {
    async fn create_device(&self, _ct: CancellationToken, device: Device) -> Result<Device> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO devices (id, user_id, tenant_id, name, platform, public_key, hostname, os_version, daemon_version, last_seen, disabled_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                device.id.0,
                device.user_id.0,
                device.tenant_id.0,
                device.name,
                format!("{:?}", device.platform).to_lowercase(),
                device.public_key,
                device.hostname,
                device.os_version,
                device.daemon_version,
                device.last_seen.map(|t| t.to_rfc3339()),
                device.disabled_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                GoConnectError::conflict(ConflictKind::AlreadyExists, "public key already registered")
            },
            other => map_sqlite(other),
        })?;
        Ok(device)
    }

    async fn get_device(&self, _ct: CancellationToken, id: &DeviceId) -> Result<Device> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, user_id, tenant_id, name, platform, public_key, hostname, os_version, daemon_version, last_seen, disabled_at
             FROM devices WHERE id = ?1",
            params![id.0],
            row_to_device,
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or_else(|| GoConnectError::not_found("device"))
    }

    async fn list_devices_for_user(
        &self,
        _ct: CancellationToken,
        user_id: &UserId,
    ) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, tenant_id, name, platform, public_key, hostname, os_version, daemon_version, last_seen, disabled_at
                 FROM devices WHERE user_id = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![user_id.0], row_to_device)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn list_devices_for_tenant(
        &self,
        _ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, tenant_id, name, platform, public_key, hostname, os_version, daemon_version, last_seen, disabled_at
                 FROM devices WHERE tenant_id = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![tenant_id.0], row_to_device)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn update_device(&self, _ct: CancellationToken, device: Device) -> Result<Device> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE devices SET name = ?2, hostname = ?3, os_version = ?4, daemon_version = ?5, last_seen = ?6, disabled_at = ?7
                 WHERE id = ?1",
                params![
                    device.id.0,
                    device.name,
                    device.hostname,
                    device.os_version,
                    device.daemon_version,
                    device.last_seen.map(|t| t.to_rfc3339()),
                    device.disabled_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("device"));
        }
        Ok(device)
    }

    async fn delete_device(&self, _ct: CancellationToken, id: &DeviceId) -> Result<()> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM devices WHERE id = ?1", params![id.0])
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("device"));
        }
        Ok(())
    }
}

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
    let platform: String = row.get(4)?;
    Ok(Device {
        id: DeviceId(row.get(0)?),
        user_id: UserId(row.get(1)?),
        tenant_id: TenantId(row.get(2)?),
        name: row.get(3)?,
        platform: match platform.as_str() {
            "windows" => Platform::Windows,
            "macos" => Platform::Macos,
            "android" => Platform::Android,
            "ios" => Platform::Ios,
            _ => Platform::Linux,
        },
        public_key: row.get(5)?,
        hostname: row.get(6)?,
        os_version: row.get(7)?,
        daemon_version: row.get(8)?,
        last_seen: row.get::<_, Option<String>>(9)?.map(parse_ts),
        disabled_at: row.get::<_, Option<String>>(10)?.map(parse_ts),
    })
}

#[async_trait]
impl InviteRepo for SqlRepository {
    async fn create_invite(&self, _ct: CancellationToken, invite: InviteToken) -> Result<InviteToken> {
        let (scope_kind, scope_id) = scope_columns(&invite.scope);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO invites (id, scope_kind, scope_id, code, max_uses, use_count, expires_at, created_by, revoked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                invite.id.0,
                scope_kind,
                scope_id,
                invite.code,
                invite.max_uses,
                invite.use_count,
                invite.expires_at.map(|t| t.to_rfc3339()),
                invite.created_by.0,
                invite.revoked_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                GoConnectError::conflict(ConflictKind::AlreadyExists, "invite code already in use")
            },
            other => map_sqlite(other),
        })?;
        Ok(invite)
    }

    async fn get_invite_by_code(&self, _ct: CancellationToken, code: &str) -> Result<InviteToken> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, scope_kind, scope_id, code, max_uses, use_count, expires_at, created_by, revoked_at
             FROM invites WHERE code = ?1",
            params![code],
            row_to_invite,
        )
        .optional()
        .map_err(map_sqlite)?
        .ok_or_else(|| GoConnectError::not_found("invite"))
    }

    async fn list_invites_for_network(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<InviteToken>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, scope_kind, scope_id, code, max_uses, use_count, expires_at, created_by, revoked_at
                 FROM invites WHERE scope_kind = 'network' AND scope_id = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![network_id.0], row_to_invite)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    /// Conditional `UPDATE ... WHERE use_count < max_uses AND revoked_at IS
    /// NULL AND (expires_at IS NULL OR expires_at > now)`, per spec §4.5.
    /// Zero affected rows maps to `ValidationError` (the invite is revoked,
    /// expired, or exhausted), never a silent success.
    async fn try_consume_invite(&self, _ct: CancellationToken, code: &str) -> Result<InviteToken> {
        let conn = self.conn.lock();
        let now = Utc::now().to_rfc3339();
        let affected = conn
            .execute(
                "UPDATE invites SET use_count = use_count + 1
                 WHERE code = ?1 AND use_count < max_uses AND revoked_at IS NULL
                   AND (expires_at IS NULL OR expires_at > ?2)",
                params![code, now],
            )
            .map_err(map_sqlite)?;
        if affected == 0 {
            // Distinguish not-found from exhausted/expired/revoked for a clearer error.
            let exists: bool = conn
                .query_row("SELECT 1 FROM invites WHERE code = ?1", params![code], |_| Ok(()))
                .optional()
                .map_err(map_sqlite)?
                .is_some();
            if !exists {
                return Err(GoConnectError::not_found("invite"));
            }
            return Err(GoConnectError::validation(
                "invite is revoked, expired, or exhausted",
            ));
        }
        conn.query_row(
            "SELECT id, scope_kind, scope_id, code, max_uses, use_count, expires_at, created_by, revoked_at
             FROM invites WHERE code = ?1",
            params![code],
            row_to_invite,
        )
        .map_err(map_sqlite)
    }

    async fn revoke_invite(&self, _ct: CancellationToken, id: &InviteId) -> Result<InviteToken> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "UPDATE invites SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
                params![id.0, Utc::now().to_rfc3339()],
            )
            .map_err(map_sqlite)?;
        if affected == 0 {
            return Err(GoConnectError::not_found("invite"));
        }
        conn.query_row(
            "SELECT id, scope_kind, scope_id, code, max_uses, use_count, expires_at, created_by, revoked_at
             FROM invites WHERE id = ?1",
            params![id.0],
            row_to_invite,
        )
        .map_err(map_sqlite)
    }
}

fn scope_columns(scope: &InviteScope) -> (&'static str, String) {
    match scope {
        InviteScope::Network(id) => ("network", id.0.clone()),
        InviteScope::Tenant(id) => ("tenant", id.0.clone()),
    }
}

fn row_to_invite(row: &rusqlite::Row) -> rusqlite::Result<InviteToken> {
    let scope_kind: String = row.get(1)?;
    let scope_id: String = row.get(2)?;
    Ok(InviteToken {
        id: InviteId(row.get(0)?),
        scope: if scope_kind == "tenant" {
            InviteScope::Tenant(TenantId(scope_id))
        } else {
            InviteScope::Network(NetworkId(scope_id))
        },
        code: row.get(3)?,
        max_uses: row.get(4)?,
        use_count: row.get(5)?,
        expires_at: row.get::<_, Option<String>>(6)?.map(parse_ts),
        created_by: UserId(row.get(7)?),
        revoked_at: row.get::<_, Option<String>>(8)?.map(parse_ts),
    })
}

#[async_trait]
impl AuditRepo for SqlRepository {
    async fn append_event(&self, _ct: CancellationToken, event: AuditEvent) -> Result<AuditEvent> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_events (seq, ts, action, actor, object, details, request_id, chain_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.seq as i64,
                event.ts.to_rfc3339(),
                serde_json::to_string(&event.action).map_err(|e| GoConnectError::Internal(e.into()))?,
                event.actor.0,
                event.object,
                event.details.to_string(),
                event.request_id,
                event.chain_hash,
            ],
        )
        .map_err(map_sqlite)?;
        Ok(event)
    }

    async fn last_event(&self, _ct: CancellationToken) -> Result<Option<AuditEvent>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT seq, ts, action, actor, object, details, request_id, chain_hash
             FROM audit_events ORDER BY seq DESC LIMIT 1",
            [],
            row_to_event,
        )
        .optional()
        .map_err(map_sqlite)
    }

    async fn get_event(&self, _ct: CancellationToken, seq: u64) -> Result<Option<AuditEvent>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT seq, ts, action, actor, object, details, request_id, chain_hash
             FROM audit_events WHERE seq = ?1",
            params![seq as i64],
            row_to_event,
        )
        .optional()
        .map_err(map_sqlite)
    }

    async fn list_events_from(
        &self,
        _ct: CancellationToken,
        from_seq: u64,
        limit: u64,
    ) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, ts, action, actor, object, details, request_id, chain_hash
                 FROM audit_events WHERE seq >= ?1 ORDER BY seq ASC LIMIT ?2",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![from_seq as i64, limit as i64], row_to_event)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows)
    }

    async fn write_anchor(&self, _ct: CancellationToken, seq: u64) -> Result<()> {
        let conn = self.conn.lock();
        let hash: String = conn
            .query_row(
                "SELECT chain_hash FROM audit_events WHERE seq = ?1",
                params![seq as i64],
                |row| row.get(0),
            )
            .map_err(map_sqlite)?;
        conn.execute(
            "INSERT OR REPLACE INTO audit_chain_anchors (seq, ts, chain_hash) VALUES (?1, ?2, ?3)",
            params![seq as i64, Utc::now().to_rfc3339(), hash],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    async fn list_anchors(&self, _ct: CancellationToken, limit: u64) -> Result<Vec<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT seq FROM audit_chain_anchors ORDER BY seq ASC LIMIT ?1")
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, i64>(0))
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        Ok(rows.into_iter().map(|v| v as u64).collect())
    }

    async fn prune(
        &self,
        _ct: CancellationToken,
        max_age: Option<chrono::Duration>,
        max_rows: Option<u64>,
    ) -> Result<u64> {
        let conn = self.conn.lock();
        let mut deleted = 0u64;
        if let Some(max_age) = max_age {
            let cutoff = (Utc::now() - max_age).to_rfc3339();
            deleted += conn
                .execute("DELETE FROM audit_events WHERE ts < ?1", params![cutoff])
                .map_err(map_sqlite)? as u64;
        }
        if let Some(max_rows) = max_rows {
            let total: i64 = conn
                .query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
                .map_err(map_sqlite)?;
            if total as u64 > max_rows {
                let drop_count = total as u64 - max_rows;
                deleted += conn
                    .execute(
                        "DELETE FROM audit_events WHERE seq IN (SELECT seq FROM audit_events ORDER BY seq ASC LIMIT ?1)",
                        params![drop_count as i64],
                    )
                    .map_err(map_sqlite)? as u64;
            }
        }
        conn.execute(
            "DELETE FROM audit_chain_anchors WHERE seq NOT IN (SELECT seq FROM audit_events)",
            [],
        )
        .map_err(map_sqlite)?;
        Ok(deleted)
    }
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<AuditEvent> {
    let action_json: String = row.get(2)?;
    Ok(AuditEvent {
        seq: row.get::<_, i64>(0)? as u64,
        ts: parse_ts(row.get(1)?),
        action: serde_json::from_str(&action_json).unwrap_or(AuditAction::NetworkCreated),
        actor: UserId(row.get(3)?),
        object: row.get(4)?,
        details: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or(serde_json::Value::Null),
        request_id: row.get(6)?,
        chain_hash: row.get(7)?,
    })
}

#[async_trait]
impl ChatRepo for SqlRepository {
    async fn create_message(&self, _ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat_messages (id, scope, tenant_id, user_id, body, attachments, created_at, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                msg.id,
                msg.scope.0,
                msg.tenant_id.0,
                msg.user_id.0,
                msg.body,
                serde_json::to_string(&msg.attachments).unwrap_or_default(),
                msg.created_at.to_rfc3339(),
                msg.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(map_sqlite)?;
        Ok(msg)
    }

    async fn get_message(&self, _ct: CancellationToken, id: &str) -> Result<ChatMessage> {
        let conn = self.conn.lock();
        let mut msg = conn
            .query_row(
                "SELECT id, scope, tenant_id, user_id, body, attachments, created_at, deleted_at
                 FROM chat_messages WHERE id = ?1",
                params![id],
                row_to_chat,
            )
            .optional()
            .map_err(map_sqlite)?
            .ok_or_else(|| GoConnectError::not_found("chat message"))?;
        msg.edits = load_edits(&conn, id)?;
        Ok(msg)
    }

    async fn update_message(&self, _ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chat_messages SET body = ?2, deleted_at = ?3 WHERE id = ?1",
            params![msg.id, msg.body, msg.deleted_at.map(|t| t.to_rfc3339())],
        )
        .map_err(map_sqlite)?;
        conn.execute("DELETE FROM chat_message_edits WHERE message_id = ?1", params![msg.id])
            .map_err(map_sqlite)?;
        for edit in &msg.edits {
            conn.execute(
                "INSERT INTO chat_message_edits (message_id, prev_body, new_body, editor_id, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![msg.id, edit.prev_body, edit.new_body, edit.editor_id.0, edit.ts.to_rfc3339()],
            )
            .map_err(map_sqlite)?;
        }
        Ok(msg)
    }

    async fn list_messages(
        &self,
        _ct: CancellationToken,
        scope: &str,
        tenant_id: &TenantId,
        limit: u64,
    ) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, scope, tenant_id, user_id, body, attachments, created_at, deleted_at
                 FROM chat_messages WHERE scope = ?1 AND tenant_id = ?2 ORDER BY created_at DESC LIMIT ?3",
            )
            .map_err(map_sqlite)?;
        let mut rows = stmt
            .query_map(params![scope, tenant_id.0, limit as i64], row_to_chat)
            .map_err(map_sqlite)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_sqlite)?;
        for msg in &mut rows {
            msg.edits = load_edits(&conn, &msg.id)?;
        }
        rows.reverse();
        Ok(rows)
    }
}

fn load_edits(conn: &Connection, message_id: &str) -> Result<Vec<ChatMessageEdit>> {
    let mut stmt = conn
        .prepare("SELECT prev_body, new_body, editor_id, ts FROM chat_message_edits WHERE message_id = ?1 ORDER BY ts ASC")
        .map_err(map_sqlite)?;
    let rows = stmt
        .query_map(params![message_id], |row| {
            Ok(ChatMessageEdit {
                prev_body: row.get(0)?,
                new_body: row.get(1)?,
                editor_id: UserId(row.get(2)?),
                ts: parse_ts(row.get(3)?),
            })
        })
        .map_err(map_sqlite)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_sqlite)?;
    Ok(rows)
}

fn row_to_chat(row: &rusqlite::Row) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        scope: ChatScope(row.get(1)?),
        tenant_id: TenantId(row.get(2)?),
        user_id: UserId(row.get(3)?),
        body: row.get(4)?,
        attachments: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        created_at: parse_ts(row.get(6)?),
        deleted_at: row.get::<_, Option<String>>(7)?.map(parse_ts),
        edits: Vec::new(),
    })
}

#[async_trait]
impl IdempotencyStore for SqlRepository {
    async fn get_idempotency_record(
        &self,
        _ct: CancellationToken,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT key, fingerprint, response_json, created_at FROM idempotency_records WHERE key = ?1",
            params![key],
            |row| {
                Ok(IdempotencyRecord {
                    key: row.get(0)?,
                    fingerprint: row.get(1)?,
                    response_json: row.get(2)?,
                    created_at: parse_ts(row.get(3)?),
                })
            },
        )
        .optional()
        .map_err(map_sqlite)
    }

    async fn put_idempotency_record(
        &self,
        _ct: CancellationToken,
        record: IdempotencyRecord,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO idempotency_records (key, fingerprint, response_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![record.key, record.fingerprint, record.response_json, record.created_at.to_rfc3339()],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    async fn sweep_idempotency_records(
        &self,
        _ct: CancellationToken,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let conn = self.conn.lock();
        let affected = conn
            .execute(
                "DELETE FROM idempotency_records WHERE created_at < ?1",
                params![older_than.to_rfc3339()],
            )
            .map_err(map_sqlite)?;
        Ok(affected as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = SqlRepository::open(&path).unwrap();
        // Re-opening (and thus re-migrating) an existing database must not error.
        drop(repo);
        SqlRepository::open(&path).unwrap();
    }

    #[tokio::test]
    async fn invite_consumption_is_conditional() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqlRepository::open(&dir.path().join("test.db")).unwrap();
        let ct = CancellationToken::new();
        repo.create_invite(
            ct.clone(),
            InviteToken {
                id: "inv1".into(),
                scope: InviteScope::Network("n1".into()),
                code: "ABC123".into(),
                max_uses: 1,
                use_count: 0,
                expires_at: None,
                created_by: "u1".into(),
                revoked_at: None,
            },
        )
        .await
        .unwrap();
        repo.try_consume_invite(ct.clone(), "ABC123").await.unwrap();
        assert!(repo.try_consume_invite(ct, "ABC123").await.is_err());
    }
}
