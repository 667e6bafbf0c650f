//! Canonical domain entities (C1), grounded on spec §3. IDs are newtype
//! wrappers around `String` rather than bare strings, following the
//! teacher's `Interface`/`Hostname` newtype pattern in `shared/src/types.rs`
//! — it keeps a `TenantId` from being passed where a `UserId` is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(UserId);
id_newtype!(NetworkId);
id_newtype!(DeviceId);
id_newtype!(InviteId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    Open,
    Code,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Pending,
    Approved,
    Banned,
    Kicked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Moderator,
    Admin,
    Owner,
}

impl Role {
    /// owner > admin > moderator > member, per spec §4.5's kick/ban
    /// authorisation ordering.
    pub fn outranks(self, other: Role) -> bool {
        self > other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
    Android,
    Ios,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub visibility: Visibility,
    pub join_policy: JoinPolicy,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub display_name: String,
    pub is_admin: bool,
    pub is_moderator: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: NetworkId,
    pub tenant_id: TenantId,
    pub name: String,
    pub cidr: ipnet::Ipv4Net,
    pub visibility: Visibility,
    pub join_policy: JoinPolicy,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub network_id: NetworkId,
    pub user_id: UserId,
    pub status: MembershipStatus,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub allocated_ip: Option<Ipv4Addr>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Membership {
    /// Valid status transitions per spec §4.5's state machine. Used by the
    /// service layer to reject an illegal transition before it ever reaches
    /// a repository write.
    pub fn can_transition_to(&self, next: MembershipStatus) -> bool {
        use MembershipStatus::*;
        matches!(
            (self.status, next),
            (Pending, Approved)
                | (Pending, Banned)
                | (Approved, Banned)
                | (Approved, Kicked)
                | (Banned, Approved)
                | (Kicked, Pending)
                | (Kicked, Approved)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpAllocation {
    pub network_id: NetworkId,
    pub user_id: UserId,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub name: String,
    pub platform: Platform,
    /// 44-char base64 WireGuard public key, unique globally.
    pub public_key: String,
    pub hostname: String,
    pub os_version: Option<String>,
    pub daemon_version: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_enabled(&self) -> bool {
        self.disabled_at.is_none()
    }
}

/// One entry inside a `PeerConfigSnapshot`'s peer list, materialised per
/// spec §3 ("Peer-config snapshot (derived, not stored)"). This is the
/// domain-level sibling of `shared::peer::Peer`, which is the
/// WireGuard-application-ready shape; `PeerConfigEntry::into_peer` produces
/// one from the other once the network's allowed-ips prefix is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfigEntry {
    pub peer_id: DeviceId,
    pub name: String,
    pub hostname: String,
    pub public_key: String,
    pub allowed_ips: Vec<ipnet::IpNet>,
    pub endpoint: Option<String>,
}

/// The full response of `GET /v1/devices/{id}/config` (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfigSnapshot {
    pub interface_address: ipnet::IpNet,
    pub dns: Vec<Ipv4Addr>,
    pub mtu: u32,
    pub peers: Vec<PeerConfigEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InviteScope {
    Network(NetworkId),
    Tenant(TenantId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteToken {
    pub id: InviteId,
    pub scope: InviteScope,
    pub code: String,
    pub max_uses: u32,
    pub use_count: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: UserId,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl InviteToken {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none()
            && self.use_count < self.max_uses
            && self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }
}

/// Audit actions appended by the membership service (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    NetworkCreated,
    MemberJoined,
    MemberApproved,
    MemberRejected,
    MemberKicked,
    MemberBanned,
    MemberUnbanned,
    IpAllocated,
    IpReleased,
    InviteCreated,
    InviteRevoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: UserId,
    pub object: String,
    pub details: serde_json::Value,
    pub request_id: String,
    pub chain_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageEdit {
    pub prev_body: String,
    pub new_body: String,
    pub editor_id: UserId,
    pub ts: DateTime<Utc>,
}

/// `"host"` or `"network:<id>"`, per spec §3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatScope(pub String);

impl ChatScope {
    pub fn host() -> Self {
        Self("host".to_string())
    }

    pub fn network(id: &NetworkId) -> Self {
        Self(format!("network:{id}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub scope: ChatScope,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub body: String,
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub edits: Vec<ChatMessageEdit>,
}

impl ChatMessage {
    /// Edits beyond 15 minutes require an admin (spec §3, tested at the
    /// 14m59s/15m01s boundary in spec §8).
    pub fn editable_by_non_admin(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.created_at) <= chrono::Duration::minutes(15)
    }

    pub fn redact(&mut self, editor_id: UserId, now: DateTime<Utc>) {
        self.edits.push(ChatMessageEdit {
            prev_body: self.body.clone(),
            new_body: "[REDACTED]".to_string(),
            editor_id,
            ts: now,
        });
        self.body = "[REDACTED]".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_transitions_follow_state_machine() {
        let m = Membership {
            network_id: "n1".into(),
            user_id: "u1".into(),
            status: MembershipStatus::Pending,
            role: Role::Member,
            joined_at: Utc::now(),
            allocated_ip: None,
            last_seen: None,
        };
        assert!(m.can_transition_to(MembershipStatus::Approved));
        assert!(!m.can_transition_to(MembershipStatus::Kicked));
    }

    #[test]
    fn role_ordering_matches_hierarchy() {
        assert!(Role::Owner.outranks(Role::Admin));
        assert!(Role::Admin.outranks(Role::Moderator));
        assert!(!Role::Member.outranks(Role::Moderator));
    }

    #[test]
    fn invite_usable_respects_expiry_and_uses() {
        let now = Utc::now();
        let invite = InviteToken {
            id: "inv1".into(),
            scope: InviteScope::Network("n1".into()),
            code: "ABC123".into(),
            max_uses: 1,
            use_count: 1,
            expires_at: None,
            created_by: "u1".into(),
            revoked_at: None,
        };
        assert!(!invite.is_usable(now));
    }

    #[test]
    fn chat_edit_window_boundary() {
        let mut msg = ChatMessage {
            id: "m1".into(),
            scope: ChatScope::host(),
            tenant_id: "t1".into(),
            user_id: "u1".into(),
            body: "hi".into(),
            attachments: vec![],
            created_at: Utc::now() - chrono::Duration::seconds(14 * 60 + 59),
            deleted_at: None,
            edits: vec![],
        };
        assert!(msg.editable_by_non_admin(Utc::now()));
        msg.created_at = Utc::now() - chrono::Duration::seconds(15 * 60 + 1);
        assert!(!msg.editable_by_non_admin(Utc::now()));
    }
}
