//! C2 — repository abstraction + idempotency. A `Repository` bundles one
//! trait per entity family (spec §9: "abstract over a Repository capability
//! set"), mirroring the teacher's `db::{DatabaseCidr, DatabasePeer,
//! DatabaseAssociation}` split but behind traits so in-memory and SQL
//! back-ends satisfy the same contract.

pub mod idempotency;
pub mod memory;
pub mod sql;

use async_trait::async_trait;
use goconnect_shared::{
    domain::{
        AuditEvent, ChatMessage, Device, DeviceId, InviteId, InviteToken, Membership, Network,
        NetworkId, Tenant, TenantId, User, UserId,
    },
    error::Result,
};
use tokio_util::sync::CancellationToken;

pub use idempotency::IdempotencyStore;

#[async_trait]
pub trait TenantRepo: Send + Sync {
    async fn create_tenant(&self, ct: CancellationToken, tenant: Tenant) -> Result<Tenant>;
    async fn get_tenant(&self, ct: CancellationToken, id: &TenantId) -> Result<Tenant>;
    async fn list_public_tenants(&self, ct: CancellationToken) -> Result<Vec<Tenant>>;
    async fn search_tenants(&self, ct: CancellationToken, q: &str) -> Result<Vec<Tenant>>;
    async fn update_tenant(&self, ct: CancellationToken, tenant: Tenant) -> Result<Tenant>;
    async fn delete_tenant(&self, ct: CancellationToken, id: &TenantId) -> Result<()>;
    async fn get_user(&self, ct: CancellationToken, id: &UserId) -> Result<User>;
}

#[async_trait]
pub trait NetworkRepo: Send + Sync {
    async fn create_network(&self, ct: CancellationToken, network: Network) -> Result<Network>;
    async fn get_network(&self, ct: CancellationToken, id: &NetworkId) -> Result<Network>;
    async fn list_networks_for_tenant(
        &self,
        ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Network>>;
    async fn update_network(&self, ct: CancellationToken, network: Network) -> Result<Network>;
    async fn delete_network(&self, ct: CancellationToken, id: &NetworkId) -> Result<()>;
}

#[async_trait]
pub trait MembershipRepo: Send + Sync {
    async fn get_membership(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<Option<Membership>>;
    async fn put_membership(&self, ct: CancellationToken, m: Membership) -> Result<Membership>;
    async fn list_memberships_for_network(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<Membership>>;
    async fn delete_membership(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<()>;
}

#[async_trait]
pub trait DeviceRepo: Send + Sync {
    async fn create_device(&self, ct: CancellationToken, device: Device) -> Result<Device>;
    async fn get_device(&self, ct: CancellationToken, id: &DeviceId) -> Result<Device>;
    async fn list_devices_for_user(
        &self,
        ct: CancellationToken,
        user_id: &UserId,
    ) -> Result<Vec<Device>>;
    async fn list_devices_for_tenant(
        &self,
        ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Device>>;
    async fn update_device(&self, ct: CancellationToken, device: Device) -> Result<Device>;
    async fn delete_device(&self, ct: CancellationToken, id: &DeviceId) -> Result<()>;
}

#[async_trait]
pub trait InviteRepo: Send + Sync {
    async fn create_invite(&self, ct: CancellationToken, invite: InviteToken) -> Result<InviteToken>;
    async fn get_invite_by_code(&self, ct: CancellationToken, code: &str) -> Result<InviteToken>;
    async fn list_invites_for_network(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<InviteToken>>;
    /// Atomically increments `use_count` iff `use_count < max_uses &&
    /// revoked_at IS NULL && (expires_at IS NULL || expires_at > now)`,
    /// per spec §4.5's invite-consumption recipe. Returns the updated
    /// invite, or `GoConnectError::conflict(InviteExhausted, _)` if the
    /// conditional update affected zero rows.
    async fn try_consume_invite(&self, ct: CancellationToken, code: &str) -> Result<InviteToken>;
    async fn revoke_invite(&self, ct: CancellationToken, id: &InviteId) -> Result<InviteToken>;
}

#[async_trait]
pub trait AuditRepo: Send + Sync {
    async fn append_event(&self, ct: CancellationToken, event: AuditEvent) -> Result<AuditEvent>;
    async fn last_event(&self, ct: CancellationToken) -> Result<Option<AuditEvent>>;
    async fn get_event(&self, ct: CancellationToken, seq: u64) -> Result<Option<AuditEvent>>;
    async fn list_events_from(
        &self,
        ct: CancellationToken,
        from_seq: u64,
        limit: u64,
    ) -> Result<Vec<AuditEvent>>;
    async fn write_anchor(&self, ct: CancellationToken, seq: u64) -> Result<()>;
    async fn list_anchors(&self, ct: CancellationToken, limit: u64) -> Result<Vec<u64>>;
    async fn prune(
        &self,
        ct: CancellationToken,
        max_age: Option<chrono::Duration>,
        max_rows: Option<u64>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait ChatRepo: Send + Sync {
    async fn create_message(&self, ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage>;
    async fn get_message(&self, ct: CancellationToken, id: &str) -> Result<ChatMessage>;
    async fn update_message(&self, ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage>;
    async fn list_messages(
        &self,
        ct: CancellationToken,
        scope: &str,
        tenant_id: &TenantId,
        limit: u64,
    ) -> Result<Vec<ChatMessage>>;
}

/// Every repository back-end satisfies the whole capability set (spec §9).
pub trait Repository:
    TenantRepo
    + NetworkRepo
    + MembershipRepo
    + DeviceRepo
    + InviteRepo
    + AuditRepo
    + ChatRepo
    + IdempotencyStore
    + Send
    + Sync
{
}

impl<T> Repository for T where
    T: TenantRepo
        + NetworkRepo
        + MembershipRepo
        + DeviceRepo
        + InviteRepo
        + AuditRepo
        + ChatRepo
        + IdempotencyStore
        + Send
        + Sync
{
}
