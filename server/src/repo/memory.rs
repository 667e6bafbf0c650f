//! `MemoryRepository`: a `parking_lot::RwLock<HashMap<...>>`-per-entity
//! backend, the equivalent of the teacher's in-process `Context` state, used
//! by unit/integration tests and as a reference implementation of the
//! `Repository` contract.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use goconnect_shared::{
    domain::{
        AuditEvent, ChatMessage, Device, DeviceId, InviteId, InviteToken, Membership, Network,
        NetworkId, Tenant, TenantId, User, UserId,
    },
    error::{ConflictKind, GoConnectError, Result},
};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use super::idempotency::{IdempotencyRecord, IdempotencyStore};
use super::{AuditRepo, ChatRepo, DeviceRepo, InviteRepo, MembershipRepo, NetworkRepo, TenantRepo};

#[derive(Default)]
pub struct MemoryRepository {
    tenants: RwLock<HashMap<String, Tenant>>,
    users: RwLock<HashMap<String, User>>,
    networks: RwLock<HashMap<String, Network>>,
    memberships: RwLock<HashMap<(String, String), Membership>>,
    devices: RwLock<HashMap<String, Device>>,
    invites: RwLock<HashMap<String, InviteToken>>,
    events: RwLock<Vec<AuditEvent>>,
    anchors: RwLock<Vec<u64>>,
    chat: RwLock<HashMap<String, ChatMessage>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user record directly, since user creation/auth (password,
    /// 2FA) is out of scope (spec §1) but services still need to resolve a
    /// `UserId` to its tenant/role flags.
    pub fn seed_user(&self, user: User) {
        self.users.write().insert(user.id.0.clone(), user);
    }
}

#[async_trait]
impl TenantRepo for MemoryRepository {
    async fn create_tenant(&self, _ct: CancellationToken, tenant: Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write();
        if tenants.contains_key(&tenant.id.0) {
            return Err(GoConnectError::conflict(
                ConflictKind::AlreadyExists,
                "tenant already exists",
            ));
        }
        tenants.insert(tenant.id.0.clone(), tenant.clone());
        Ok(tenant)
    }

    async fn get_tenant(&self, _ct: CancellationToken, id: &TenantId) -> Result<Tenant> {
        self.tenants
            .read()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("tenant"))
    }

    async fn list_public_tenants(&self, _ct: CancellationToken) -> Result<Vec<Tenant>> {
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| matches!(t.visibility, goconnect_shared::domain::Visibility::Public))
            .cloned()
            .collect())
    }

    async fn search_tenants(&self, _ct: CancellationToken, q: &str) -> Result<Vec<Tenant>> {
        let q = q.to_lowercase();
        Ok(self
            .tenants
            .read()
            .values()
            .filter(|t| {
                matches!(t.visibility, goconnect_shared::domain::Visibility::Public)
                    && t.name.to_lowercase().contains(&q)
            })
            .cloned()
            .collect())
    }

    async fn update_tenant(&self, _ct: CancellationToken, tenant: Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write();
        if !tenants.contains_key(&tenant.id.0) {
            return Err(GoConnectError::not_found("tenant"));
        }
        tenants.insert(tenant.id.0.clone(), tenant.clone());
        Ok(tenant)
    }

    async fn delete_tenant(&self, _ct: CancellationToken, id: &TenantId) -> Result<()> {
        self.tenants
            .write()
            .remove(&id.0)
            .ok_or_else(|| GoConnectError::not_found("tenant"))?;
        Ok(())
    }

    async fn get_user(&self, _ct: CancellationToken, id: &UserId) -> Result<User> {
        self.users
            .read()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("user"))
    }
}

#[async_trait]
impl NetworkRepo for MemoryRepository {
    async fn create_network(&self, _ct: CancellationToken, network: Network) -> Result<Network> {
        let mut networks = self.networks.write();
        if networks.contains_key(&network.id.0) {
            return Err(GoConnectError::conflict(
                ConflictKind::AlreadyExists,
                "network already exists",
            ));
        }
        networks.insert(network.id.0.clone(), network.clone());
        Ok(network)
    }

    async fn get_network(&self, _ct: CancellationToken, id: &NetworkId) -> Result<Network> {
        self.networks
            .read()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("network"))
    }

    async fn list_networks_for_tenant(
        &self,
        _ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Network>> {
        Ok(self
            .networks
            .read()
            .values()
            .filter(|n| &n.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn update_network(&self, _ct: CancellationToken, network: Network) -> Result<Network> {
        let mut networks = self.networks.write();
        if !networks.contains_key(&network.id.0) {
            return Err(GoConnectError::not_found("network"));
        }
        networks.insert(network.id.0.clone(), network.clone());
        Ok(network)
    }

    async fn delete_network(&self, _ct: CancellationToken, id: &NetworkId) -> Result<()> {
        let has_members = self
            .memberships
            .read()
            .keys()
            .any(|(network_id, _)| network_id == &id.0);
        if has_members {
            return Err(GoConnectError::validation(
                "network cannot be destroyed while memberships exist; remove them explicitly first",
            ));
        }
        self.networks
            .write()
            .remove(&id.0)
            .ok_or_else(|| GoConnectError::not_found("network"))?;
        Ok(())
    }
}

#[async_trait]
impl MembershipRepo for MemoryRepository {
    async fn get_membership(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<Option<Membership>> {
        Ok(self
            .memberships
            .read()
            .get(&(network_id.0.clone(), user_id.0.clone()))
            .cloned())
    }

    async fn put_membership(&self, _ct: CancellationToken, m: Membership) -> Result<Membership> {
        self.memberships
            .write()
            .insert((m.network_id.0.clone(), m.user_id.0.clone()), m.clone());
        Ok(m)
    }

    async fn list_memberships_for_network(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<Membership>> {
        Ok(self
            .memberships
            .read()
            .values()
            .filter(|m| &m.network_id == network_id)
            .cloned()
            .collect())
    }

    async fn delete_membership(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
    ) -> Result<()> {
        self.memberships
            .write()
            .remove(&(network_id.0.clone(), user_id.0.clone()));
        Ok(())
    }
}

#[async_trait]
impl DeviceRepo for MemoryRepository {
    async fn create_device(&self, _ct: CancellationToken, device: Device) -> Result<Device> {
        let mut devices = self.devices.write();
        if devices.values().any(|d| d.public_key == device.public_key) {
            return Err(GoConnectError::conflict(
                ConflictKind::AlreadyExists,
                "public key already registered",
            ));
        }
        devices.insert(device.id.0.clone(), device.clone());
        Ok(device)
    }

    async fn get_device(&self, _ct: CancellationToken, id: &DeviceId) -> Result<Device> {
        self.devices
            .read()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("device"))
    }

    async fn list_devices_for_user(
        &self,
        _ct: CancellationToken,
        user_id: &UserId,
    ) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .values()
            .filter(|d| &d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn list_devices_for_tenant(
        &self,
        _ct: CancellationToken,
        tenant_id: &TenantId,
    ) -> Result<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .values()
            .filter(|d| &d.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn update_device(&self, _ct: CancellationToken, device: Device) -> Result<Device> {
        let mut devices = self.devices.write();
        if !devices.contains_key(&device.id.0) {
            return Err(GoConnectError::not_found("device"));
        }
        devices.insert(device.id.0.clone(), device.clone());
        Ok(device)
    }

    async fn delete_device(&self, _ct: CancellationToken, id: &DeviceId) -> Result<()> {
        self.devices
            .write()
            .remove(&id.0)
            .ok_or_else(|| GoConnectError::not_found("device"))?;
        Ok(())
    }
}

#[async_trait]
impl InviteRepo for MemoryRepository {
    async fn create_invite(&self, _ct: CancellationToken, invite: InviteToken) -> Result<InviteToken> {
        let mut invites = self.invites.write();
        if invites.values().any(|i| i.code == invite.code) {
            return Err(GoConnectError::conflict(
                ConflictKind::AlreadyExists,
                "invite code already in use",
            ));
        }
        invites.insert(invite.id.0.clone(), invite.clone());
        Ok(invite)
    }

    async fn get_invite_by_code(&self, _ct: CancellationToken, code: &str) -> Result<InviteToken> {
        self.invites
            .read()
            .values()
            .find(|i| i.code == code)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("invite"))
    }

    async fn list_invites_for_network(
        &self,
        _ct: CancellationToken,
        network_id: &NetworkId,
    ) -> Result<Vec<InviteToken>> {
        use goconnect_shared::domain::InviteScope;
        Ok(self
            .invites
            .read()
            .values()
            .filter(|i| matches!(&i.scope, InviteScope::Network(id) if id == network_id))
            .cloned()
            .collect())
    }

    async fn try_consume_invite(&self, _ct: CancellationToken, code: &str) -> Result<InviteToken> {
        let mut invites = self.invites.write();
        let invite = invites
            .values_mut()
            .find(|i| i.code == code)
            .ok_or_else(|| GoConnectError::not_found("invite"))?;
        if !invite.is_usable(Utc::now()) {
            return Err(GoConnectError::validation("invite is revoked, expired, or exhausted"));
        }
        invite.use_count += 1;
        Ok(invite.clone())
    }

    async fn revoke_invite(&self, _ct: CancellationToken, id: &InviteId) -> Result<InviteToken> {
        let mut invites = self.invites.write();
        let invite = invites
            .get_mut(&id.0)
            .ok_or_else(|| GoConnectError::not_found("invite"))?;
        if invite.revoked_at.is_some() {
            return Err(GoConnectError::not_found("invite"));
        }
        invite.revoked_at = Some(Utc::now());
        Ok(invite.clone())
    }
}

#[async_trait]
impl AuditRepo for MemoryRepository {
    async fn append_event(&self, _ct: CancellationToken, event: AuditEvent) -> Result<AuditEvent> {
        let mut events = self.events.write();
        match events.iter_mut().find(|e| e.seq == event.seq) {
            Some(slot) => *slot = event.clone(),
            None => events.push(event.clone()),
        }
        Ok(event)
    }

    async fn last_event(&self, _ct: CancellationToken) -> Result<Option<AuditEvent>> {
        Ok(self.events.read().last().cloned())
    }

    async fn get_event(&self, _ct: CancellationToken, seq: u64) -> Result<Option<AuditEvent>> {
        Ok(self.events.read().iter().find(|e| e.seq == seq).cloned())
    }

    async fn list_events_from(
        &self,
        _ct: CancellationToken,
        from_seq: u64,
        limit: u64,
    ) -> Result<Vec<AuditEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.seq >= from_seq)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn write_anchor(&self, _ct: CancellationToken, seq: u64) -> Result<()> {
        self.anchors.write().push(seq);
        Ok(())
    }

    async fn list_anchors(&self, _ct: CancellationToken, limit: u64) -> Result<Vec<u64>> {
        let anchors = self.anchors.read();
        let start = anchors.len().saturating_sub(limit as usize);
        Ok(anchors[start..].to_vec())
    }

    async fn prune(
        &self,
        _ct: CancellationToken,
        max_age: Option<chrono::Duration>,
        max_rows: Option<u64>,
    ) -> Result<u64> {
        let mut events = self.events.write();
        let before = events.len();
        if let Some(max_age) = max_age {
            let cutoff = Utc::now() - max_age;
            events.retain(|e| e.ts >= cutoff);
        }
        if let Some(max_rows) = max_rows {
            let max_rows = max_rows as usize;
            if events.len() > max_rows {
                let drop_count = events.len() - max_rows;
                events.drain(0..drop_count);
            }
        }
        let live: std::collections::HashSet<u64> = events.iter().map(|e| e.seq).collect();
        self.anchors.write().retain(|seq| live.contains(seq));
        Ok((before - events.len()) as u64)
    }
}

#[async_trait]
impl ChatRepo for MemoryRepository {
    async fn create_message(&self, _ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage> {
        self.chat.write().insert(msg.id.clone(), msg.clone());
        Ok(msg)
    }

    async fn get_message(&self, _ct: CancellationToken, id: &str) -> Result<ChatMessage> {
        self.chat
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| GoConnectError::not_found("chat message"))
    }

    async fn update_message(&self, _ct: CancellationToken, msg: ChatMessage) -> Result<ChatMessage> {
        self.chat.write().insert(msg.id.clone(), msg.clone());
        Ok(msg)
    }

    async fn list_messages(
        &self,
        _ct: CancellationToken,
        scope: &str,
        tenant_id: &TenantId,
        limit: u64,
    ) -> Result<Vec<ChatMessage>> {
        let mut msgs: Vec<ChatMessage> = self
            .chat
            .read()
            .values()
            .filter(|m| m.scope.0 == scope && &m.tenant_id == tenant_id)
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.created_at);
        if msgs.len() as u64 > limit {
            let drop = msgs.len() - limit as usize;
            msgs.drain(0..drop);
        }
        Ok(msgs)
    }
}

#[async_trait]
impl IdempotencyStore for MemoryRepository {
    async fn get_idempotency_record(
        &self,
        _ct: CancellationToken,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self.idempotency.read().get(key).cloned())
    }

    async fn put_idempotency_record(
        &self,
        _ct: CancellationToken,
        record: IdempotencyRecord,
    ) -> Result<()> {
        self.idempotency.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn sweep_idempotency_records(
        &self,
        _ct: CancellationToken,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let mut map = self.idempotency.write();
        let before = map.len();
        map.retain(|_, record| record.created_at >= older_than);
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use goconnect_shared::domain::{JoinPolicy, Visibility};

    fn tenant(id: &str) -> Tenant {
        Tenant {
            id: id.into(),
            name: id.to_string(),
            visibility: Visibility::Public,
            join_policy: JoinPolicy::Open,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_tenant_rejects_duplicate_id() {
        let repo = MemoryRepository::new();
        let ct = CancellationToken::new();
        repo.create_tenant(ct.clone(), tenant("t1")).await.unwrap();
        let err = repo.create_tenant(ct, tenant("t1")).await.unwrap_err();
        assert!(matches!(err, GoConnectError::Conflict { .. }));
    }

    #[tokio::test]
    async fn delete_network_blocked_by_live_memberships() {
        use goconnect_shared::domain::{Membership, MembershipStatus, Role};
        let repo = MemoryRepository::new();
        let ct = CancellationToken::new();
        let network = Network {
            id: "n1".into(),
            tenant_id: "t1".into(),
            name: "N1".into(),
            cidr: "10.0.0.0/30".parse().unwrap(),
            visibility: Visibility::Public,
            join_policy: JoinPolicy::Open,
            created_by: "u1".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        repo.create_network(ct.clone(), network).await.unwrap();
        repo.put_membership(
            ct.clone(),
            Membership {
                network_id: "n1".into(),
                user_id: "u1".into(),
                status: MembershipStatus::Approved,
                role: Role::Owner,
                joined_at: Utc::now(),
                allocated_ip: None,
                last_seen: None,
            },
        )
        .await
        .unwrap();
        assert!(repo.delete_network(ct, &"n1".into()).await.is_err());
    }
}
