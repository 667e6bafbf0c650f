//! C5 — network/membership service: the membership state machine, join
//! policies, tenant isolation, invite consumption, and role hierarchy from
//! spec §4.5, composing the C2 repositories and emitting one
//! [`AuditAction`] per mutation.

use std::sync::Arc;

use chrono::Utc;
use goconnect_shared::{
    domain::*,
    error::{ConflictKind, GoConnectError, Result},
};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{audit::AuditChain, ipam::IpamService, repo::Repository};

pub struct MembershipService {
    repo: Arc<dyn Repository>,
    ipam: Arc<IpamService>,
    audit: Arc<AuditChain>,
}

/// Checks `caller.tenant_id == network.tenant_id`; spec §4.5 requires this
/// to fail `NotFound`, never `Forbidden` — cross-tenant existence is itself
/// information the caller shouldn't learn.
fn check_tenant(network: &Network, caller_tenant: &TenantId) -> Result<()> {
    if &network.tenant_id != caller_tenant {
        return Err(GoConnectError::not_found("network"));
    }
    Ok(())
}

/// Visibility::Private hides the network from outsiders (spec §4.5): GET by
/// someone with no approved/pending membership must 404, not 403.
fn check_visible(
    network: &Network,
    membership: Option<&Membership>,
    is_admin: bool,
) -> Result<()> {
    if matches!(network.visibility, Visibility::Private) && !is_admin {
        match membership {
            Some(m) if matches!(m.status, MembershipStatus::Approved | MembershipStatus::Pending) => {},
            _ => return Err(GoConnectError::not_found("network")),
        }
    }
    Ok(())
}

impl MembershipService {
    pub fn new(repo: Arc<dyn Repository>, ipam: Arc<IpamService>, audit: Arc<AuditChain>) -> Self {
        Self { repo, ipam, audit }
    }

    pub async fn create_network(
        &self,
        ct: CancellationToken,
        tenant_id: TenantId,
        created_by: UserId,
        name: String,
        cidr: ipnet::Ipv4Net,
        visibility: Visibility,
        join_policy: JoinPolicy,
    ) -> Result<Network> {
        let siblings = self
            .repo
            .list_networks_for_tenant(ct.clone(), &tenant_id)
            .await?;
        if siblings.iter().any(|n| cidrs_overlap(n.cidr, cidr)) {
            return Err(GoConnectError::conflict(
                ConflictKind::CidrOverlap,
                "network CIDR overlaps an existing network in this tenant",
            ));
        }

        let now = Utc::now();
        let network = Network {
            id: NetworkId(new_id()),
            tenant_id,
            name,
            cidr,
            visibility,
            join_policy,
            created_by: created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        let network = self.repo.create_network(ct.clone(), network).await?;

        self.repo
            .put_membership(
                ct.clone(),
                Membership {
                    network_id: network.id.clone(),
                    user_id: created_by.clone(),
                    status: MembershipStatus::Approved,
                    role: Role::Owner,
                    joined_at: now,
                    allocated_ip: None,
                    last_seen: None,
                },
            )
            .await?;

        self.audit
            .append(
                ct,
                AuditAction::NetworkCreated,
                created_by,
                network.id.0.clone(),
                serde_json::json!({"name": network.name, "cidr": network.cidr.to_string()}),
                new_id(),
            )
            .await?;

        Ok(network)
    }

    pub async fn get_network_for_caller(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        caller_tenant: &TenantId,
        caller: &UserId,
        is_admin: bool,
    ) -> Result<Network> {
        let network = self.repo.get_network(ct.clone(), network_id).await?;
        check_tenant(&network, caller_tenant)?;
        let membership = self
            .repo
            .get_membership(ct, network_id, caller)
            .await?;
        check_visible(&network, membership.as_ref(), is_admin)?;
        Ok(network)
    }

    /// Join a network under its configured policy (spec §4.5): `open` goes
    /// straight to `approved`; `code` requires a valid, atomically-consumed
    /// invite; `approval` parks the membership at `pending`.
    pub async fn join_network(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        caller_tenant: &TenantId,
        user_id: UserId,
        invite_code: Option<&str>,
    ) -> Result<Membership> {
        let network = self.repo.get_network(ct.clone(), network_id).await?;
        check_tenant(&network, caller_tenant)?;

        if let Some(existing) = self
            .repo
            .get_membership(ct.clone(), network_id, &user_id)
            .await?
        {
            return match existing.status {
                MembershipStatus::Approved => Err(GoConnectError::AlreadyMember),
                MembershipStatus::Pending => Err(GoConnectError::AlreadyRequested),
                MembershipStatus::Banned => Err(GoConnectError::Banned),
                MembershipStatus::Kicked => {
                    self.create_membership_by_policy(ct, network, user_id).await
                },
            };
        }

        if matches!(network.join_policy, JoinPolicy::Code) {
            let code = invite_code.ok_or_else(|| {
                GoConnectError::validation("this network requires an invite code to join")
            })?;
            let invite = self.repo.try_consume_invite(ct.clone(), code).await?;
            if !matches!(&invite.scope, InviteScope::Network(id) if id == network_id) {
                return Err(GoConnectError::validation("invite code is not valid for this network"));
            }
        }

        self.create_membership_by_policy(ct, network, user_id).await
    }

    async fn create_membership_by_policy(
        &self,
        ct: CancellationToken,
        network: Network,
        user_id: UserId,
    ) -> Result<Membership> {
        let status = match network.join_policy {
            JoinPolicy::Open | JoinPolicy::Code => MembershipStatus::Approved,
            JoinPolicy::Approval => MembershipStatus::Pending,
        };
        let membership = Membership {
            network_id: network.id.clone(),
            user_id: user_id.clone(),
            status,
            role: Role::Member,
            joined_at: Utc::now(),
            allocated_ip: None,
            last_seen: None,
        };
        let membership = self.repo.put_membership(ct.clone(), membership).await?;

        let action = if status == MembershipStatus::Approved {
            AuditAction::MemberJoined
        } else {
            AuditAction::MemberJoined
        };
        self.audit
            .append(
                ct,
                action,
                user_id,
                network.id.0.clone(),
                serde_json::json!({"status": status}),
                new_id(),
            )
            .await?;
        Ok(membership)
    }

    pub async fn approve_member(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        target: &UserId,
        approver: UserId,
    ) -> Result<Membership> {
        let mut membership = self
            .repo
            .get_membership(ct.clone(), network_id, target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        if !membership.can_transition_to(MembershipStatus::Approved) {
            return Err(GoConnectError::validation("membership cannot be approved from its current state"));
        }
        membership.status = MembershipStatus::Approved;
        let membership = self.repo.put_membership(ct.clone(), membership).await?;
        self.audit
            .append(
                ct,
                AuditAction::MemberApproved,
                approver,
                format!("{}/{}", network_id, target),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(membership)
    }

    pub async fn reject_member(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        target: &UserId,
        rejecter: UserId,
    ) -> Result<()> {
        let membership = self
            .repo
            .get_membership(ct.clone(), network_id, target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        if membership.status != MembershipStatus::Pending {
            return Err(GoConnectError::validation("only a pending request can be rejected"));
        }
        self.repo.delete_membership(ct.clone(), network_id, target).await?;
        self.audit
            .append(
                ct,
                AuditAction::MemberRejected,
                rejecter,
                format!("{}/{}", network_id, target),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(())
    }

    /// owner > admin > moderator > member (spec §4.5). Admins cannot demote
    /// the owner; moderators may kick/ban only plain members; the owner can
    /// never be removed.
    fn check_can_act_on(&self, actor_role: Role, target_role: Role, target_is_owner: bool) -> Result<()> {
        if target_is_owner {
            return Err(GoConnectError::Forbidden);
        }
        if !actor_role.outranks(target_role) && actor_role != Role::Owner {
            return Err(GoConnectError::Forbidden);
        }
        if actor_role == Role::Moderator && target_role != Role::Member {
            return Err(GoConnectError::Forbidden);
        }
        Ok(())
    }

    pub async fn kick_member(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        target: &UserId,
        actor: UserId,
        actor_role: Role,
    ) -> Result<()> {
        let membership = self
            .repo
            .get_membership(ct.clone(), network_id, target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        self.check_can_act_on(actor_role, membership.role, membership.role == Role::Owner)?;

        let mut membership = membership;
        membership.status = MembershipStatus::Kicked;
        self.repo.put_membership(ct.clone(), membership).await?;
        self.audit
            .append(
                ct,
                AuditAction::MemberKicked,
                actor,
                format!("{}/{}", network_id, target),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(())
    }

    pub async fn ban_member(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        target: &UserId,
        actor: UserId,
        actor_role: Role,
    ) -> Result<()> {
        let membership = self
            .repo
            .get_membership(ct.clone(), network_id, target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        self.check_can_act_on(actor_role, membership.role, membership.role == Role::Owner)?;

        let mut membership = membership;
        membership.status = MembershipStatus::Banned;
        self.repo.put_membership(ct.clone(), membership).await?;
        self.audit
            .append(
                ct,
                AuditAction::MemberBanned,
                actor,
                format!("{}/{}", network_id, target),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(())
    }

    /// Banned status persists until an admin/owner unbans (spec §4.5).
    pub async fn unban_member(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        target: &UserId,
        actor: UserId,
        actor_role: Role,
    ) -> Result<()> {
        if actor_role != Role::Owner && actor_role != Role::Admin {
            return Err(GoConnectError::Forbidden);
        }
        let mut membership = self
            .repo
            .get_membership(ct.clone(), network_id, target)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        if membership.status != MembershipStatus::Banned {
            return Err(GoConnectError::validation("membership is not banned"));
        }
        membership.status = MembershipStatus::Approved;
        self.repo.put_membership(ct.clone(), membership).await?;
        self.audit
            .append(
                ct,
                AuditAction::MemberUnbanned,
                actor,
                format!("{}/{}", network_id, target),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(())
    }

    pub async fn create_invite(
        &self,
        ct: CancellationToken,
        network_id: NetworkId,
        created_by: UserId,
        max_uses: u32,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<InviteToken> {
        let invite = InviteToken {
            id: InviteId(new_id()),
            scope: InviteScope::Network(network_id.clone()),
            code: random_invite_code(),
            max_uses,
            use_count: 0,
            expires_at,
            created_by: created_by.clone(),
            revoked_at: None,
        };
        let invite = self.repo.create_invite(ct.clone(), invite).await?;
        self.audit
            .append(
                ct,
                AuditAction::InviteCreated,
                created_by,
                network_id.0,
                serde_json::json!({"max_uses": max_uses}),
                new_id(),
            )
            .await?;
        Ok(invite)
    }

    pub async fn revoke_invite(
        &self,
        ct: CancellationToken,
        id: &InviteId,
        actor: UserId,
    ) -> Result<InviteToken> {
        let invite = self.repo.revoke_invite(ct.clone(), id).await?;
        self.audit
            .append(
                ct,
                AuditAction::InviteRevoked,
                actor,
                id.0.clone(),
                serde_json::json!({}),
                new_id(),
            )
            .await?;
        Ok(invite)
    }

    /// Wraps `IpamService::allocate`, persisting the allocation onto the
    /// membership record and emitting `IP_ALLOCATED` (spec §4.5/§8 S1).
    pub async fn allocate_ip(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        user_id: UserId,
    ) -> Result<std::net::Ipv4Addr> {
        // The lock spans the full read→compute→persist cycle, not just the
        // in-memory scan inside `IpamService::allocate` — otherwise two
        // concurrent callers can both read the same membership list, both
        // compute the same free address, and both persist it (spec §4.3/§5,
        // §8 property 2/8).
        let _guard = self.ipam.lock(network_id).await;

        let network = self.repo.get_network(ct.clone(), network_id).await?;
        let memberships = self
            .repo
            .list_memberships_for_network(ct.clone(), network_id)
            .await?;
        let existing: Vec<IpAllocation> = memberships
            .iter()
            .filter_map(|m| {
                m.allocated_ip.map(|ip| IpAllocation {
                    network_id: network_id.clone(),
                    user_id: m.user_id.clone(),
                    ip,
                })
            })
            .collect();

        let ip = self
            .ipam
            .allocate(network_id, &user_id, network.cidr, &existing)?;

        let mut membership = self
            .repo
            .get_membership(ct.clone(), network_id, &user_id)
            .await?
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        membership.allocated_ip = Some(ip);
        self.repo.put_membership(ct.clone(), membership).await?;

        self.audit
            .append(
                ct,
                AuditAction::IpAllocated,
                user_id,
                network_id.0.clone(),
                serde_json::json!({"ip": ip.to_string()}),
                new_id(),
            )
            .await?;
        Ok(ip)
    }

    /// Release(network, user): idempotent no-op if unallocated.
    pub async fn release_ip(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        user_id: &UserId,
        actor: UserId,
        actor_role: Option<Role>,
        admin_release: bool,
    ) -> Result<()> {
        if admin_release && !matches!(actor_role, Some(Role::Owner) | Some(Role::Admin)) {
            return Err(GoConnectError::Forbidden);
        }
        let mut membership = match self.repo.get_membership(ct.clone(), network_id, user_id).await? {
            Some(m) => m,
            None => return Ok(()),
        };
        if membership.allocated_ip.is_none() {
            return Ok(());
        }
        membership.allocated_ip = None;
        self.repo.put_membership(ct.clone(), membership).await?;
        self.audit
            .append(
                ct,
                AuditAction::IpReleased,
                actor,
                network_id.0.clone(),
                serde_json::json!({"user_id": user_id.0}),
                new_id(),
            )
            .await?;
        Ok(())
    }

    /// Materialises `GET /v1/devices/{id}/config`'s `PeerConfigSnapshot`
    /// (spec §3/§4.6): interface address, DNS, MTU default 1420, and every
    /// enabled peer device belonging to an approved member of the network,
    /// with `allowed_ips` set to the peer's single allocated `/32`.
    pub async fn build_peer_config_snapshot(
        &self,
        ct: CancellationToken,
        network_id: &NetworkId,
        requesting_user: &UserId,
        devices_by_user: &std::collections::HashMap<UserId, Vec<Device>>,
    ) -> Result<PeerConfigSnapshot> {
        let network = self.repo.get_network(ct.clone(), network_id).await?;
        let memberships = self
            .repo
            .list_memberships_for_network(ct.clone(), network_id)
            .await?;

        let my_membership = memberships
            .iter()
            .find(|m| &m.user_id == requesting_user)
            .ok_or_else(|| GoConnectError::not_found("membership"))?;
        let my_ip = my_membership
            .allocated_ip
            .ok_or_else(|| GoConnectError::validation("no IP allocated yet"))?;

        let mut peers = Vec::new();
        for membership in memberships
            .iter()
            .filter(|m| m.status == MembershipStatus::Approved)
        {
            let Some(ip) = membership.allocated_ip else { continue };
            for device in devices_by_user.get(&membership.user_id).cloned().unwrap_or_default() {
                if !device.is_enabled() {
                    continue;
                }
                peers.push(PeerConfigEntry {
                    peer_id: device.id,
                    name: device.name,
                    hostname: device.hostname,
                    public_key: device.public_key,
                    allowed_ips: vec![ipnet::IpNet::V4(
                        ipnet::Ipv4Net::new(ip, 32).expect("a /32 is always valid"),
                    )],
                    endpoint: None,
                });
            }
        }

        Ok(PeerConfigSnapshot {
            interface_address: ipnet::IpNet::V4(
                ipnet::Ipv4Net::new(my_ip, network.cidr.prefix_len())
                    .unwrap_or(network.cidr),
            ),
            dns: Vec::new(),
            mtu: 1420,
            peers,
        })
    }
}

fn cidrs_overlap(a: ipnet::Ipv4Net, b: ipnet::Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn random_invite_code() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567"; // uppercase base32
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::memory::MemoryRepository;

    fn service() -> MembershipService {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let audit = Arc::new(AuditChain::new(repo.clone(), 100));
        let ipam = Arc::new(IpamService::new());
        MembershipService::new(repo, ipam, audit)
    }

    #[tokio::test]
    async fn private_network_hides_from_outsider_as_not_found() {
        let svc = service();
        let ct = CancellationToken::new();
        let network = svc
            .create_network(
                ct.clone(),
                "t1".into(),
                "owner".into(),
                "N1".into(),
                "10.0.0.0/24".parse().unwrap(),
                Visibility::Private,
                JoinPolicy::Open,
            )
            .await
            .unwrap();

        let err = svc
            .get_network_for_caller(ct, &network.id, &"t1".into(), &"outsider".into(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, GoConnectError::NotFound(_)));
    }

    #[tokio::test]
    async fn open_join_transitions_straight_to_approved() {
        let svc = service();
        let ct = CancellationToken::new();
        let network = svc
            .create_network(
                ct.clone(),
                "t1".into(),
                "owner".into(),
                "N1".into(),
                "10.0.0.0/24".parse().unwrap(),
                Visibility::Public,
                JoinPolicy::Open,
            )
            .await
            .unwrap();
        let membership = svc
            .join_network(ct, &network.id, &"t1".into(), "member1".into(), None)
            .await
            .unwrap();
        assert_eq!(membership.status, MembershipStatus::Approved);
    }

    #[tokio::test]
    async fn approval_policy_parks_at_pending_then_admin_approves() {
        let svc = service();
        let ct = CancellationToken::new();
        let network = svc
            .create_network(
                ct.clone(),
                "t1".into(),
                "owner".into(),
                "N1".into(),
                "10.0.0.0/24".parse().unwrap(),
                Visibility::Public,
                JoinPolicy::Approval,
            )
            .await
            .unwrap();
        let membership = svc
            .join_network(ct.clone(), &network.id, &"t1".into(), "member1".into(), None)
            .await
            .unwrap();
        assert_eq!(membership.status, MembershipStatus::Pending);

        let approved = svc
            .approve_member(ct, &network.id, &"member1".into(), "owner".into())
            .await
            .unwrap();
        assert_eq!(approved.status, MembershipStatus::Approved);
    }

    #[tokio::test]
    async fn cross_tenant_network_lookup_is_not_found() {
        let svc = service();
        let ct = CancellationToken::new();
        let network = svc
            .create_network(
                ct.clone(),
                "t1".into(),
                "owner".into(),
                "N1".into(),
                "10.0.0.0/24".parse().unwrap(),
                Visibility::Public,
                JoinPolicy::Open,
            )
            .await
            .unwrap();
        let err = svc
            .join_network(ct, &network.id, &"t2".into(), "member1".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GoConnectError::NotFound(_)));
    }
}
