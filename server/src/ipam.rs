//! C3 — IPAM allocator. Sticky, CIDR-scoped per-network IP allocation,
//! serialized per network via a `DashMap<NetworkId, tokio::sync::Mutex<()>>`
//! (spec §4.3/§5), grounded on the teacher's `CidrTree`/`is_assignable`
//! scan-and-reserve helpers (`shared/src/types.rs`,
//! `formnet/src/lib.rs::add_peer`).

use std::sync::Arc;
use std::net::Ipv4Addr;

use dashmap::DashMap;
use goconnect_shared::{
    domain::{IpAllocation, NetworkId, UserId},
    error::{ConflictKind, GoConnectError, Result},
};
use tokio::sync::OwnedMutexGuard;

pub struct IpamService {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl IpamService {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, network_id: &NetworkId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(network_id.0.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquires the per-network allocation lock, held by the caller across
    /// its own read→compute→persist cycle (spec §4.3/§5, §8 property 2/8):
    /// the lock must span the membership read `allocate_ip` does before
    /// calling [`Self::allocate`] and the `put_membership` write it does
    /// after, not just the in-memory scan, or two concurrent allocators can
    /// both compute and persist the same free address.
    pub async fn lock(&self, network_id: &NetworkId) -> OwnedMutexGuard<()> {
        self.lock_for(network_id).lock_owned().await
    }

    /// Allocate(network, user) — sticky on repeat call, ascending scan
    /// order, skipping network/broadcast/gateway (first host). Pure
    /// in-memory computation; the caller must hold the guard from
    /// [`Self::lock`] for the entire surrounding cycle.
    pub fn allocate(
        &self,
        _network_id: &NetworkId,
        user_id: &UserId,
        cidr: ipnet::Ipv4Net,
        existing: &[IpAllocation],
    ) -> Result<Ipv4Addr> {
        if let Some(existing) = existing.iter().find(|a| &a.user_id == user_id) {
            return Ok(existing.ip);
        }

        let taken: std::collections::HashSet<Ipv4Addr> =
            existing.iter().map(|a| a.ip).collect();
        let gateway = first_host(cidr);

        let free = cidr
            .hosts()
            .find(|ip| *ip != gateway && !taken.contains(ip))
            .ok_or_else(|| {
                GoConnectError::conflict(ConflictKind::IpExhausted, "no free address in network CIDR")
            })?;

        Ok(free)
    }

    /// Release(network, user): idempotent no-op if the user holds no
    /// allocation.
    pub fn release(&self, existing: &mut Vec<IpAllocation>, user_id: &UserId) {
        existing.retain(|a| &a.user_id != user_id);
    }
}

/// `ipnet::Ipv4Net::hosts()` already excludes the network/broadcast
/// addresses for prefixes shorter than /31; the first host is reserved as
/// the control-plane gateway per spec §3/§4.3.
pub fn first_host(cidr: ipnet::Ipv4Net) -> Ipv4Addr {
    cidr.hosts().next().unwrap_or_else(|| cidr.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(prefix: &str) -> ipnet::Ipv4Net {
        prefix.parse().unwrap()
    }

    #[test]
    fn allocate_is_sticky() {
        let ipam = IpamService::new();
        let cidr = net("10.50.0.0/29");
        let existing = vec![IpAllocation {
            network_id: "n1".into(),
            user_id: "u1".into(),
            ip: "10.50.0.3".parse().unwrap(),
        }];
        let ip = ipam
            .allocate(&"n1".into(), &"u1".into(), cidr, &existing)
            .unwrap();
        assert_eq!(ip, "10.50.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn slash_30_yields_two_usable_after_gateway_reserved() {
        // /30 gives 2 usable hosts; reserving the gateway (first host)
        // leaves exactly one further allocatable address before the
        // CIDR is considered full for a third allocation, per spec §8's
        // boundary behaviour and S1's exhaustion scenario.
        let ipam = IpamService::new();
        let cidr = net("10.50.0.0/30");

        let mut existing = Vec::new();
        let ip1 = ipam
            .allocate(&"n1".into(), &"u1".into(), cidr, &existing)
            .unwrap();
        existing.push(IpAllocation {
            network_id: "n1".into(),
            user_id: "u1".into(),
            ip: ip1,
        });

        let ip2 = ipam
            .allocate(&"n1".into(), &"u2".into(), cidr, &existing)
            .unwrap();
        existing.push(IpAllocation {
            network_id: "n1".into(),
            user_id: "u2".into(),
            ip: ip2,
        });
        assert_ne!(ip1, ip2);

        let err = ipam
            .allocate(&"n1".into(), &"u3".into(), cidr, &existing)
            .unwrap_err();
        assert!(matches!(
            err,
            GoConnectError::Conflict {
                kind: ConflictKind::IpExhausted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn lock_serializes_per_network() {
        let ipam = Arc::new(IpamService::new());
        let _guard = ipam.lock(&"n1".into()).await;
        assert!(ipam.locks.get("n1").is_some());
    }
}
