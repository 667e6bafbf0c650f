//! Renders the WireGuard `.conf` text format returned by
//! `GET /v1/networks/{id}/wg/profile` (spec §6), grounded on the
//! `PERSISTENT_KEEPALIVE_INTERVAL_SECS`/MTU defaults already established in
//! `shared::wg::up` and the `[Interface]`/`[Peer]` shape `wg-quick`(8)
//! expects.
//!
//! The control plane never holds a device's WireGuard private key (C7 keeps
//! it in the daemon's local secret store), so the rendered `PrivateKey` line
//! is a placeholder the operator fills in by hand when importing the
//! profile outside the daemon — the daemon itself never needs this text
//! form, since it applies `PeerConfigSnapshot` directly via
//! `wireguard-control`.

use crate::domain::PeerConfigEntry;
use crate::PERSISTENT_KEEPALIVE_INTERVAL_SECS;
use ipnet::IpNet;
use std::fmt::Write as _;

pub struct ProfileMetadata {
    pub user_email: String,
    pub network_name: String,
    pub device_name: String,
}

pub fn render(
    address: IpNet,
    dns: &[std::net::Ipv4Addr],
    mtu: u32,
    peers: &[PeerConfigEntry],
    meta: &ProfileMetadata,
) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# user = {}", meta.user_email);
    let _ = writeln!(out, "# network = {}", meta.network_name);
    let _ = writeln!(out, "# device = {}", meta.device_name);
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = <INSERT_DEVICE_PRIVATE_KEY>");
    let _ = writeln!(out, "Address = {address}");
    if !dns.is_empty() {
        let dns_list = dns
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "DNS = {dns_list}");
    }
    let _ = writeln!(out, "MTU = {mtu}");
    out.push('\n');

    for peer in peers {
        let _ = writeln!(out, "# peer = {} ({})", peer.name, peer.hostname);
        let _ = writeln!(out, "[Peer]");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "Endpoint = {endpoint}");
        }
        let allowed_ips = peer
            .allowed_ips
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "AllowedIPs = {allowed_ips}");
        let _ = writeln!(
            out,
            "PersistentKeepalive = {PERSISTENT_KEEPALIVE_INTERVAL_SECS}"
        );
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_interface_and_peer_sections() {
        let address: IpNet = "10.50.0.2/24".parse().unwrap();
        let peers = vec![PeerConfigEntry {
            peer_id: "dev2".into(),
            name: "bob-laptop".into(),
            hostname: "bob-laptop".into(),
            public_key: "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=".into(),
            allowed_ips: vec!["10.50.0.3/32".parse().unwrap()],
            endpoint: Some("203.0.113.9:51820".into()),
        }];
        let meta = ProfileMetadata {
            user_email: "alice@example.com".into(),
            network_name: "eng".into(),
            device_name: "alice-desktop".into(),
        };

        let text = render(address, &[], 1420, &peers, &meta);
        assert!(text.contains("[Interface]"));
        assert!(text.contains("Address = 10.50.0.2/24"));
        assert!(text.contains("[Peer]"));
        assert!(text.contains("PersistentKeepalive = 25"));
        assert!(text.contains("AllowedIPs = 10.50.0.3/32"));
    }
}
