//! Linux-only route/address programming via `netlink-request`, used by
//! `wg::{set_addr,set_up,add_route}` to bring the overlay interface up and
//! program routes to peer `allowed_ips` without shelling out to `ip`(8).

use crate::Error;
use ipnet::IpNet;
use netlink_packet_core::{NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REQUEST};
use netlink_packet_route::{
    constants::*, AddressHeader, AddressMessage, LinkMessage, RouteHeader, RouteMessage, Nla,
    RtnlMessage, AF_INET, RTN_UNICAST, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE, RT_TABLE_MAIN,
};
use netlink_request::netlink_request_rtnl;
use wireguard_control::InterfaceName;

fn if_index(interface: &InterfaceName) -> Result<u32, Error> {
    let idx = unsafe { libc::if_nametoindex(interface.as_ptr()) };
    if idx == 0 {
        return Err(anyhow::anyhow!(
            "couldn't find interface {interface} to program netlink routes for"
        ));
    }
    Ok(idx)
}

pub fn set_addr(interface: &InterfaceName, addr: IpNet) -> Result<(), std::io::Error> {
    let if_index = if_index(interface).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
    })?;

    let mut message = AddressMessage {
        header: AddressHeader {
            family: if addr.addr().is_ipv4() {
                AF_INET as u8
            } else {
                AF_INET6 as u8
            },
            prefix_len: addr.prefix_len(),
            index: if_index,
            ..Default::default()
        },
        nlas: vec![],
    };
    match addr {
        IpNet::V4(net) => {
            message
                .nlas
                .push(netlink_packet_route::address::Nla::Local(
                    net.addr().octets().to_vec(),
                ));
            message
                .nlas
                .push(netlink_packet_route::address::Nla::Address(
                    net.addr().octets().to_vec(),
                ));
        },
        IpNet::V6(net) => {
            message
                .nlas
                .push(netlink_packet_route::address::Nla::Address(
                    net.addr().octets().to_vec(),
                ));
        },
    }

    netlink_request_rtnl(
        RtnlMessage::NewAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL),
    )
    .map_err(ignore_exists)?;
    Ok(())
}

pub fn set_up(interface: &InterfaceName, mtu: u32) -> Result<(), std::io::Error> {
    let if_index = if_index(interface).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
    })?;

    let mut message = LinkMessage::default();
    message.header.index = if_index;
    message.header.flags = IFF_UP;
    message.header.change_mask = IFF_UP;
    message.nlas.push(netlink_packet_route::link::nlas::Nla::Mtu(mtu));

    netlink_request_rtnl(
        RtnlMessage::SetLink(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    Ok(())
}

/// Add a route in the kernel routing table so traffic to `cidr` flows
/// through `interface`. Returns `true` if the route was newly created,
/// `false` if it already existed (treated as success, matching the teacher's
/// macOS `route add` idempotence check).
pub fn add_route(interface: &InterfaceName, cidr: IpNet) -> Result<bool, Error> {
    let if_index = if_index(interface)?;
    let mut message = RouteMessage {
        header: RouteHeader {
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_LINK,
            kind: RTN_UNICAST,
            address_family: if cidr.addr().is_ipv4() {
                AF_INET as u8
            } else {
                AF_INET6 as u8
            },
            destination_prefix_length: cidr.prefix_len(),
            ..Default::default()
        },
        nlas: vec![],
    };
    message.header.scope = if cidr.prefix_len() == 32 || cidr.prefix_len() == 128 {
        RT_SCOPE_UNIVERSE
    } else {
        RT_SCOPE_LINK
    };
    match cidr {
        IpNet::V4(net) => message.nlas.push(Nla::Destination(net.addr().octets().to_vec())),
        IpNet::V6(net) => message.nlas.push(Nla::Destination(net.addr().octets().to_vec())),
    }
    message.nlas.push(Nla::Oif(if_index as i32));

    match netlink_request_rtnl(
        RtnlMessage::NewRoute(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_EXCL | NLM_F_CREATE),
    ) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn ignore_exists(e: std::io::Error) -> std::io::Error {
    if e.kind() == std::io::ErrorKind::AlreadyExists {
        std::io::Error::new(std::io::ErrorKind::Other, "address already assigned")
    } else {
        e
    }
}

pub fn get_local_addrs() -> Result<impl Iterator<Item = std::net::IpAddr>, std::io::Error> {
    // Linux address enumeration goes through the standard `getifaddrs(3)`
    // libc wrapper rather than a netlink dump, since it's already
    // cancellation-free and synchronous, matching the macOS branch in
    // `shared::get_local_addrs`.
    use std::net::IpAddr;

    let mut addrs = vec![];
    unsafe {
        let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifap) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut cur = ifap;
        while !cur.is_null() {
            let ifa = &*cur;
            if !ifa.ifa_addr.is_null() {
                let family = (*ifa.ifa_addr).sa_family as i32;
                if family == libc::AF_INET {
                    let sock: *const libc::sockaddr_in = ifa.ifa_addr as *const _;
                    let ip = std::net::Ipv4Addr::from(u32::from_be((*sock).sin_addr.s_addr));
                    addrs.push(IpAddr::V4(ip));
                } else if family == libc::AF_INET6 {
                    let sock: *const libc::sockaddr_in6 = ifa.ifa_addr as *const _;
                    let ip = std::net::Ipv6Addr::from((*sock).sin6_addr.s6_addr);
                    addrs.push(IpAddr::V6(ip));
                }
            }
            cur = ifa.ifa_next;
        }
        libc::freeifaddrs(ifap);
    }
    Ok(addrs.into_iter())
}
