//! Address helpers

use nix::ifaddrs::getifaddrs;
use nix::net::if_::{if_nametoindex, InterfaceFlags};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use tracing::{debug, trace};

/// fe80::/10
pub fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Give an unscoped link-local IPv6 address the index of the first interface
/// that carries a link-local address.
///
/// Returns true if the scope id was filled in. Addresses that are not
/// link-local, or already scoped, are left alone.
pub fn fill_link_local_scope(addr: &mut SocketAddrV6) -> bool {
    if addr.scope_id() != 0 || !is_unicast_link_local(addr.ip()) {
        return false;
    }
    match link_local_interface_index() {
        Some(index) => {
            debug!("scoping {} to interface {}", addr.ip(), index);
            addr.set_scope_id(index);
            true
        }
        None => {
            debug!("no interface with a link-local address for {}", addr.ip());
            false
        }
    }
}

/// [`fill_link_local_scope`] for either address family
pub fn scoped(mut addr: SocketAddr) -> SocketAddr {
    if let SocketAddr::V6(ref mut v6) = addr {
        fill_link_local_scope(v6);
    }
    addr
}

fn link_local_interface_index() -> Option<u32> {
    let interfaces = match getifaddrs() {
        Ok(interfaces) => interfaces,
        Err(errno) => {
            debug!("getifaddrs failed: {}", errno);
            return None;
        }
    };
    for ifaddr in interfaces {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(v6) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in6()) else {
            continue;
        };
        if !is_unicast_link_local(&v6.ip()) {
            continue;
        }
        match if_nametoindex(ifaddr.interface_name.as_str()) {
            Ok(index) => return Some(index),
            Err(errno) => trace!("if_nametoindex({}) failed: {}", ifaddr.interface_name, errno),
        }
    }
    None
}
