//! Contract for the host's network-information cache (`spec.md` §6
//! "NetInfo contract"). The live implementation (netlink-backed) is owned
//! by the host process; this crate only defines the shape it must expose
//! and a `StaticNetInfo` test double.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrFamily {
    Inet,
    Inet6,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrFlags {
    pub tentative: bool,
    pub duplicate: bool,
    pub permanent: bool,
    pub deprecated: bool,
}

#[derive(Debug, Clone)]
pub struct IfaceAddr {
    pub family: AddrFamily,
    pub local_addr: IpAddr,
    pub prefixlen: u8,
    pub scope: u8,
    pub flags: AddrFlags,
}

#[derive(Debug, Clone)]
pub struct Iface {
    pub name: String,
    pub ifindex: u32,
    pub hwaddr: Option<Vec<u8>>,
    pub arp_type: u16,
    pub vlan: Option<u16>,
    pub link_up: bool,
    pub network_up: bool,
    pub addrs: Vec<IfaceAddr>,
}

/// Read-only accessor onto the host's interface/address cache.
pub trait NetInfo {
    fn by_index(&self, ifindex: u32) -> Option<Iface>;
}

/// An in-memory `NetInfo` used by tests and anywhere the host hasn't wired
/// up a live netlink cache yet.
#[derive(Debug, Default, Clone)]
pub struct StaticNetInfo {
    ifaces: HashMap<u32, Iface>,
}

impl StaticNetInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, iface: Iface) {
        self.ifaces.insert(iface.ifindex, iface);
    }
}

impl NetInfo for StaticNetInfo {
    fn by_index(&self, ifindex: u32) -> Option<Iface> {
        self.ifaces.get(&ifindex).cloned()
    }
}
