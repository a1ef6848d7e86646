//! Trait boundaries for the host services this core consumes but does not
//! implement: routing, BIB lookup, pool4 allocation, joold and fragment
//! reassembly (both opaque to the 6->4 direction), and namespace/ID
//! enumeration for source-address selection.

use std::net::{IpAddr, Ipv4Addr};

use crate::instance::{NamespaceId, Tuple4, Tuple6};

/// An address on a host interface, with its routing scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopedAddr {
    pub addr: Ipv4Addr,
    pub universe_scoped: bool,
}

/// A resolved route.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub dst: Ipv4Addr,
    pub mtu: u32,
    pub device: DeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u64);

/// `route4`/`dst_mtu`/`dst_dev`/device info, consumed by the skeleton
/// builder.
pub trait RoutingService: Send + Sync {
    fn route4(&self, ns: NamespaceId, src: Ipv4Addr, dst: Ipv4Addr) -> Option<Route>;
    fn device_mtu(&self, device: DeviceId) -> u32;
    fn device_addrs(&self, device: DeviceId) -> Vec<ScopedAddr>;
}

/// Source-address selection's fallback path: every address on every
/// interface in a namespace, used when the route's egress device has none
/// matching scope.
pub trait NamespaceEnumerator: Send + Sync {
    fn all_addrs(&self, ns: NamespaceId) -> Vec<ScopedAddr>;
}

/// `ip_identifier(ns, hdr, segs) -> u16`: a fresh IPv4 Identification value
/// when the input carried no Fragment header to copy one from.
pub trait IdAllocator: Send + Sync {
    fn ip_identifier(&self, ns: NamespaceId) -> u16;
}

/// The result of a BIB lookup: the bound transport addresses on both
/// sides.
#[derive(Debug, Clone, Copy)]
pub struct BibBinding {
    pub v6_taddr: Tuple6,
    pub v4_taddr: Tuple4,
}

/// `bib_find(tuple6|tuple4) -> {v6_taddr, v4_taddr}`. The BIB itself is
/// out of scope; the core only ever reads through this trait.
pub trait BibLookup: Send + Sync {
    fn find_by_v6(&self, tuple: Tuple6) -> Option<BibBinding>;
}

/// Pool4 is consulted only to decide whether it is non-empty (for
/// source-address selection fallback); allocation itself belongs to the
/// out-of-scope outgoing-tuple computation.
pub trait Pool4Allocator: Send + Sync {
    fn is_empty(&self) -> bool;
}

/// The joold replication queue: entirely opaque here, the core never
/// writes to it on the 6->4 path (publication happens on session
/// creation, out of scope).
pub trait JoolDaemonQueue: Send + Sync {}

/// The NAT64 fragment reassembly collector: opaque, consulted only to
/// decide if a packet is itself a fragment during flow synthesis.
pub trait FragmentCollector: Send + Sync {}

/// `ip_identifier`'s namespace-scoped sibling used for hairpin detection
/// and logging; kept separate from [`IdAllocator`] since most hosts
/// implement it as a different subsystem.
pub fn is_hairpin(src_v4: Ipv4Addr, dst_v4: Ipv4Addr, local_addrs: &[IpAddr]) -> bool {
    local_addrs.contains(&IpAddr::V4(dst_v4)) && local_addrs.contains(&IpAddr::V4(src_v4))
}
