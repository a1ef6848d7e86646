//! In-kernel IPv6/IPv4 translation core (SIIT and NAT64, RFC 7915).
//!
//! This crate implements the 6->4 packet-translation pipeline: given a
//! validated incoming IPv6 datagram and a resolved [`Instance`], it produces
//! a well-formed IPv4 datagram whose headers, checksums, fragmentation,
//! ICMP semantics, and embedded-packet rewrites conform to RFC 7915. It also
//! implements the per-namespace [`Registry`] that publishes and hot-swaps
//! translator instances for concurrent data-plane readers.
//!
//! The symmetric 4->6 pipeline, the BIB/pool4 allocator, the NAT64 fragment
//! reassembly collector, and the control-plane configuration front-end are
//! out of scope: this crate consumes them only through the trait boundaries
//! in [`host`] and the data owned by [`instance::Nat64State`].
//!
//! The only data-plane entry point is [`xlat_6to4`]; every other step
//! function is exercised directly in this crate's own tests but is not part
//! of the public contract RFC 7915 callers are expected to drive.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod address;
mod buffer_pool;
mod checksum;
mod error;
mod ext_header;
mod flow;
mod host;
mod icmp_map;
mod icmpv4_header_slice_mut;
mod inner;
mod instance;
mod l4;
mod outer;
mod registry;
mod skeleton;
mod slice_utils;
mod tcp_header_slice_mut;
mod udp_header_slice_mut;
mod xlat;

#[cfg(all(test, feature = "proptest"))]
#[allow(clippy::unwrap_used)]
mod proptests;

/// Buffers are pulled from a pool of this fixed size; translation never
/// grows a packet's payload, and ICMP errors are trimmed down to 576 bytes,
/// so a single generous size covers every jumbo-frame-capable link this
/// core is asked to translate for.
const MAX_DATAGRAM_PAYLOAD: usize = 65536;

pub use address::{Prefix4, Prefix6, VALID_POOL6_LENGTHS};
pub use error::{DropReason, Icmpv6Error, ParseError, RegistryError, Verdict};
pub use host::{
    BibBinding, BibLookup, DeviceId, FragmentCollector, IdAllocator, JoolDaemonQueue,
    NamespaceEnumerator, Pool4Allocator, Route, RoutingService, ScopedAddr,
};
pub use instance::{
    EamEntry, Endpoint, Framework, GlobalConfig, Instance, InstanceName, L4Proto, Mode,
    ModeState, Nat64State, NamespaceId, PacketTuples, SiitState, Tuple, Tuple4, Tuple6,
};
pub use registry::{Cursor, Registry};
pub use xlat::{xlat_6to4, OutPacket, Services};
