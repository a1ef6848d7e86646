//! The data model for one translator instance: mode, naming, the
//! global-configuration snapshot, and the SIIT/NAT64 tagged sub-state.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use crate::address::Prefix4;
use crate::address::Prefix6;
use crate::host::{BibLookup, FragmentCollector, JoolDaemonQueue, Pool4Allocator};

/// L4 protocol of a tuple/flow. ICMP's "port" slot carries the Echo
/// Identifier instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Proto {
    Tcp,
    Udp,
    Icmp,
}

/// One transport endpoint: an address plus a port, or (for ICMP) an Echo
/// Identifier in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<A> {
    pub addr: A,
    pub port: u16,
}

/// The 5-tuple identifying a flow, generic over the address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple<A> {
    pub l4: L4Proto,
    pub src: Endpoint<A>,
    pub dst: Endpoint<A>,
}

pub type Tuple6 = Tuple<Ipv6Addr>;
pub type Tuple4 = Tuple<Ipv4Addr>;

/// A packet's observed incoming tuple and, once resolved, its outgoing
/// (post-translation) tuple.
#[derive(Debug, Clone, Copy)]
pub struct PacketTuples {
    pub incoming: Tuple6,
    pub outgoing: Option<Tuple4>,
}

/// An Explicit Address Mapping entry: an IPv4 prefix bound to an IPv6
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EamEntry {
    pub v4: Prefix4,
    pub v6: Prefix6,
}

/// Looks up the table for a v6 address, returning the matching entry.
pub fn eam_lookup_v6(table: &[EamEntry], addr: Ipv6Addr) -> Option<&EamEntry> {
    table.iter().find(|e| e.v6.contains(addr))
}

/// The translator mode. Immutable for the life of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Siit,
    Nat64,
}

/// The netfilter-hook framework an instance is attached under. At most one
/// `Netfilter` instance may exist per namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Framework {
    Netfilter,
    IpTables,
}

/// Opaque handle identifying a network namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NamespaceId(pub u64);

/// An instance name: non-empty, at most 15 bytes, printable ASCII.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceName(String);

impl InstanceName {
    pub fn new(name: impl Into<String>) -> Result<Self, crate::error::RegistryError> {
        let name = name.into();

        let valid = !name.is_empty()
            && name.len() <= 15
            && name.bytes().all(|b| b.is_ascii_graphic() || b == b' ');

        if !valid {
            return Err(crate::error::RegistryError::InvalidName);
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The global-configuration snapshot shared by both modes.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// The RFC 6052 translation prefix, used by SIIT after a failed EAM
    /// lookup and by NAT64 for address embedding.
    pub pool6: Prefix6,
    /// If true, the IPv4 TOS byte is replaced with `new_tos` rather than
    /// copied from the IPv6 Traffic Class.
    pub reset_tos: bool,
    pub new_tos: u8,
    /// MTU plateau values the translator may advertise when synthesizing
    /// Packet-Too-Big messages for its own fragmentation decisions.
    pub mtu_plateaus: Vec<u32>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            pool6: Prefix6::new("64:ff9b::".parse().expect("valid literal"), 96),
            reset_tos: false,
            new_tos: 0,
            mtu_plateaus: vec![1500, 1492, 1280, 1006, 508, 296, 68],
        }
    }
}

/// SIIT-specific sub-state.
#[derive(Debug, Clone, Default)]
pub struct SiitState {
    pub eam: Vec<EamEntry>,
    pub blacklist4: Vec<Prefix4>,
    pub pool6791: Vec<Ipv4Addr>,
}

/// NAT64-specific sub-state. The databases themselves are owned and
/// implemented externally; the core only consults them through these
/// reference-counted handles.
#[derive(Clone)]
pub struct Nat64State {
    pub pool4: Arc<dyn Pool4Allocator>,
    pub bib: Arc<dyn BibLookup>,
    pub joold: Arc<dyn JoolDaemonQueue>,
    pub frag: Arc<dyn FragmentCollector>,
}

impl std::fmt::Debug for Nat64State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nat64State").finish_non_exhaustive()
    }
}

/// The mode-specific union, represented as a tagged variant rather than a
/// structural union so access is gated by the `Mode` tag.
#[derive(Debug, Clone)]
pub enum ModeState {
    Siit(SiitState),
    Nat64(Nat64State),
}

impl ModeState {
    pub fn mode(&self) -> Mode {
        match self {
            ModeState::Siit(_) => Mode::Siit,
            ModeState::Nat64(_) => Mode::Nat64,
        }
    }

    pub fn as_siit(&self) -> Option<&SiitState> {
        match self {
            ModeState::Siit(s) => Some(s),
            ModeState::Nat64(_) => None,
        }
    }

    pub fn as_nat64(&self) -> Option<&Nat64State> {
        match self {
            ModeState::Siit(_) => None,
            ModeState::Nat64(s) => Some(s),
        }
    }
}

/// An immutable-after-publication bundle describing one translator.
///
/// Invariants (enforced by [`crate::registry::Registry`], not here): within
/// one namespace, names are unique; at most one Netfilter-framework
/// instance exists; the mode tag never changes after construction;
/// publication is all-or-nothing.
#[derive(Debug, Clone)]
pub struct Instance {
    pub name: InstanceName,
    pub framework: Framework,
    pub namespace: NamespaceId,
    pub global: GlobalConfig,
    pub state: ModeState,
}

impl Instance {
    pub fn mode(&self) -> Mode {
        self.state.mode()
    }
}
