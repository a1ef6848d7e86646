//! Route lookup, source-address selection, and the MTU gate that runs
//! before a translated packet is committed to the wire. The actual output
//! buffer is built by the caller (it owns the zero-copy head-room
//! manipulation); this module only makes the routing/sizing decisions.

use std::net::Ipv4Addr;

use crate::error::{DropReason, Icmpv6Error, Verdict};
use crate::host::{NamespaceEnumerator, Route, RoutingService, ScopedAddr};
use crate::icmp_map;
use crate::instance::NamespaceId;

/// Whether a later (non-first) fragment, rather than the first, is the one
/// that overflows the MTU -- those are dropped silently instead of
/// triggering an ICMPv6 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPosition {
    First,
    Later,
}

/// Resolves a route for `flow_dst`, falling back to hairpin delivery when
/// `is_hairpin` is set.
pub fn resolve_route(
    routing: &dyn RoutingService,
    ns: NamespaceId,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    is_hairpin: bool,
) -> Result<Option<Route>, DropReason> {
    match routing.route4(ns, src, dst) {
        Some(route) => Ok(Some(route)),
        None if is_hairpin => Ok(None),
        None => Err(DropReason::RoutingFailure),
    }
}

/// Selects a source address when the flow's computed source is
/// unspecified (e.g. an empty pool4 or pool6791): prefer the route's
/// egress device's first universe-scoped address matching the
/// destination's family, else the first universe-scoped address on any
/// interface in the namespace.
pub fn select_source_address(
    routing: &dyn RoutingService,
    namespaces: &dyn NamespaceEnumerator,
    ns: NamespaceId,
    route: Option<&Route>,
) -> Option<Ipv4Addr> {
    if let Some(route) = route {
        if let Some(addr) = first_universe_scoped(routing.device_addrs(route.device)) {
            return Some(addr);
        }
    }

    first_universe_scoped(namespaces.all_addrs(ns))
}

fn first_universe_scoped(addrs: Vec<ScopedAddr>) -> Option<Ipv4Addr> {
    addrs
        .into_iter()
        .find(|a| a.universe_scoped)
        .map(|a| a.addr)
}

/// The MTU gate: decides whether the outgoing packet (of `out_len` bytes)
/// may proceed given the route's MTU.
pub fn mtu_gate(
    out_len: usize,
    route_mtu: u32,
    fragment: Option<FragmentPosition>,
    is_icmp_error: bool,
) -> Verdict<()> {
    // ICMP errors are never dropped here for size; they're trimmed to 576
    // bytes later in the L4 ICMP translator.
    if is_icmp_error {
        return Verdict::Continue(());
    }

    if out_len <= route_mtu as usize {
        return Verdict::Continue(());
    }

    match fragment {
        Some(FragmentPosition::Later) => Verdict::Drop(DropReason::SizeFailure),
        _ => Verdict::DropIcmp(
            DropReason::SizeFailure,
            Icmpv6Error::PacketTooBig {
                mtu: icmp_map::mtu6_advertisement_floor(route_mtu),
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtu_gate_passes_when_under_limit() {
        let verdict = mtu_gate(1000, 1500, None, false);
        assert!(verdict.is_continue());
    }

    #[test]
    fn mtu_gate_emits_icmp_for_first_fragment_overflow() {
        let verdict = mtu_gate(1600, 1500, Some(FragmentPosition::First), false);
        assert!(matches!(
            verdict,
            Verdict::DropIcmp(DropReason::SizeFailure, Icmpv6Error::PacketTooBig { mtu: 1520 })
        ));
    }

    #[test]
    fn mtu_gate_drops_silently_for_later_fragment_overflow() {
        let verdict = mtu_gate(1600, 1500, Some(FragmentPosition::Later), false);
        assert!(matches!(verdict, Verdict::Drop(DropReason::SizeFailure)));
    }

    #[test]
    fn mtu_gate_never_drops_icmp_errors_for_size() {
        let verdict = mtu_gate(999_999, 1500, None, true);
        assert!(verdict.is_continue());
    }
}
