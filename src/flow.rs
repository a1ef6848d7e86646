//! Derives the IPv4 flow (addresses, TOS, protocol, L4 endpoints) for the
//! outgoing packet from the incoming IPv6 tuple and the instance's
//! address-map configuration.

use std::net::Ipv4Addr;

use etherparse::{IpNumber, Icmpv6Type};

use crate::address::{self, Prefix4};
use crate::error::{DropReason, Verdict};
use crate::icmp_map::{self, MappedIcmp};
use crate::instance::{eam_lookup_v6, EamEntry, Instance, ModeState, Tuple4, Tuple6};

/// L4-layer portion of a flow: either a straightforward port pair or the
/// mapped ICMP message.
#[derive(Debug, Clone, Copy)]
pub enum FlowL4 {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
    Icmp { mapped: MappedIcmp, id: u16 },
}

/// The inner (ICMP-embedded) address pair, present only when translating
/// an ICMP error.
#[derive(Debug, Clone, Copy)]
pub struct InnerFlow {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Ephemeral per-translation scratch, valid for the lifetime of one 6->4
/// call.
#[derive(Debug, Clone)]
pub struct FlowDescriptor {
    pub outer_src: Ipv4Addr,
    pub outer_dst: Ipv4Addr,
    pub inner: Option<InnerFlow>,
    pub tos: u8,
    pub protocol: IpNumber,
    pub l4: FlowL4,
    /// Opaque label carried through from the incoming packet (e.g. a
    /// connection-tracking mark); untouched by this core.
    pub mark: u32,
}

/// SIIT address translation: EAM first, then pool6 (RFC 6052).
pub fn translate_addrs64_siit(
    eam: &[EamEntry],
    pool6: &crate::address::Prefix6,
    addr: std::net::Ipv6Addr,
) -> Option<Ipv4Addr> {
    if let Some(entry) = eam_lookup_v6(eam, addr) {
        // The host bits of the v6 address (beyond the EAM's v6 prefix
        // length) become the host bits of the mapped v4 address. Valid EAM
        // configurations always give both sides the same host-bit width.
        let v6_host_bits = 128 - entry.v6.len as u32;
        let v4_host_bits = 32 - entry.v4.len as u32;
        debug_assert_eq!(v6_host_bits, v4_host_bits, "malformed EAM entry");

        let host_bits = address::get_bits(&addr.octets(), entry.v6.len as u32, v4_host_bits);

        let mut v4_octets = entry.v4.addr.octets();
        address::set_bits(&mut v4_octets, entry.v4.len as u32, v4_host_bits, host_bits);

        return Some(Ipv4Addr::from(v4_octets));
    }

    address::extract_v4_from_v6(pool6, addr)
}

/// Rejects a would-be translated address that falls in a reserved,
/// subnet-scoped range (RFC 7915 source/destination validity rule).
fn reject_subnet_scope(addr: Ipv4Addr) -> Option<DropReason> {
    address::is_subnet_scope(addr).then_some(DropReason::AddressingFailure)
}

/// Builds the [`FlowDescriptor`] for a non-ICMP (TCP/UDP) packet.
pub fn synthesize_tcp_udp_flow(
    instance: &Instance,
    incoming: Tuple6,
    outgoing_v4: Option<Tuple4>,
    protocol: IpNumber,
    l4: FlowL4,
    traffic_class: u8,
) -> Verdict<FlowDescriptor> {
    let (outer_src, outer_dst) = match resolve_outer_addrs(instance, incoming, outgoing_v4) {
        Ok(pair) => pair,
        Err(reason) => return Verdict::Drop(reason),
    };

    if let Some(reason) = reject_subnet_scope(outer_src).or_else(|| reject_subnet_scope(outer_dst))
    {
        return Verdict::Drop(reason);
    }

    Verdict::Continue(FlowDescriptor {
        outer_src,
        outer_dst,
        inner: None,
        tos: if instance.global.reset_tos {
            instance.global.new_tos
        } else {
            traffic_class
        },
        protocol,
        l4,
        mark: 0,
    })
}

/// Builds the [`FlowDescriptor`] for an ICMPv6 message, resolving the
/// type/code map and, for errors, the swapped inner address pair.
pub fn synthesize_icmp_flow(
    instance: &Instance,
    incoming: Tuple6,
    outgoing_v4: Option<Tuple4>,
    inner_incoming: Option<Tuple6>,
    inner_outgoing_v4: Option<Tuple4>,
    icmp_type: Icmpv6Type,
    icmp_id: u16,
    traffic_class: u8,
) -> Verdict<FlowDescriptor> {
    let (outer_src, outer_dst) = match resolve_outer_addrs(instance, incoming, outgoing_v4) {
        Ok(pair) => pair,
        Err(reason) => return Verdict::Drop(reason),
    };

    if let Some(reason) = reject_subnet_scope(outer_src).or_else(|| reject_subnet_scope(outer_dst))
    {
        return Verdict::Drop(reason);
    }

    let mapped = icmp_map::translate_type_code(icmp_type);
    if matches!(mapped, MappedIcmp::Untranslatable) {
        return Verdict::Drop(DropReason::UnsupportedMap);
    }

    let inner = if let Some(inner_incoming) = inner_incoming {
        // The inner packet's source (in the IPv6 error) becomes the inner
        // *destination* in the IPv4 error, and vice versa -- the error was
        // generated in response to a packet travelling the opposite way.
        let (inner_src, inner_dst) =
            match resolve_inner_addrs(instance, inner_incoming, inner_outgoing_v4) {
                Ok(pair) => pair,
                Err(reason) => return Verdict::Drop(reason),
            };

        Some(InnerFlow {
            src: inner_dst,
            dst: inner_src,
        })
    } else {
        None
    };

    // NAT64 rebinds the Echo Identifier to the BIB's `icmp4_id` (carried in
    // the outgoing tuple's `src.port` slot); SIIT has no BIB and copies the
    // incoming Identifier unchanged.
    let id = outgoing_v4.map(|t| t.src.port).unwrap_or(icmp_id);

    Verdict::Continue(FlowDescriptor {
        outer_src,
        outer_dst,
        inner,
        tos: if instance.global.reset_tos {
            instance.global.new_tos
        } else {
            traffic_class
        },
        protocol: IpNumber::ICMP,
        l4: FlowL4::Icmp { mapped, id },
        mark: 0,
    })
}

fn resolve_outer_addrs(
    instance: &Instance,
    incoming: Tuple6,
    outgoing_v4: Option<Tuple4>,
) -> Result<(Ipv4Addr, Ipv4Addr), DropReason> {
    match &instance.state {
        ModeState::Nat64(_) => {
            let outgoing = outgoing_v4.ok_or(DropReason::AddressingFailure)?;
            Ok((outgoing.src.addr, outgoing.dst.addr))
        }
        ModeState::Siit(siit) => {
            let src = translate_addrs64_siit(&siit.eam, &instance.global.pool6, incoming.src.addr)
                .ok_or(DropReason::AddressingFailure)?;
            let dst = translate_addrs64_siit(&siit.eam, &instance.global.pool6, incoming.dst.addr)
                .ok_or(DropReason::AddressingFailure)?;

            if siit.blacklist4.iter().any(|p: &Prefix4| p.contains(src)) {
                return Err(DropReason::AddressingFailure);
            }

            Ok((src, dst))
        }
    }
}

fn resolve_inner_addrs(
    instance: &Instance,
    inner_incoming: Tuple6,
    inner_outgoing_v4: Option<Tuple4>,
) -> Result<(Ipv4Addr, Ipv4Addr), DropReason> {
    resolve_outer_addrs(instance, inner_incoming, inner_outgoing_v4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Prefix6;
    use crate::instance::{GlobalConfig, SiitState};

    fn siit_instance(eam: Vec<EamEntry>) -> Instance {
        Instance {
            name: crate::instance::InstanceName::new("test").unwrap(),
            framework: crate::instance::Framework::IpTables,
            namespace: crate::instance::NamespaceId(0),
            global: GlobalConfig {
                pool6: Prefix6::new("64:ff9b::".parse().unwrap(), 96),
                ..GlobalConfig::default()
            },
            state: ModeState::Siit(SiitState {
                eam,
                blacklist4: vec![],
                pool6791: vec![],
            }),
        }
    }

    #[test]
    fn siit_falls_back_to_pool6_without_eam() {
        let instance = siit_instance(vec![]);
        let incoming = Tuple6 {
            l4: crate::instance::L4Proto::Udp,
            src: crate::instance::Endpoint {
                addr: "64:ff9b::c000:205".parse().unwrap(),
                port: 1234,
            },
            dst: crate::instance::Endpoint {
                addr: "64:ff9b::c000:21e".parse().unwrap(),
                port: 80,
            },
        };

        let verdict = synthesize_tcp_udp_flow(
            &instance,
            incoming,
            None,
            IpNumber::UDP,
            FlowL4::Udp {
                src_port: 1234,
                dst_port: 80,
            },
            0,
        );

        let Verdict::Continue(flow) = verdict else {
            panic!("expected Continue, got {verdict:?}");
        };

        assert_eq!(flow.outer_src, Ipv4Addr::new(192, 0, 2, 5));
        assert_eq!(flow.outer_dst, Ipv4Addr::new(192, 0, 2, 30));
    }
}
