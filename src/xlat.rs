//! Wires [`flow`](crate::flow), [`outer`](crate::outer),
//! [`inner`](crate::inner), [`l4`](crate::l4), [`skeleton`](crate::skeleton)
//! and [`ext_header`](crate::ext_header) together into the single 6->4
//! entry point: parse the incoming IPv6 datagram, synthesize the outgoing
//! flow, build the IPv4 header(s), copy and fix up the L4 payload, and run
//! the route/MTU gate.

use std::net::{Ipv4Addr, Ipv6Addr};

use etherparse::{
    Icmpv4Header, Icmpv4Type, Icmpv6Slice, Icmpv6Type, IpNumber, Ipv4Header, Ipv6Header,
    Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice,
};

use crate::buffer_pool::Buffer;
use crate::checksum::ChecksumMode;
use crate::error::{DropReason, Verdict};
use crate::ext_header::{self, ChainSummary};
use crate::flow::{self, FlowDescriptor, FlowL4, InnerFlow};
use crate::host::{self, IdAllocator, NamespaceEnumerator, RoutingService};
use crate::icmp_map::{self, MappedIcmp};
use crate::icmpv4_header_slice_mut::Icmpv4HeaderSliceMut;
use crate::inner;
use crate::instance::{Endpoint, Instance, L4Proto, Tuple, Tuple4, Tuple6};
use crate::l4;
use crate::outer::{self, FragmentFields, Ipv6HeaderFields};
use crate::skeleton::{self, FragmentPosition};
use crate::tcp_header_slice_mut::TcpHeaderSliceMut;
use crate::udp_header_slice_mut::UdpHeaderSliceMut;

/// The host services a single `xlat_6to4` call needs beyond the
/// `Instance` it is translating for. Bundled so the public entry point
/// keeps the two-argument shape described for it, while the pipeline
/// internally still reaches the handful of host collaborators RFC 7915
/// translation depends on (route/MTU lookup, source-address selection,
/// fresh IPv4 Identification values).
pub struct Services<'a> {
    pub routing: &'a dyn RoutingService,
    pub namespaces: &'a dyn NamespaceEnumerator,
    pub ids: &'a dyn IdAllocator,
    /// Addresses local to the translator, for hairpin detection.
    pub local_addrs: &'a [std::net::IpAddr],
}

/// A translated packet ready to be handed to the host stack.
#[derive(Debug)]
pub struct OutPacket {
    buf: Buffer,
    len: usize,
}

impl OutPacket {
    fn from_vec(bytes: Vec<u8>) -> Self {
        let mut buf = Buffer::default();
        buf[..bytes.len()].copy_from_slice(&bytes);

        Self {
            buf,
            len: bytes.len(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Translates one incoming IPv6 datagram to IPv4 under `instance`.
///
/// `packet_in` is the full IPv6 datagram, starting at the fixed header.
/// `checksum_mode` describes how the *incoming* L4 checksum is currently
/// represented in the buffer (mirrors the host packet-buffer service's
/// three checksum states, see [`ChecksumMode`]).
pub fn xlat_6to4(
    instance: &Instance,
    services: &Services<'_>,
    packet_in: &[u8],
    checksum_mode: ChecksumMode,
) -> Verdict<OutPacket> {
    let verdict = dispatch(instance, services, packet_in, checksum_mode);

    match &verdict {
        Verdict::Continue(out) => {
            tracing::trace!(instance = instance.name.as_str(), out_len = out.len, "Translated 6->4");
        }
        Verdict::Drop(reason) => {
            tracing::debug!(instance = instance.name.as_str(), %reason, "Dropped 6->4 packet");
        }
        Verdict::DropIcmp(reason, err) => {
            tracing::debug!(instance = instance.name.as_str(), %reason, ?err, "Dropped 6->4 packet, replying with ICMPv6 error");
        }
        Verdict::Untranslatable(reason) => {
            tracing::trace!(instance = instance.name.as_str(), %reason, "6->4 packet is untranslatable, surfacing to host stack");
        }
    }

    verdict
}

fn dispatch(
    instance: &Instance,
    services: &Services<'_>,
    packet_in: &[u8],
    checksum_mode: ChecksumMode,
) -> Verdict<OutPacket> {
    let ipv6 = match Ipv6HeaderSlice::from_slice(packet_in) {
        Ok(header) => header,
        Err(_) => return Verdict::Drop(DropReason::MalformedInput),
    };

    let payload = &packet_in[Ipv6Header::LEN..];
    let chain = ext_header::walk(ipv6.next_header(), payload);
    let l4_bytes = &payload[chain.payload_offset..];

    let header_fields = Ipv6HeaderFields {
        hop_limit: ipv6.hop_limit(),
        payload_length: ipv6.payload_length(),
    };

    match chain.final_next_header {
        IpNumber::TCP => translate_tcp(
            instance,
            services,
            &ipv6,
            header_fields,
            &chain,
            l4_bytes,
            checksum_mode,
        ),
        IpNumber::UDP => translate_udp(
            instance,
            services,
            &ipv6,
            header_fields,
            &chain,
            l4_bytes,
            checksum_mode,
        ),
        IpNumber::IPV6_ICMP => translate_icmp(
            instance,
            services,
            &ipv6,
            header_fields,
            &chain,
            l4_bytes,
            checksum_mode,
        ),
        _ => Verdict::Drop(DropReason::UnsupportedMap),
    }
}

fn fragment_fields(chain: &ChainSummary, payload: &[u8]) -> Option<FragmentFields> {
    let offset = chain.fragment_header_offset? - 40;
    let bytes = payload.get(offset..offset + 8)?;

    let off_and_flags = u16::from_be_bytes([bytes[2], bytes[3]]);
    let identification = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    Some(FragmentFields {
        identification_low16: identification as u16,
        more_fragments: off_and_flags & 0x1 != 0,
        fragment_offset: off_and_flags >> 3,
    })
}

fn fragment_position(chain: &ChainSummary, payload: &[u8]) -> Option<FragmentPosition> {
    let fields = fragment_fields(chain, payload)?;

    Some(if fields.fragment_offset == 0 {
        FragmentPosition::First
    } else {
        FragmentPosition::Later
    })
}

/// Resolves a route, picks a source address if the flow didn't already
/// have one, builds the IPv4 header, and runs the MTU gate. Shared by the
/// TCP/UDP/ICMP translators, which differ only in what they copy into the
/// L4 payload.
fn build_outer_header(
    instance: &Instance,
    services: &Services<'_>,
    header_fields: Ipv6HeaderFields,
    chain: &ChainSummary,
    payload: &[u8],
    flow: &FlowDescriptor,
    is_icmp_error: bool,
) -> Verdict<(Ipv4Header, Option<host::Route>)> {
    let is_hairpin = host::is_hairpin(flow.outer_src, flow.outer_dst, services.local_addrs);

    let route = match skeleton::resolve_route(
        services.routing,
        instance.namespace,
        flow.outer_src,
        flow.outer_dst,
        is_hairpin,
    ) {
        Ok(route) => route,
        Err(reason) => return Verdict::Drop(reason),
    };

    let fragment = fragment_fields(chain, payload);
    let fresh_id = || services.ids.ip_identifier(instance.namespace);

    let mut header = match outer::build(header_fields, chain, fragment, flow, fresh_id, true) {
        Verdict::Continue(header) => header,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    if header.source == [0, 0, 0, 0] {
        if let Some(addr) =
            skeleton::select_source_address(services.routing, services.namespaces, instance.namespace, route.as_ref())
        {
            header.source = addr.octets();
            header.header_checksum = header.calc_header_checksum();
        }
    }

    let out_len = header.total_len as usize;
    let route_mtu = route.as_ref().map(|r| r.mtu);
    let fragment_pos = fragment_position(chain, payload);

    if let Some(mtu) = route_mtu {
        match skeleton::mtu_gate(out_len, mtu, fragment_pos, is_icmp_error) {
            Verdict::Continue(()) => {}
            Verdict::Drop(reason) => return Verdict::Drop(reason),
            Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
            Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
        }
    }

    Verdict::Continue((header, route))
}

fn incoming_tuple6(src: Ipv6Addr, dst: Ipv6Addr, l4: L4Proto, src_port: u16, dst_port: u16) -> Tuple6 {
    Tuple {
        l4,
        src: Endpoint { addr: src, port: src_port },
        dst: Endpoint { addr: dst, port: dst_port },
    }
}

fn bib_lookup(instance: &Instance, tuple: Tuple6) -> Option<Tuple4> {
    instance
        .state
        .as_nat64()
        .and_then(|nat64| nat64.bib.find_by_v6(tuple))
        .map(|binding| binding.v4_taddr)
}

fn assemble(header: Ipv4Header, l4_bytes: &[u8]) -> Result<Vec<u8>, DropReason> {
    let mut out = Vec::with_capacity(header.header_len() + l4_bytes.len());
    header
        .write(&mut out)
        .map_err(|_| DropReason::ResourceExhaustion)?;
    out.extend_from_slice(l4_bytes);
    Ok(out)
}

fn translate_tcp(
    instance: &Instance,
    services: &Services<'_>,
    ipv6: &Ipv6HeaderSlice<'_>,
    header_fields: Ipv6HeaderFields,
    chain: &ChainSummary,
    l4_bytes: &[u8],
    checksum_mode: ChecksumMode,
) -> Verdict<OutPacket> {
    let tcp = match TcpHeaderSlice::from_slice(l4_bytes) {
        Ok(tcp) => tcp,
        Err(_) => return Verdict::Drop(DropReason::MalformedInput),
    };

    let incoming = incoming_tuple6(
        ipv6.source_addr(),
        ipv6.destination_addr(),
        L4Proto::Tcp,
        tcp.source_port(),
        tcp.destination_port(),
    );
    let outgoing = bib_lookup(instance, incoming);

    let flow_verdict = flow::synthesize_tcp_udp_flow(
        instance,
        incoming,
        outgoing,
        IpNumber::TCP,
        FlowL4::Tcp {
            src_port: outgoing.map(|t| t.src.port).unwrap_or(tcp.source_port()),
            dst_port: outgoing.map(|t| t.dst.port).unwrap_or(tcp.destination_port()),
        },
        ipv6.traffic_class(),
    );
    let flow = match flow_verdict {
        Verdict::Continue(flow) => flow,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let (header, _route) = match build_outer_header(
        instance, services, header_fields, chain, &[][..], &flow, false,
    ) {
        Verdict::Continue(pair) => pair,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let FlowL4::Tcp { src_port, dst_port } = flow.l4 else {
        unreachable!("flow synthesized for TCP always carries FlowL4::Tcp")
    };

    let mut out = match assemble(header, l4_bytes) {
        Ok(out) => out,
        Err(reason) => return Verdict::Drop(reason),
    };
    let l4_start = out.len() - l4_bytes.len();

    let port_changed = src_port != tcp.source_port() || dst_port != tcp.destination_port();
    let (old_ports, new_ports) = if port_changed {
        (
            [tcp.source_port().to_be_bytes(), tcp.destination_port().to_be_bytes()].concat(),
            [src_port.to_be_bytes(), dst_port.to_be_bytes()].concat(),
        )
    } else {
        (Vec::new(), Vec::new())
    };

    let (new_mode, new_checksum) = l4::translate_l4_checksum(
        checksum_mode,
        tcp.checksum(),
        ipv6.source_addr(),
        ipv6.destination_addr(),
        flow.outer_src,
        flow.outer_dst,
        &old_ports,
        &new_ports,
        false,
    );

    {
        let mut slice = match TcpHeaderSliceMut::from_slice(&mut out[l4_start..]) {
            Ok(slice) => slice,
            Err(_) => return Verdict::Drop(DropReason::ResourceExhaustion),
        };
        if port_changed {
            slice.set_source_port(src_port);
            slice.set_destination_port(dst_port);
        }
        write_checksum_field(&mut slice, new_mode, new_checksum);
    }

    Verdict::Continue(OutPacket::from_vec(out))
}

fn write_checksum_field(slice: &mut TcpHeaderSliceMut<'_>, mode: ChecksumMode, value: u16) {
    match mode {
        ChecksumMode::Complete | ChecksumMode::Partial { .. } => slice.set_checksum(value),
        ChecksumMode::Unnecessary => {}
    }
}

fn translate_udp(
    instance: &Instance,
    services: &Services<'_>,
    ipv6: &Ipv6HeaderSlice<'_>,
    header_fields: Ipv6HeaderFields,
    chain: &ChainSummary,
    l4_bytes: &[u8],
    checksum_mode: ChecksumMode,
) -> Verdict<OutPacket> {
    let udp = match UdpHeaderSlice::from_slice(l4_bytes) {
        Ok(udp) => udp,
        Err(_) => return Verdict::Drop(DropReason::MalformedInput),
    };

    let incoming = incoming_tuple6(
        ipv6.source_addr(),
        ipv6.destination_addr(),
        L4Proto::Udp,
        udp.source_port(),
        udp.destination_port(),
    );
    let outgoing = bib_lookup(instance, incoming);

    let flow_verdict = flow::synthesize_tcp_udp_flow(
        instance,
        incoming,
        outgoing,
        IpNumber::UDP,
        FlowL4::Udp {
            src_port: outgoing.map(|t| t.src.port).unwrap_or(udp.source_port()),
            dst_port: outgoing.map(|t| t.dst.port).unwrap_or(udp.destination_port()),
        },
        ipv6.traffic_class(),
    );
    let flow = match flow_verdict {
        Verdict::Continue(flow) => flow,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let (header, _route) = match build_outer_header(
        instance, services, header_fields, chain, &[][..], &flow, false,
    ) {
        Verdict::Continue(pair) => pair,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let FlowL4::Udp { src_port, dst_port } = flow.l4 else {
        unreachable!("flow synthesized for UDP always carries FlowL4::Udp")
    };

    let mut out = match assemble(header, l4_bytes) {
        Ok(out) => out,
        Err(reason) => return Verdict::Drop(reason),
    };
    let l4_start = out.len() - l4_bytes.len();

    let port_changed = src_port != udp.source_port() || dst_port != udp.destination_port();
    let (old_ports, new_ports) = if port_changed {
        (
            [udp.source_port().to_be_bytes(), udp.destination_port().to_be_bytes()].concat(),
            [src_port.to_be_bytes(), dst_port.to_be_bytes()].concat(),
        )
    } else {
        (Vec::new(), Vec::new())
    };

    let (new_mode, mut new_checksum) = l4::translate_l4_checksum(
        checksum_mode,
        udp.checksum(),
        ipv6.source_addr(),
        ipv6.destination_addr(),
        flow.outer_src,
        flow.outer_dst,
        &old_ports,
        &new_ports,
        true,
    );

    if matches!(new_mode, ChecksumMode::Complete) {
        new_checksum = crate::checksum::normalize_udp_zero(new_checksum);
    }

    {
        let mut slice = unsafe { UdpHeaderSliceMut::from_slice_unchecked(&mut out[l4_start..]) };
        if port_changed {
            slice.set_source_port(src_port);
            slice.set_destination_port(dst_port);
        }
        match new_mode {
            ChecksumMode::Complete | ChecksumMode::Partial { .. } => slice.set_checksum(new_checksum),
            ChecksumMode::Unnecessary => {}
        }
    }

    Verdict::Continue(OutPacket::from_vec(out))
}

/// Validates the incoming ICMPv6 checksum when the buffer's checksum
/// state requires it. `ChecksumMode::Unnecessary` skips validation (the
/// host already validated it, e.g. in hardware).
fn validate_icmpv6_checksum(mode: ChecksumMode, l4_bytes: &[u8], src: Ipv6Addr, dst: Ipv6Addr) -> bool {
    if matches!(mode, ChecksumMode::Unnecessary) {
        return true;
    }

    let mut acc = crate::checksum::pseudo_header_v6(src, dst);
    acc.add_u16(l4_bytes.len() as u16);
    acc.add_u16(IpNumber::IPV6_ICMP.0 as u16);
    acc.add_bytes(l4_bytes);

    // A correct checksum folds to the one's-complement "all ones", not
    // zero: the checksum field itself is part of the summed bytes, so a
    // valid datagram's words sum to the complement of zero.
    acc.finish() == 0
}

fn translate_icmp(
    instance: &Instance,
    services: &Services<'_>,
    ipv6: &Ipv6HeaderSlice<'_>,
    header_fields: Ipv6HeaderFields,
    chain: &ChainSummary,
    l4_bytes: &[u8],
    checksum_mode: ChecksumMode,
) -> Verdict<OutPacket> {
    let icmp = match Icmpv6Slice::from_slice(l4_bytes) {
        Ok(icmp) => icmp,
        Err(_) => return Verdict::Drop(DropReason::MalformedInput),
    };

    if !validate_icmpv6_checksum(checksum_mode, l4_bytes, ipv6.source_addr(), ipv6.destination_addr()) {
        return Verdict::Drop(DropReason::ResourceExhaustion);
    }

    let icmp_type = icmp.header().icmp_type;
    let (icmp_id, is_echo) = match icmp_type {
        Icmpv6Type::EchoRequest(h) | Icmpv6Type::EchoReply(h) => (h.id, true),
        _ => (0, false),
    };

    let mapped = icmp_map::translate_type_code(icmp_type);
    if matches!(mapped, MappedIcmp::Untranslatable) {
        return Verdict::Drop(DropReason::UnsupportedMap);
    }

    let incoming = incoming_tuple6(
        ipv6.source_addr(),
        ipv6.destination_addr(),
        L4Proto::Icmp,
        icmp_id,
        icmp_id,
    );
    let outgoing = bib_lookup(instance, incoming);

    // For ICMP errors, parse the embedded (quoted) IPv6 datagram and
    // resolve its own (swapped) address pair -- RFC 7915 §4.7.
    let mut inner_ipv6 = None;
    let mut inner_chain = None;
    let mut inner_outgoing = None;
    let inner_payload = icmp.payload();

    if icmp_map::carries_inner_packet(&match mapped {
        MappedIcmp::Translate(ty) => ty,
        MappedIcmp::Untranslatable => unreachable!("checked above"),
    }) {
        let Ok(quoted) = Ipv6HeaderSlice::from_slice(inner_payload) else {
            return Verdict::Drop(DropReason::MalformedInput);
        };
        let quoted_payload = &inner_payload[Ipv6Header::LEN..];
        let quoted_chain = ext_header::walk(quoted.next_header(), quoted_payload);
        let quoted_l4 = &quoted_payload[quoted_chain.payload_offset..];

        let (inner_l4, inner_src_port, inner_dst_port) = match quoted_chain.final_next_header {
            IpNumber::TCP => match TcpHeaderSlice::from_slice(quoted_l4) {
                Ok(h) => (L4Proto::Tcp, h.source_port(), h.destination_port()),
                Err(_) => return Verdict::Drop(DropReason::MalformedInput),
            },
            IpNumber::UDP => match UdpHeaderSlice::from_slice(quoted_l4) {
                Ok(h) => (L4Proto::Udp, h.source_port(), h.destination_port()),
                Err(_) => return Verdict::Drop(DropReason::MalformedInput),
            },
            IpNumber::IPV6_ICMP => match Icmpv6Slice::from_slice(quoted_l4) {
                Ok(h) => {
                    let id = match h.header().icmp_type {
                        Icmpv6Type::EchoRequest(eh) | Icmpv6Type::EchoReply(eh) => eh.id,
                        _ => 0,
                    };
                    (L4Proto::Icmp, id, id)
                }
                Err(_) => return Verdict::Drop(DropReason::MalformedInput),
            },
            _ => return Verdict::Drop(DropReason::UnsupportedMap),
        };

        let quoted_tuple = incoming_tuple6(
            quoted.source_addr(),
            quoted.destination_addr(),
            inner_l4,
            inner_src_port,
            inner_dst_port,
        );

        inner_outgoing = bib_lookup(instance, quoted_tuple);
        inner_ipv6 = Some(quoted);
        inner_chain = Some((quoted_chain, quoted_tuple));
    }

    let flow_verdict = flow::synthesize_icmp_flow(
        instance,
        incoming,
        outgoing,
        inner_chain.as_ref().map(|(_, tuple)| *tuple),
        inner_outgoing,
        icmp_type,
        icmp_id,
        ipv6.traffic_class(),
    );
    let flow = match flow_verdict {
        Verdict::Continue(flow) => flow,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let is_error = !is_echo;

    let (mut header, route) = match build_outer_header(
        instance, services, header_fields, chain, &[][..], &flow, is_error,
    ) {
        Verdict::Continue(pair) => pair,
        Verdict::Drop(reason) => return Verdict::Drop(reason),
        Verdict::DropIcmp(reason, err) => return Verdict::DropIcmp(reason, err),
        Verdict::Untranslatable(reason) => return Verdict::Untranslatable(reason),
    };

    let FlowL4::Icmp { mapped, id: new_id } = flow.l4 else {
        unreachable!("flow synthesized for ICMP always carries FlowL4::Icmp")
    };
    let MappedIcmp::Translate(mut icmpv4_type) = mapped else {
        unreachable!("checked above")
    };

    // Fill in the MTU / pointer fields the type/code table left as
    // placeholders.
    if let (
        Icmpv6Type::PacketTooBig { mtu },
        Icmpv4Type::DestinationUnreachable(etherparse::icmpv4::DestUnreachableHeader::FragmentationNeeded {
            next_hop_mtu,
        }),
    ) = (&icmp_type, &mut icmpv4_type)
    {
        let route_mtu = route.as_ref().map(|r| r.mtu);
        *next_hop_mtu = icmp_map::compute_mtu4(*mtu, route_mtu, None) as u16;
    }

    if let Icmpv6Type::ParameterProblem(pp) = icmp_type {
        match icmp_map::param_problem_pointer(pp.pointer as u8) {
            icmp_map::PointerMapping::Mapped(ptr) => {
                icmpv4_type = Icmpv4Type::ParameterProblem(
                    etherparse::icmpv4::ParameterProblemHeader::PointerIndicatesError(ptr),
                );
            }
            icmp_map::PointerMapping::Untranslatable => {
                return Verdict::Drop(DropReason::UnsupportedMap);
            }
        }
    }

    let mut icmpv4_payload;

    if let Some(quoted) = inner_ipv6 {
        let (quoted_chain, _tuple) = inner_chain.expect("set alongside inner_ipv6");
        let quoted_payload = &inner_payload[Ipv6Header::LEN..];
        let quoted_l4 = &quoted_payload[quoted_chain.payload_offset..];

        let inner_flow = flow.inner.unwrap_or(InnerFlow {
            src: flow.outer_dst,
            dst: flow.outer_src,
        });
        let mut inner_flow_descriptor = flow.clone();
        inner_flow_descriptor.outer_src = inner_flow.src;
        inner_flow_descriptor.outer_dst = inner_flow.dst;
        inner_flow_descriptor.protocol = quoted_chain.final_next_header;

        let inner_header_fields = Ipv6HeaderFields {
            hop_limit: quoted.hop_limit(),
            payload_length: quoted.payload_length(),
        };
        let inner_fragment = fragment_fields(&quoted_chain, quoted_payload);
        let fresh_id = || services.ids.ip_identifier(instance.namespace);

        let mut inner_header = inner::build(inner_header_fields, inner_fragment, &inner_flow_descriptor, fresh_id);
        inner_header.total_len -= quoted_chain.payload_offset as u16;
        inner_header.header_checksum = inner_header.calc_header_checksum();

        icmpv4_payload = match assemble(inner_header, quoted_l4) {
            Ok(bytes) => bytes,
            Err(reason) => return Verdict::Drop(reason),
        };
    } else {
        icmpv4_payload = icmp.payload().to_vec();
    }

    // RFC 4884 extension area: only Destination-Unreachable and Time-Exceeded
    // carry the "length" field (the second byte of the 4-byte word following
    // the checksum, per the original's `icmp6_length` / `icmp4_length`
    // overlay); Packet-Too-Big and Parameter-Problem use that word for their
    // own mtu/pointer and never carry an extension structure.
    let icmp6_length = match icmp_type {
        Icmpv6Type::DestinationUnreachable(_) | Icmpv6Type::TimeExceeded(_) => Some(l4_bytes[5]),
        _ => None,
    };

    let icmpv4_header = Icmpv4Header::new(icmpv4_type);
    let mut icmpv4_bytes = Vec::new();
    if icmpv4_header.write(&mut icmpv4_bytes).is_err() {
        return Verdict::Drop(DropReason::ResourceExhaustion);
    }
    icmpv4_bytes.append(&mut icmpv4_payload);

    if let Some(units) = icmp6_length {
        let current_total_len = header.header_len() + icmpv4_bytes.len();

        if let l4::ExtensionAction::ForceRemove =
            l4::adjust_extension_area(Some(units), current_total_len, l4::ICMP_ERROR_MAX_LEN)
        {
            let quoted_len = units as usize * 8;
            icmpv4_bytes.truncate((8 + quoted_len).min(icmpv4_bytes.len()));
        }

        // Mirrors the ICMPv6 "length" field at the same byte offset; still
        // accurate after a force-remove, since the quoted datagram's own
        // length (what this field describes) didn't change.
        icmpv4_bytes[5] = units;
    }

    if is_echo {
        let mut slice = match Icmpv4HeaderSliceMut::from_slice(&mut icmpv4_bytes) {
            Ok(slice) => slice,
            Err(_) => return Verdict::Drop(DropReason::ResourceExhaustion),
        };
        slice.set_identifier(new_id);
    }

    let checksum = l4::icmpv4_checksum_from_scratch(&icmpv4_bytes);
    {
        let mut slice = match Icmpv4HeaderSliceMut::from_slice(&mut icmpv4_bytes) {
            Ok(slice) => slice,
            Err(_) => return Verdict::Drop(DropReason::ResourceExhaustion),
        };
        slice.set_checksum(checksum);
    }

    if is_error {
        let total_len = header.header_len() + icmpv4_bytes.len();
        let (trimmed_len, clear_df) = l4::trim_to_error_max(total_len);
        if trimmed_len < total_len {
            icmpv4_bytes.truncate(trimmed_len - header.header_len());
            let checksum = l4::icmpv4_checksum_from_scratch(&icmpv4_bytes);
            let mut slice = match Icmpv4HeaderSliceMut::from_slice(&mut icmpv4_bytes) {
                Ok(slice) => slice,
                Err(_) => return Verdict::Drop(DropReason::ResourceExhaustion),
            };
            slice.set_checksum(checksum);
        }
        if clear_df {
            header.dont_fragment = false;
        }
        header.total_len = (header.header_len() + icmpv4_bytes.len()) as u16;
        header.header_checksum = header.calc_header_checksum();
    }

    let out = match assemble(header, &icmpv4_bytes) {
        Ok(out) => out,
        Err(reason) => return Verdict::Drop(reason),
    };

    Verdict::Continue(OutPacket::from_vec(out))
}
