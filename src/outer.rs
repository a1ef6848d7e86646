//! Builds the outer (or, via [`build`] reused with `is_inner = true`, the
//! ICMP-embedded inner) IPv4 header from the incoming IPv6 header plus the
//! synthesized flow.

use etherparse::{Ipv4Dscp, Ipv4Ecn, Ipv4FragOffset, Ipv4Header, Ipv4Options};

use crate::error::{DropReason, Icmpv6Error, Verdict};
use crate::ext_header::ChainSummary;
use crate::flow::FlowDescriptor;

/// The pieces of the incoming IPv6 header this step needs; lifted out of
/// `etherparse::Ipv6Header` so the function doesn't depend on a live
/// parse.
#[derive(Debug, Clone, Copy)]
pub struct Ipv6HeaderFields {
    pub hop_limit: u8,
    pub payload_length: u16,
}

/// Fragment-header fields, when the chain contained one.
#[derive(Debug, Clone, Copy)]
pub struct FragmentFields {
    pub identification_low16: u16,
    pub more_fragments: bool,
    pub fragment_offset: u16,
}

/// Builds the outer IPv4 header. `decrement_ttl` is false for the inner
/// (ICMP-embedded) datagram per §4.7: its TTL is copied unchanged and it is
/// not itself subject to the Hop-Limit/Segments-Left drop checks (the
/// caller only calls this with `decrement_ttl = false` after already having
/// applied those checks to the *outer* packet).
pub fn build(
    ipv6: Ipv6HeaderFields,
    chain: &ChainSummary,
    fragment: Option<FragmentFields>,
    flow: &FlowDescriptor,
    fresh_identification: impl FnOnce() -> u16,
    decrement_ttl: bool,
) -> Verdict<Ipv4Header> {
    if decrement_ttl {
        if ipv6.hop_limit <= 1 {
            return Verdict::DropIcmp(DropReason::Ttl, Icmpv6Error::TimeExceeded);
        }

        if let Some(ptr) = chain.has_nonzero_segments_left() {
            return Verdict::DropIcmp(
                DropReason::SegmentsLeft,
                Icmpv6Error::ParameterProblem {
                    pointer: ptr as u32,
                },
            );
        }
    }

    let time_to_live = if decrement_ttl {
        ipv6.hop_limit - 1
    } else {
        ipv6.hop_limit
    };

    // `ipv6.payload_length` covers everything after the fixed IPv6 header,
    // including any extension headers the chain walked through; IPv4 has no
    // equivalent of them, so they don't belong in `total_len` and must be
    // subtracted before it feeds the DF decision below.
    let total_len =
        ipv6.payload_length - chain.payload_offset as u16 + Ipv4Header::MIN_LEN_U16;

    let (identification, more_fragments, dont_fragment, fragment_offset) = match fragment {
        Some(f) => (
            f.identification_low16,
            f.more_fragments,
            false,
            Ipv4FragOffset::try_new(f.fragment_offset).unwrap_or(Ipv4FragOffset::ZERO),
        ),
        None => (
            fresh_identification(),
            false,
            total_len > 1260,
            Ipv4FragOffset::ZERO,
        ),
    };

    let mut header = Ipv4Header {
        dscp: Ipv4Dscp::try_new(flow.tos >> 2).unwrap_or(Ipv4Dscp::ZERO),
        ecn: Ipv4Ecn::try_new(flow.tos & 0b11).unwrap_or(Ipv4Ecn::default()),
        total_len,
        identification,
        more_fragments,
        dont_fragment,
        fragment_offset,
        time_to_live,
        protocol: flow.protocol,
        header_checksum: 0,
        source: flow.outer_src.octets(),
        destination: flow.outer_dst.octets(),
        options: Ipv4Options::default(),
    };

    header.header_checksum = header.calc_header_checksum();

    Verdict::Continue(header)
}
