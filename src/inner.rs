//! The inner (ICMP-embedded) IPv4 header, reusing the outer translator's
//! field-fill logic per §4.7: same fields as the outer header except the
//! TTL is copied unchanged and there is no Hop-Limit or Segments-Left
//! check, because the inner datagram is data being quoted, not a packet
//! this translator is itself forwarding.

use etherparse::Ipv4Header;

use crate::error::Verdict;
use crate::flow::FlowDescriptor;
use crate::outer::{self, FragmentFields, Ipv6HeaderFields};

pub fn build(
    ipv6: Ipv6HeaderFields,
    fragment: Option<FragmentFields>,
    flow: &FlowDescriptor,
    fresh_identification: impl FnOnce() -> u16,
) -> Ipv4Header {
    let chain = crate::ext_header::ChainSummary {
        final_next_header: flow.protocol,
        fragment_header_offset: None,
        segments_left: None,
        payload_offset: 0,
    };

    match outer::build(ipv6, &chain, fragment, flow, fresh_identification, false) {
        Verdict::Continue(header) => header,
        // `decrement_ttl = false` means the TTL/Segments-Left drop checks
        // inside `outer::build` are unreachable.
        _ => unreachable!("inner header construction never drops"),
    }
}
