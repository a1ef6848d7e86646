//! Walks the IPv6 extension-header chain to find the final upper-layer
//! protocol and to detect a non-zero Segments-Left field in a Routing
//! header, per RFC 7915 §5.1.

use etherparse::IpNumber;

const HOP_BY_HOP: u8 = IpNumber::IPV6_HEADER_HOP_BY_HOP.0;
const ROUTING: u8 = IpNumber::IPV6_ROUTE_HEADER.0;
const FRAGMENT: u8 = IpNumber::IPV6_FRAGMENTATION_HEADER.0;
const DEST_OPTS: u8 = IpNumber::IPV6_DESTINATION_OPTIONS.0;

/// Outcome of walking the extension-header chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    /// The first next-header value that is not one of Hop-by-Hop, Routing,
    /// Fragment, or Destination Options, i.e. the upper-layer protocol.
    pub final_next_header: IpNumber,
    /// Present iff a Fragment header was found.
    pub fragment_header_offset: Option<usize>,
    /// `(byte offset of the Segments-Left field, its value)`, present iff a
    /// Routing header was found.
    pub segments_left: Option<(usize, u8)>,
    /// Byte offset, relative to the start of the payload passed to
    /// [`walk`], of the upper-layer header (i.e. the first byte after the
    /// last recognized extension header).
    pub payload_offset: usize,
}

/// Walks `payload` (the bytes immediately following the fixed 40-byte IPv6
/// header) given the IPv6 header's own `next_header` value. Offsets in the
/// returned [`ChainSummary`] are relative to the start of the IPv6 header
/// (i.e. `40 + offset_into_payload`).
pub fn walk(first_next_header: IpNumber, payload: &[u8]) -> ChainSummary {
    let mut next_header = first_next_header;
    let mut offset = 0usize;
    let mut fragment_header_offset = None;
    let mut segments_left = None;

    loop {
        match next_header.0 {
            HOP_BY_HOP | DEST_OPTS => {
                let Some(&[next, hdr_ext_len]) = payload.get(offset..offset + 2) else {
                    break;
                };

                next_header = IpNumber(next);
                offset += (hdr_ext_len as usize + 1) * 8;
            }
            ROUTING => {
                let Some(&[next, hdr_ext_len, _routing_type, sl]) =
                    payload.get(offset..offset + 4)
                else {
                    break;
                };

                segments_left = Some((40 + offset + 3, sl));
                next_header = IpNumber(next);
                offset += (hdr_ext_len as usize + 1) * 8;
            }
            FRAGMENT => {
                let Some(&[next, _reserved]) = payload.get(offset..offset + 2) else {
                    break;
                };

                fragment_header_offset = Some(40 + offset);
                next_header = IpNumber(next);
                offset += 8; // Fragment header has a fixed length.
            }
            _ => break,
        }
    }

    ChainSummary {
        final_next_header: next_header,
        fragment_header_offset,
        segments_left,
        payload_offset: offset,
    }
}

impl ChainSummary {
    /// Per RFC 7915 §5.1: if a Routing header is present and its
    /// Segments-Left is non-zero, the packet must not be translated.
    /// Returns the byte offset to report as the ICMPv4 Parameter-Problem
    /// pointer.
    pub fn has_nonzero_segments_left(&self) -> Option<usize> {
        let (offset, sl) = self.segments_left?;

        (sl > 0).then_some(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_extensions_reports_upper_layer_directly() {
        let summary = walk(IpNumber::TCP, &[]);

        assert_eq!(summary.final_next_header, IpNumber::TCP);
        assert!(summary.segments_left.is_none());
    }

    #[test]
    fn routing_header_reports_segments_left_offset() {
        // next=UDP, hdr_ext_len=0, routing_type=0, segments_left=3
        let payload = [IpNumber::UDP.0, 0, 0, 3, 0, 0, 0, 0];

        let summary = walk(IpNumber::IPV6_ROUTE_HEADER, &payload);

        assert_eq!(summary.final_next_header, IpNumber::UDP);
        assert_eq!(summary.has_nonzero_segments_left(), Some(43));
    }

    #[test]
    fn zero_segments_left_does_not_block_translation() {
        let payload = [IpNumber::UDP.0, 0, 0, 0, 0, 0, 0, 0];

        let summary = walk(IpNumber::IPV6_ROUTE_HEADER, &payload);

        assert!(summary.has_nonzero_segments_left().is_none());
    }

    #[test]
    fn icmpv6_next_header_is_final() {
        let summary = walk(IpNumber::IPV6_ICMP, &[]);

        assert_eq!(summary.final_next_header, IpNumber::IPV6_ICMP);
    }
}
