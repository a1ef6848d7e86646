//! L4 translators: TCP/UDP header copy plus checksum fix-up, and the
//! ICMP-specific type/code/payload rewriting, extension-area adjustment,
//! and 576-byte trim from §4.8.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::checksum::{self, ChecksumMode};

/// Maximum size an ICMP error message may grow to after translation
/// (RFC 7915 §4.8 / the original's "meant to be conservative" constant).
pub const ICMP_ERROR_MAX_LEN: usize = 576;

/// The unit (in octets) ICMP extension-structure lengths are expressed in.
const EXTENSION_LENGTH_UNIT: usize = 8;

/// Recomputes a TCP/UDP checksum across the v6->v4 pseudo-header swap.
/// `old_l4_header`/`new_l4_header` should be empty slices unless ports
/// changed (NAT64 port rebinding), in which case they carry the 4 raw
/// port bytes before/after rewriting.
pub fn translate_l4_checksum(
    mode: ChecksumMode,
    checksum_field: u16,
    v6_src: Ipv6Addr,
    v6_dst: Ipv6Addr,
    v4_src: Ipv4Addr,
    v4_dst: Ipv4Addr,
    old_l4_header: &[u8],
    new_l4_header: &[u8],
    is_udp: bool,
) -> (ChecksumMode, u16) {
    match mode {
        ChecksumMode::Complete => {
            let mut new_checksum = checksum::incremental_update(
                checksum_field,
                v6_src,
                v6_dst,
                v4_src,
                v4_dst,
                old_l4_header,
                new_l4_header,
            );

            if is_udp {
                new_checksum = checksum::normalize_udp_zero(new_checksum);
            }

            (ChecksumMode::Complete, new_checksum)
        }
        ChecksumMode::Partial { offset } => {
            let new_partial = checksum::incremental_update_partial(
                checksum_field,
                v6_src,
                v6_dst,
                v4_src,
                v4_dst,
            );

            (ChecksumMode::Partial { offset }, new_partial)
        }
        ChecksumMode::Unnecessary => (ChecksumMode::Unnecessary, checksum_field),
    }
}

/// Computes an ICMPv4 error checksum from scratch (ICMPv4 carries no
/// pseudo-header).
pub fn icmpv4_checksum_from_scratch(header_and_payload: &[u8]) -> u16 {
    let mut acc = checksum::Accumulator::new();
    acc.add_bytes(header_and_payload);

    acc.finish()
}

/// What to do with an ICMP extension structure once the datagram is about
/// to be trimmed to [`ICMP_ERROR_MAX_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionAction {
    /// No extension area, or it still fits: leave it alone.
    Keep,
    /// Trimming would cut into the extension structure: remove it
    /// entirely rather than emit a truncated one.
    ForceRemove,
}

/// Decides the fate of an ICMP extension area given the datagram's current
/// total length and the length limit it is about to be trimmed to.
///
/// `icmp6_length` is the original ICMPv6 "length" field: a count, in
/// [`EXTENSION_LENGTH_UNIT`]-byte units, of how much of the payload is the
/// quoted original datagram (the remainder, if any, is the extension
/// structure).
pub fn adjust_extension_area(
    icmp6_length: Option<u8>,
    current_total_len: usize,
    max_pkt_len: usize,
) -> ExtensionAction {
    let Some(units) = icmp6_length else {
        return ExtensionAction::Keep;
    };

    let quoted_len = units as usize * EXTENSION_LENGTH_UNIT;

    if current_total_len <= max_pkt_len || quoted_len == 0 {
        ExtensionAction::Keep
    } else {
        ExtensionAction::ForceRemove
    }
}

/// Trims `total_len` to [`ICMP_ERROR_MAX_LEN`], reporting whether the DF
/// flag must now be cleared (it must, because a length at or under this
/// trim is always <= 1260).
pub fn trim_to_error_max(total_len: usize) -> (usize, bool) {
    if total_len <= ICMP_ERROR_MAX_LEN {
        (total_len, false)
    } else {
        (ICMP_ERROR_MAX_LEN, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_extension_area_when_it_fits() {
        let action = adjust_extension_area(Some(2), 500, 576);
        assert_eq!(action, ExtensionAction::Keep);
    }

    #[test]
    fn removes_extension_area_when_trim_would_cut_it() {
        let action = adjust_extension_area(Some(2), 700, 576);
        assert_eq!(action, ExtensionAction::ForceRemove);
    }

    #[test]
    fn trim_clears_df_only_when_actually_trimmed() {
        assert_eq!(trim_to_error_max(500), (500, false));
        assert_eq!(trim_to_error_max(700), (576, true));
    }
}
