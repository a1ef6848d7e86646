//! One's-complement 16-bit checksum arithmetic for the 6->4 direction.
//!
//! Sums are accumulated as 32-bit values and folded to 16 bits only once, at
//! the end of a computation; this lets us add and subtract several
//! pseudo-header and header contributions without an intermediate fold
//! losing carry bits.

use std::net::{Ipv4Addr, Ipv6Addr};

/// How the checksum for an L4 payload is currently represented in the
/// buffer, mirroring the host packet-buffer service's three checksum
/// states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// The buffer carries a fully computed L4 checksum.
    Complete,
    /// The buffer carries only the pseudo-header contribution, stored at
    /// `offset` bytes into the L4 header; the stack completes it later.
    Partial { offset: usize },
    /// The checksum has already been validated (e.g. by hardware) and
    /// re-validation may be skipped.
    Unnecessary,
}

/// A 32-bit one's-complement accumulator.
#[derive(Debug, Default, Clone, Copy)]
pub struct Accumulator(u32);

impl Accumulator {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn add_u16(&mut self, word: u16) {
        self.0 += word as u32;
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);

        for chunk in &mut chunks {
            self.add_u16(u16::from_be_bytes([chunk[0], chunk[1]]));
        }

        if let [last] = *chunks.remainder() {
            self.add_u16(u16::from_be_bytes([last, 0]));
        }
    }

    pub fn sub_u16(&mut self, word: u16) {
        self.0 = self.0.wrapping_sub(word as u32);
    }

    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);

        for chunk in &mut chunks {
            self.sub_u16(u16::from_be_bytes([chunk[0], chunk[1]]));
        }

        if let [last] = *chunks.remainder() {
            self.sub_u16(u16::from_be_bytes([last, 0]));
        }
    }

    /// Folds the accumulator down to a 16-bit one's-complement sum.
    pub fn fold(mut self) -> u16 {
        while self.0 >> 16 != 0 {
            self.0 = (self.0 & 0xFFFF) + (self.0 >> 16);
        }

        self.0 as u16
    }

    /// Folds and complements, i.e. produces the checksum value that would
    /// be written into a header field.
    pub fn finish(self) -> u16 {
        !self.fold()
    }
}

/// The IPv6 pseudo-header contribution (RFC 8200 §8.1): source and
/// destination address words only. Payload length and next-header are
/// identical before and after translation, so they contribute the same
/// amount to both sides and cancel out of an incremental update; callers
/// computing a checksum from scratch must add them separately.
pub fn pseudo_header_v6(src: Ipv6Addr, dst: Ipv6Addr) -> Accumulator {
    let mut acc = Accumulator::new();
    acc.add_bytes(&src.octets());
    acc.add_bytes(&dst.octets());

    acc
}

/// The IPv4 pseudo-header contribution used for TCP/UDP: source and
/// destination address words, with the reserved byte and protocol
/// contributed separately (see [`pseudo_header_v4_full`] for the
/// from-scratch variant).
pub fn pseudo_header_v4(src: Ipv4Addr, dst: Ipv4Addr) -> Accumulator {
    let mut acc = Accumulator::new();
    acc.add_bytes(&src.octets());
    acc.add_bytes(&dst.octets());

    acc
}

/// The full IPv4 pseudo-header, including protocol and TCP/UDP length,
/// for computing an L4 checksum from scratch.
pub fn pseudo_header_v4_full(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4_len: u16) -> Accumulator {
    let mut acc = pseudo_header_v4(src, dst);
    acc.add_u16(protocol as u16);
    acc.add_u16(l4_len);

    acc
}

/// Incrementally rewrites a full L4 checksum computed over the IPv6 pseudo
/// header into one computed over the IPv4 pseudo header, optionally also
/// substituting changed header bytes (e.g. rebound ports).
///
/// `old_checksum` is the checksum currently stored in the packet (already
/// folded and complemented). Returns the new checksum to write; UDP's
/// zero-means-unchecksummed rule is the caller's responsibility, since this
/// function serves both TCP and UDP and only UDP has that convention.
pub fn incremental_update(
    old_checksum: u16,
    v6_src: Ipv6Addr,
    v6_dst: Ipv6Addr,
    v4_src: Ipv4Addr,
    v4_dst: Ipv4Addr,
    old_header_bytes: &[u8],
    new_header_bytes: &[u8],
) -> u16 {
    let mut acc = Accumulator::new();
    acc.add_u16(!old_checksum);
    acc.sub_bytes(&v6_src.octets());
    acc.sub_bytes(&v6_dst.octets());
    acc.sub_bytes(old_header_bytes);
    acc.add_bytes(&v4_src.octets());
    acc.add_bytes(&v4_dst.octets());
    acc.add_bytes(new_header_bytes);

    acc.finish()
}

/// Updates a *partial* (pseudo-header-only) checksum in place, substituting
/// the v4 pseudo-header contribution for the v6 one. The buffer's L4 bytes
/// are left untouched; the stack completes the sum later.
pub fn incremental_update_partial(
    old_partial: u16,
    v6_src: Ipv6Addr,
    v6_dst: Ipv6Addr,
    v4_src: Ipv4Addr,
    v4_dst: Ipv4Addr,
) -> u16 {
    let mut acc = Accumulator::new();
    acc.add_u16(old_partial);
    acc.sub_bytes(&v6_src.octets());
    acc.sub_bytes(&v6_dst.octets());
    acc.add_bytes(&v4_src.octets());
    acc.add_bytes(&v4_dst.octets());

    acc.fold()
}

/// UDP checksums of zero are reserved to mean "no checksum"; a genuine
/// all-ones fold must be written as `0xFFFF` instead.
pub fn normalize_udp_zero(checksum: u16) -> u16 {
    if checksum == 0 { 0xFFFF } else { checksum }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_carries_into_low_word() {
        let mut acc = Accumulator::new();
        acc.add_u16(0xFFFF);
        acc.add_u16(0x0001);

        assert_eq!(acc.fold(), 0x0001);
    }

    #[test]
    fn zero_checksum_normalizes_to_ffff() {
        assert_eq!(normalize_udp_zero(0x0000), 0xFFFF);
        assert_eq!(normalize_udp_zero(0x1234), 0x1234);
    }

    #[test]
    fn incremental_update_matches_from_scratch_recompute() {
        let v6_src: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let v6_dst: Ipv6Addr = "64:ff9b::c000:205".parse().unwrap();
        let v4_src = Ipv4Addr::new(198, 51, 100, 7);
        let v4_dst = Ipv4Addr::new(192, 0, 2, 5);

        let udp_header = [0x13, 0x88, 0x00, 0x50, 0x00, 0x08, 0x00, 0x00]; // ports 5000->80, len 8, csum 0
        let payload: &[u8] = b"";

        let mut from_scratch_v6 = pseudo_header_v6(v6_src, v6_dst);
        from_scratch_v6.add_u16(8); // udp length
        from_scratch_v6.add_u16(17); // next header = UDP
        from_scratch_v6.add_bytes(&udp_header);
        from_scratch_v6.add_bytes(payload);
        let old_checksum = from_scratch_v6.finish();

        let new_checksum = incremental_update(
            old_checksum,
            v6_src,
            v6_dst,
            v4_src,
            v4_dst,
            &[],
            &[],
        );

        let mut from_scratch_v4 = pseudo_header_v4_full(v4_src, v4_dst, 17, 8);
        from_scratch_v4.add_bytes(&udp_header);
        from_scratch_v4.add_bytes(payload);
        let expected = from_scratch_v4.finish();

        assert_eq!(new_checksum, expected);
    }
}
