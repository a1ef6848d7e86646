//! Property tests for the bit/prefix round-trip and checksum-fold
//! invariants named in the testable-properties list: `set_bits` inverts
//! `get_bits`, a prefix always contains the address it was built from (and
//! two prefixes sharing that address therefore intersect), and an
//! incremental v6->v4 pseudo-header substitution always matches a
//! from-scratch recomputation.

use std::net::{Ipv4Addr, Ipv6Addr};

use proptest::collection::vec;
use proptest::prelude::any;

use crate::address::{self, Prefix4};
use crate::checksum;

#[test_strategy::proptest]
fn bit_round_trip(
    #[strategy(any::<[u8; 4]>())] mut octets: [u8; 4],
    #[strategy(0u32..32)] offset: u32,
    #[strategy(1u32..33)] raw_len: u32,
    #[strategy(any::<u64>())] raw_value: u64,
) {
    let len = raw_len.min(32 - offset).max(1);
    let mask = (1u64 << len) - 1;
    let value = raw_value & mask;

    address::set_bits(&mut octets, offset, len, value);

    assert_eq!(address::get_bits(&octets, offset, len), value);
}

#[test_strategy::proptest]
fn prefix_always_contains_its_own_address(
    #[strategy(any::<Ipv4Addr>())] addr: Ipv4Addr,
    #[strategy(0u8..=32)] len: u8,
) {
    let prefix = Prefix4::new(addr, len);

    assert!(prefix.contains(addr));
}

#[test_strategy::proptest]
fn prefixes_sharing_an_address_intersect(
    #[strategy(any::<Ipv4Addr>())] addr: Ipv4Addr,
    #[strategy(0u8..=32)] len_a: u8,
    #[strategy(0u8..=32)] len_b: u8,
) {
    let p = Prefix4::new(addr, len_a);
    let q = Prefix4::new(addr, len_b);

    assert!(p.contains(addr) && q.contains(addr));
    assert!(p.intersects(&q));
}

#[test_strategy::proptest]
fn incremental_checksum_matches_from_scratch_recompute(
    #[strategy(any::<Ipv6Addr>())] v6_src: Ipv6Addr,
    #[strategy(any::<Ipv6Addr>())] v6_dst: Ipv6Addr,
    #[strategy(any::<Ipv4Addr>())] v4_src: Ipv4Addr,
    #[strategy(any::<Ipv4Addr>())] v4_dst: Ipv4Addr,
    #[strategy(any::<u16>())] src_port: u16,
    #[strategy(any::<u16>())] dst_port: u16,
    #[strategy(vec(any::<u8>(), 0..64))] payload: Vec<u8>,
) {
    let udp_len = (8 + payload.len()) as u16;

    let mut header = Vec::new();
    header.extend_from_slice(&src_port.to_be_bytes());
    header.extend_from_slice(&dst_port.to_be_bytes());
    header.extend_from_slice(&udp_len.to_be_bytes());
    header.extend_from_slice(&[0, 0]); // checksum field, zeroed while summing

    let mut from_scratch_v6 = checksum::pseudo_header_v6(v6_src, v6_dst);
    from_scratch_v6.add_u16(udp_len);
    from_scratch_v6.add_u16(17); // next header = UDP
    from_scratch_v6.add_bytes(&header);
    from_scratch_v6.add_bytes(&payload);
    let old_checksum = from_scratch_v6.finish();

    let new_checksum =
        checksum::incremental_update(old_checksum, v6_src, v6_dst, v4_src, v4_dst, &[], &[]);

    let mut from_scratch_v4 = checksum::pseudo_header_v4_full(v4_src, v4_dst, 17, udp_len);
    from_scratch_v4.add_bytes(&header);
    from_scratch_v4.add_bytes(&payload);
    let expected = from_scratch_v4.finish();

    assert_eq!(new_checksum, expected);
}
