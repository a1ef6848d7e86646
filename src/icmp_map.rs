//! ICMPv6 -> ICMPv4 type/code translation tables (RFC 7915 §4.2/§4.3) and
//! the Parameter-Problem pointer and Packet-Too-Big MTU computations they
//! depend on.

use etherparse::{icmpv4, icmpv6, Icmpv4Type, Icmpv6Type};

/// The outcome of mapping one ICMPv6 message to its ICMPv4 equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappedIcmp {
    /// A direct type/code (and, for errors, embedded-packet) translation
    /// exists.
    Translate(Icmpv4Type),
    /// The message has no IPv4 counterpart and must be dropped without a
    /// reply, per RFC 7915.
    Untranslatable,
}

/// Whether the mapped ICMPv4 message is an error that carries an
/// ICMP-embedded inner datagram needing recursive translation.
pub fn carries_inner_packet(ty: &Icmpv4Type) -> bool {
    !matches!(
        ty,
        Icmpv4Type::EchoRequest(_) | Icmpv4Type::EchoReply(_)
    )
}

/// Maps an ICMPv6 type/code to its RFC 7915 ICMPv4 equivalent. The MTU for
/// Packet-Too-Big and the pointer for Parameter-Problem are filled in by
/// the caller using [`compute_mtu4`] and [`param_problem_pointer`]
/// respectively; this function reports [`MappedIcmp::Untranslatable`] when
/// RFC 7915 calls for a silent drop instead.
pub fn translate_type_code(ty: Icmpv6Type) -> MappedIcmp {
    use MappedIcmp::*;

    match ty {
        Icmpv6Type::EchoRequest(h) => Translate(Icmpv4Type::EchoRequest(h)),
        Icmpv6Type::EchoReply(h) => Translate(Icmpv4Type::EchoReply(h)),

        Icmpv6Type::DestinationUnreachable(code) => match translate_dest_unreachable(code) {
            Some(h) => Translate(Icmpv4Type::DestinationUnreachable(h)),
            None => Untranslatable,
        },

        // Caller must still plug in the computed MTU; we return the shape
        // with a placeholder of 0 here and the caller overwrites it.
        Icmpv6Type::PacketTooBig { .. } => Translate(Icmpv4Type::DestinationUnreachable(
            icmpv4::DestUnreachableHeader::FragmentationNeeded { next_hop_mtu: 0 },
        )),

        Icmpv6Type::TimeExceeded(code) => match icmpv4::TimeExceededCode::from_u8(code.code_u8())
        {
            Some(code) => Translate(Icmpv4Type::TimeExceeded(code)),
            None => Untranslatable,
        },

        Icmpv6Type::ParameterProblem(pp) => translate_param_problem(pp.code),

        Icmpv6Type::Unknown { .. } => Untranslatable,
    }
}

fn translate_dest_unreachable(
    code: icmpv6::DestUnreachableCode,
) -> Option<icmpv4::DestUnreachableHeader> {
    use icmpv4::DestUnreachableHeader::*;
    use icmpv6::DestUnreachableCode::*;

    Some(match code {
        NoRoute => Host,
        Prohibited => HostProhibited,
        BeyondScope => Host,
        Address => Host,
        icmpv6::DestUnreachableCode::Port => icmpv4::DestUnreachableHeader::Port,
        SourceAddressFailedPolicy | RejectRoute => return None,
    })
}

fn translate_param_problem(code: icmpv6::ParameterProblemCode) -> MappedIcmp {
    use icmpv6::ParameterProblemCode::*;
    use MappedIcmp::*;

    match code {
        // Caller fills in the mapped pointer via `param_problem_pointer`.
        ErroneousHeaderField => Translate(Icmpv4Type::ParameterProblem(
            icmpv4::ParameterProblemHeader::PointerIndicatesError(0),
        )),
        UnrecognizedNextHeader => Translate(Icmpv4Type::DestinationUnreachable(
            icmpv4::DestUnreachableHeader::Protocol,
        )),
        UnrecognizedIpv6Option
        | Ipv6FirstFragmentIncompleteHeaderChain
        | SrUpperLayerHeaderError
        | UnrecognizedNextHeaderByIntermediateNode
        | ExtensionHeaderTooBig
        | ExtensionHeaderChainTooLong
        | TooManyExtensionHeaders
        | TooManyOptionsInExtensionHeader
        | OptionTooBig => Untranslatable,
    }
}

/// Outcome of remapping an ICMPv6 Parameter-Problem pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerMapping {
    Mapped(u8),
    Untranslatable,
}

/// Maps an ICMPv6 "erroneous header field" pointer (an offset into the
/// IPv6 header) to the equivalent ICMPv4 pointer, per RFC 7915 §4.3's
/// table.
pub fn param_problem_pointer(v6_pointer: u8) -> PointerMapping {
    use PointerMapping::*;

    match v6_pointer {
        0 => Mapped(0),
        1 => Mapped(1),
        2 | 3 => Untranslatable,
        4 | 5 => Mapped(2),
        6 => Mapped(9),
        7 => Mapped(8),
        8..=23 => Mapped(12),
        _ => Mapped(16),
    }
}

/// Computes the MTU to advertise in a translated Packet-Too-Big message:
/// `min(in_icmp.mtu - 20, route.mtu, in_dev.mtu - 20)`. Absent route/device
/// MTUs (e.g. in unit tests) are treated as unconstrained.
pub fn compute_mtu4(in_icmp_mtu: u32, route_mtu: Option<u32>, in_dev_mtu: Option<u32>) -> u32 {
    let from_icmp = in_icmp_mtu.saturating_sub(20);
    let from_route = route_mtu.unwrap_or(u32::MAX);
    let from_dev = in_dev_mtu.map(|m| m.saturating_sub(20)).unwrap_or(u32::MAX);

    from_icmp.min(from_route).min(from_dev)
}

/// The floor to advertise in ICMPv6 Packet-Too-Big when the *output* of
/// translation (not an embedded ICMP error) exceeds the route MTU: the
/// advertised MTU must cover the 20-byte header-size delta and never drop
/// below the IPv6 minimum MTU.
pub fn mtu6_advertisement_floor(route_mtu: u32) -> u32 {
    (route_mtu + 20).max(1280)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_table_matches_spec() {
        assert_eq!(param_problem_pointer(0), PointerMapping::Mapped(0));
        assert_eq!(param_problem_pointer(1), PointerMapping::Mapped(1));
        assert_eq!(param_problem_pointer(2), PointerMapping::Untranslatable);
        assert_eq!(param_problem_pointer(3), PointerMapping::Untranslatable);
        assert_eq!(param_problem_pointer(4), PointerMapping::Mapped(2));
        assert_eq!(param_problem_pointer(5), PointerMapping::Mapped(2));
        assert_eq!(param_problem_pointer(6), PointerMapping::Mapped(9));
        assert_eq!(param_problem_pointer(7), PointerMapping::Mapped(8));
        assert_eq!(param_problem_pointer(8), PointerMapping::Mapped(12));
        assert_eq!(param_problem_pointer(23), PointerMapping::Mapped(12));
        assert_eq!(param_problem_pointer(24), PointerMapping::Mapped(16));
        assert_eq!(param_problem_pointer(255), PointerMapping::Mapped(16));
    }

    #[test]
    fn mtu_is_minimum_of_three_sources() {
        assert_eq!(compute_mtu4(1400, Some(1500), Some(1500)), 1380);
        assert_eq!(compute_mtu4(1400, None, None), 1380);
        assert_eq!(compute_mtu4(9000, Some(1500), Some(1500)), 1480);
    }

    #[test]
    fn advertisement_floor_respects_1280_minimum() {
        assert_eq!(mtu6_advertisement_floor(1500), 1520);
        assert_eq!(mtu6_advertisement_floor(100), 1280);
    }

    #[test]
    fn echo_messages_do_not_carry_inner_packet() {
        assert!(!carries_inner_packet(&Icmpv4Type::EchoRequest(
            etherparse::IcmpEchoHeader { id: 0, seq: 0 }
        )));
        assert!(carries_inner_packet(&Icmpv4Type::DestinationUnreachable(
            icmpv4::DestUnreachableHeader::Host
        )));
    }
}
