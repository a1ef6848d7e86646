//! Verdicts and drop reasons for the 6->4 translation pipeline.
//!
//! Every step returns a [`Verdict`] rather than a bare `Result`: callers
//! must handle "continue", "drop", "drop with an ICMPv6 reply", and
//! "untranslatable, pass to the host stack" as four distinct outcomes, not
//! a success/failure binary.

use std::fmt;

/// Coarse drop-reason kinds. Not type names — a stats backend keys its
/// counters off these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Bad extension-header chain, hop-limit already exhausted.
    Ttl,
    /// Non-zero Segments-Left in a Routing header.
    SegmentsLeft,
    /// Malformed input that isn't one of the two cases above.
    MalformedInput,
    /// ICMP type/code or Parameter-Problem pointer has no IPv4 counterpart.
    UnsupportedMap,
    /// No pool4 mapping, no pool6791 masking address, or an untranslatable
    /// source in an ICMP error.
    AddressingFailure,
    /// The routing service returned no route and the packet is not a
    /// hairpin.
    RoutingFailure,
    /// Buffer allocation or checksum validation failed.
    ResourceExhaustion,
    /// The packet (or a later fragment) exceeds the route MTU.
    SizeFailure,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::Ttl => "hop-limit exhausted",
            DropReason::SegmentsLeft => "non-zero segments-left",
            DropReason::MalformedInput => "malformed input",
            DropReason::UnsupportedMap => "no ICMPv4 counterpart",
            DropReason::AddressingFailure => "addressing failure",
            DropReason::RoutingFailure => "no route to destination",
            DropReason::ResourceExhaustion => "resource exhaustion",
            DropReason::SizeFailure => "packet exceeds route MTU",
        };
        f.write_str(s)
    }
}

/// The ICMPv6 error a `DropIcmp` verdict asks the caller to send back to
/// the original source, alongside the reason it was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Icmpv6Error {
    /// Type 3, Code 0 (Hop-Limit Exceeded).
    TimeExceeded,
    /// Type 4, Code 0 (Erroneous header field), carrying the byte offset of
    /// the offending field.
    ParameterProblem { pointer: u32 },
    /// Type 2, Code 0 (Packet Too Big), carrying the MTU to advertise.
    PacketTooBig { mtu: u32 },
}

/// The result of a 6->4 translation attempt.
#[derive(Debug)]
pub enum Verdict<T> {
    /// Translation succeeded; forward `packet_out`.
    Continue(T),
    /// Drop the packet silently.
    Drop(DropReason),
    /// Drop the packet and reply to the source with an ICMPv6 error.
    DropIcmp(DropReason, Icmpv6Error),
    /// The packet has no translation but isn't an error: surface it to the
    /// host stack (e.g. it's addressed to the translator itself).
    Untranslatable(DropReason),
}

impl<T> Verdict<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Verdict<U> {
        match self {
            Verdict::Continue(t) => Verdict::Continue(f(t)),
            Verdict::Drop(r) => Verdict::Drop(r),
            Verdict::DropIcmp(r, e) => Verdict::DropIcmp(r, e),
            Verdict::Untranslatable(r) => Verdict::Untranslatable(r),
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, Verdict::Continue(_))
    }
}

/// Errors surfaced by the buffer/header-parsing helpers; these are
/// internal plumbing failures the hot path turns into `Verdict::Drop`
/// before they ever reach a caller.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("buffer is not a valid IPv6 packet")]
    InvalidIpv6,
    #[error("buffer is not a valid IPv4 packet")]
    InvalidIpv4,
    #[error("ICMPv6 payload is not large enough to contain a header")]
    TruncatedIcmpv6,
    #[error(transparent)]
    Etherparse(#[from] etherparse::err::LenError),
}

/// Registry-level failures, distinct from per-packet drop reasons.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an instance named {0:?} already exists in this namespace")]
    NameCollision(String),
    #[error("a Netfilter-framework instance already exists in this namespace")]
    NetfilterCollision,
    #[error("instance name must be non-empty, at most 15 bytes, and printable")]
    InvalidName,
    #[error("no instance found for the given (namespace, framework, name)")]
    NotFound,
}
