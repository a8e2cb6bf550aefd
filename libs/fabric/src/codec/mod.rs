//! Wire codec for ICMP echo probes

pub mod icmp;

pub use self::icmp::{encode_echo_request, parse, EchoId, IcmpKind, Message, ICMP_HEADER_SIZE};
