//! ICMPv4 echo codec built on pnet packet views.
//!
//! Outgoing probes are bare ICMP messages (the kernel prepends the IPv4
//! header). Inbound datagrams read from a raw socket still carry their IPv4
//! header, so [`parse`] expects one.

use std::net::Ipv4Addr;

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{self, EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::Packet;
use pnet::util;
use serde::Serialize;
use sonar_core::MAX_PACKET_SIZE;

use crate::error::{Error, Result};

/// Size of the fixed ICMP header (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;

const IPV4_MIN_HEADER_SIZE: usize = 20;

const PAYLOAD_PATTERN: &[u8] = b"SONAR-ARE-YOU-THERE-";

/// ICMP message kind, as far as probing cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IcmpKind {
    EchoReply,
    DestinationUnreachable,
    SourceQuench,
    Redirect,
    Echo,
    TimeExceeded,
    ParameterProblem,
    Other(u8),
}

impl IcmpKind {
    pub fn from_type(ty: u8) -> Self {
        match ty {
            0 => Self::EchoReply,
            3 => Self::DestinationUnreachable,
            4 => Self::SourceQuench,
            5 => Self::Redirect,
            8 => Self::Echo,
            11 => Self::TimeExceeded,
            12 => Self::ParameterProblem,
            other => Self::Other(other),
        }
    }

    pub fn type_number(self) -> u8 {
        match self {
            Self::EchoReply => 0,
            Self::DestinationUnreachable => 3,
            Self::SourceQuench => 4,
            Self::Redirect => 5,
            Self::Echo => 8,
            Self::TimeExceeded => 11,
            Self::ParameterProblem => 12,
            Self::Other(ty) => ty,
        }
    }

    /// Error messages that quote the header of the datagram that caused them
    fn quotes_datagram(self) -> bool {
        matches!(
            self,
            Self::DestinationUnreachable
                | Self::SourceQuench
                | Self::Redirect
                | Self::TimeExceeded
                | Self::ParameterProblem
        )
    }
}

/// Identifier and sequence number of the echo a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoId {
    pub identifier: u16,
    pub sequence: u16,
}

/// A decoded inbound ICMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: IcmpKind,
    pub code: u8,
    pub source: Ipv4Addr,
    pub ttl: u8,
    /// Length of the ICMP message, header included
    pub size: usize,
    /// For echo messages their own id/sequence, for error messages the id/sequence
    /// of the quoted echo request. `None` when the message refers to no echo.
    pub echo: Option<EchoId>,
}

/// Encode an echo request with a payload of `payload_size` bytes
pub fn encode_echo_request(identifier: u16, sequence: u16, payload_size: usize) -> Result<Vec<u8>> {
    if payload_size > MAX_PACKET_SIZE {
        return Err(Error::Codec(format!(
            "payload of {} bytes exceeds maximum of {}",
            payload_size, MAX_PACKET_SIZE
        )));
    }

    let payload: Vec<u8> = PAYLOAD_PATTERN
        .iter()
        .copied()
        .cycle()
        .take(payload_size)
        .collect();

    let mut buf = vec![0u8; ICMP_HEADER_SIZE + payload_size];
    {
        let mut req = MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| Error::Codec("buffer too small for echo request".to_string()))?;
        req.set_icmp_type(IcmpTypes::EchoRequest);
        req.set_icmp_code(echo_request::IcmpCodes::NoCode);
        req.set_identifier(identifier);
        req.set_sequence_number(sequence);
        req.set_payload(&payload);
        let checksum = util::checksum(req.packet(), 1);
        req.set_checksum(checksum);
    }
    Ok(buf)
}

/// Decode a datagram read from a raw ICMP socket (IPv4 header included)
pub fn parse(datagram: &[u8]) -> Result<Message> {
    let ip = Ipv4Packet::new(datagram)
        .ok_or_else(|| Error::Codec("truncated IPv4 header".to_string()))?;
    if ip.get_version() != 4 {
        return Err(Error::Codec(format!("IP version {}", ip.get_version())));
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return Err(Error::Codec("not an ICMP datagram".to_string()));
    }

    let header_len = usize::from(ip.get_header_length()) * 4;
    if header_len < IPV4_MIN_HEADER_SIZE || header_len + ICMP_HEADER_SIZE > datagram.len() {
        return Err(Error::Codec(format!(
            "bad header length {} for {} byte datagram",
            header_len,
            datagram.len()
        )));
    }

    let icmp_bytes = &datagram[header_len..];
    let icmp = IcmpPacket::new(icmp_bytes)
        .ok_or_else(|| Error::Codec("truncated ICMP header".to_string()))?;
    if util::checksum(icmp_bytes, 1) != icmp.get_checksum() {
        return Err(Error::Codec("ICMP checksum mismatch".to_string()));
    }

    let kind = IcmpKind::from_type(icmp.get_icmp_type().0);
    let echo = match kind {
        IcmpKind::EchoReply | IcmpKind::Echo => EchoReplyPacket::new(icmp_bytes).map(|echo| EchoId {
            identifier: echo.get_identifier(),
            sequence: echo.get_sequence_number(),
        }),
        kind if kind.quotes_datagram() => quoted_echo(&icmp_bytes[ICMP_HEADER_SIZE..]),
        _ => None,
    };

    Ok(Message {
        kind,
        code: icmp.get_icmp_code().0,
        source: ip.get_source(),
        ttl: ip.get_ttl(),
        size: icmp_bytes.len(),
        echo,
    })
}

/// Get the echo request quoted in the body of an ICMP error message
fn quoted_echo(quoted: &[u8]) -> Option<EchoId> {
    let ip = Ipv4Packet::new(quoted)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let header_len = usize::from(ip.get_header_length()) * 4;
    let nested = quoted.get(header_len..)?;
    let echo = EchoRequestPacket::new(nested)?;
    if echo.get_icmp_type() != IcmpTypes::EchoRequest {
        return None;
    }
    Some(EchoId {
        identifier: echo.get_identifier(),
        sequence: echo.get_sequence_number(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::Ipv4Addr;

    use pnet::packet::icmp::MutableIcmpPacket;
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::MutableIpv4Packet;
    use pnet::util;

    /// Prefix an ICMP message with a minimal IPv4 header
    pub fn wrap_ipv4(icmp: &[u8], source: Ipv4Addr, ttl: u8) -> Vec<u8> {
        let mut buf = vec![0u8; 20 + icmp.len()];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((20 + icmp.len()) as u16);
            ip.set_ttl(ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip.set_source(source);
            ip.set_destination(Ipv4Addr::new(10, 0, 0, 1));
        }
        buf[20..].copy_from_slice(icmp);
        buf
    }

    /// Rewrite the type/code of an ICMP message and fix its checksum
    pub fn retype(icmp: &mut [u8], ty: u8, code: u8) {
        icmp[0] = ty;
        icmp[1] = code;
        let checksum = util::checksum(icmp, 1);
        let mut packet = MutableIcmpPacket::new(icmp).unwrap();
        packet.set_checksum(checksum);
    }

    /// Build an echo reply the way a remote host answers `request`
    pub fn echo_reply(request: &[u8]) -> Vec<u8> {
        let mut reply = request.to_vec();
        retype(&mut reply, 0, 0);
        reply
    }

    /// Build an ICMP error message quoting `request` as sent inside an IPv4 datagram
    pub fn error_quoting(request: &[u8], ty: u8, code: u8) -> Vec<u8> {
        let quoted = wrap_ipv4(&request[..8], Ipv4Addr::new(10, 0, 0, 1), 64);
        let mut icmp = vec![0u8; 8];
        icmp.extend_from_slice(&quoted);
        retype(&mut icmp, ty, code);
        icmp
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 7);

    #[test]
    fn encodes_echo_request_header_and_payload() {
        let bytes = encode_echo_request(0x1234, 42, 32).unwrap();
        assert_eq!(bytes.len(), ICMP_HEADER_SIZE + 32);

        let req = EchoRequestPacket::new(&bytes).unwrap();
        assert_eq!(req.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!(req.get_identifier(), 0x1234);
        assert_eq!(req.get_sequence_number(), 42);
        assert_eq!(&req.payload()[..5], b"SONAR");
        assert_eq!(util::checksum(&bytes, 1), req.get_checksum());
    }

    #[test]
    fn empty_payload_is_allowed() {
        let bytes = encode_echo_request(1, 1, 0).unwrap();
        assert_eq!(bytes.len(), ICMP_HEADER_SIZE);
    }

    #[test]
    fn rejects_oversized_payload() {
        let result = encode_echo_request(1, 1, MAX_PACKET_SIZE + 1);
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn parses_echo_reply() {
        let request = encode_echo_request(7, 300, 16).unwrap();
        let datagram = wrap_ipv4(&echo_reply(&request), SOURCE, 57);

        let message = parse(&datagram).unwrap();
        assert_eq!(message.kind, IcmpKind::EchoReply);
        assert_eq!(message.source, SOURCE);
        assert_eq!(message.ttl, 57);
        assert_eq!(message.size, request.len());
        assert_eq!(
            message.echo,
            Some(EchoId {
                identifier: 7,
                sequence: 300
            })
        );
    }

    #[test]
    fn parses_quoted_echo_from_time_exceeded() {
        let request = encode_echo_request(7, 9, 16).unwrap();
        let datagram = wrap_ipv4(&error_quoting(&request, 11, 0), SOURCE, 250);

        let message = parse(&datagram).unwrap();
        assert_eq!(message.kind, IcmpKind::TimeExceeded);
        assert_eq!(
            message.echo,
            Some(EchoId {
                identifier: 7,
                sequence: 9
            })
        );
    }

    #[test]
    fn unknown_kind_carries_no_echo() {
        let mut icmp = vec![0u8; 12];
        retype(&mut icmp, 13, 0);
        let message = parse(&wrap_ipv4(&icmp, SOURCE, 64)).unwrap();
        assert_eq!(message.kind, IcmpKind::Other(13));
        assert_eq!(message.echo, None);
    }

    #[test]
    fn rejects_truncated_datagram() {
        assert!(matches!(parse(&[0x45, 0, 0]), Err(Error::Codec(_))));
    }

    #[test]
    fn rejects_bad_checksum() {
        let request = encode_echo_request(7, 1, 8).unwrap();
        let mut datagram = wrap_ipv4(&echo_reply(&request), SOURCE, 64);
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        match parse(&datagram) {
            Err(Error::Codec(msg)) => assert!(msg.contains("checksum")),
            other => panic!("Expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn kind_numbers_round_trip() {
        for ty in [0u8, 3, 4, 5, 8, 11, 12, 42] {
            assert_eq!(IcmpKind::from_type(ty).type_number(), ty);
        }
    }
}
