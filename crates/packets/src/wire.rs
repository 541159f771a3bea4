//! ICMP Echo and IPv4 wire formats.
//!
//! Everything here is plain byte-slice work; no sockets. Datagram sockets
//! deliver bare ICMP messages, captures deliver Ethernet frames with the
//! IPv4 header still in front, so both entry points exist.

use pingmux_common::PingError;
use std::net::Ipv4Addr;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_HEADER_LEN: usize = 8;
/// Millisecond send timestamp embedded at the start of every payload.
pub const TIMESTAMP_LEN: usize = 8;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const ETH_HEADER_LEN: usize = 14;
pub const PROTOCOL_ICMP: u8 = 1;

const ETH_TYPE_IPV4: u16 = 0x0800;

/// RFC 1071 Internet checksum: one's-complement sum of big-endian 16-bit
/// words, an odd trailing byte padded with zero on the right, carries
/// folded back in, result inverted.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let Some(&tail) = chunks.remainder().first() {
        sum += (tail as u32) << 8;
    }
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds a complete ICMP Echo Request: header, the 64-bit little-endian
/// millisecond timestamp, then `extra_payload` zero bytes.
pub fn build_echo_request(id: u16, seq: u16, timestamp_ms: u64, extra_payload: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + TIMESTAMP_LEN + extra_payload];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    packet[8..16].copy_from_slice(&timestamp_ms.to_le_bytes());
    let checksum = checksum16(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// Correlation fields of an Echo Reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub id: u16,
    pub seq: u16,
}

/// Parses a bare ICMP message as an Echo Reply. Anything else, our own
/// requests looping back through a capture included, comes out as
/// [`PingError::PacketMismatch`].
pub fn parse_echo_reply(icmp: &[u8]) -> Result<EchoReply, PingError> {
    if icmp.len() < ICMP_HEADER_LEN {
        return Err(PingError::PacketTooShort {
            expected: ICMP_HEADER_LEN,
            actual: icmp.len(),
        });
    }
    if icmp[0] != ICMP_ECHO_REPLY || icmp[1] != 0 {
        return Err(PingError::PacketMismatch);
    }
    Ok(EchoReply {
        id: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// Fixed fields of an IPv4 header.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub header_len: usize,
    /// Datagram length from the header, clamped to the bytes actually
    /// captured.
    pub total_len: usize,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

pub fn parse_ipv4_header(buf: &[u8]) -> Result<Ipv4Header, PingError> {
    if buf.len() < IPV4_MIN_HEADER_LEN {
        return Err(PingError::PacketTooShort {
            expected: IPV4_MIN_HEADER_LEN,
            actual: buf.len(),
        });
    }
    if buf[0] >> 4 != 4 {
        return Err(PingError::PacketMismatch);
    }
    // IHL counts 32-bit words; options push the payload past 20 bytes.
    let header_len = ((buf[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(PingError::MalformedPacket(format!(
            "IPv4 header length {} below minimum",
            header_len
        )));
    }
    if buf.len() < header_len {
        return Err(PingError::PacketTooShort {
            expected: header_len,
            actual: buf.len(),
        });
    }
    let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    Ok(Ipv4Header {
        header_len,
        total_len: total_len.min(buf.len()),
        ttl: buf[8],
        protocol: buf[9],
        src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
    })
}

/// An Echo Reply lifted out of a raw IPv4 packet, TTL and source intact.
#[derive(Debug, Clone, Copy)]
pub struct CapturedReply {
    pub id: u16,
    pub seq: u16,
    pub ttl: u8,
    pub src: Ipv4Addr,
}

/// Parses a captured Ethernet frame down to an Echo Reply.
pub fn parse_reply_frame(frame: &[u8]) -> Result<CapturedReply, PingError> {
    if frame.len() < ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + ICMP_HEADER_LEN {
        return Err(PingError::PacketTooShort {
            expected: ETH_HEADER_LEN + IPV4_MIN_HEADER_LEN + ICMP_HEADER_LEN,
            actual: frame.len(),
        });
    }
    let eth_type = u16::from_be_bytes([frame[12], frame[13]]);
    if eth_type != ETH_TYPE_IPV4 {
        return Err(PingError::PacketMismatch);
    }
    parse_reply_packet(&frame[ETH_HEADER_LEN..])
}

/// Parses an IPv4 packet with no link header down to an Echo Reply.
pub fn parse_reply_packet(packet: &[u8]) -> Result<CapturedReply, PingError> {
    let ip = parse_ipv4_header(packet)?;
    if ip.protocol != PROTOCOL_ICMP {
        return Err(PingError::PacketMismatch);
    }
    if ip.total_len < ip.header_len + ICMP_HEADER_LEN {
        return Err(PingError::PacketTooShort {
            expected: ip.header_len + ICMP_HEADER_LEN,
            actual: ip.total_len,
        });
    }
    let reply = parse_echo_reply(&packet[ip.header_len..ip.total_len])?;
    Ok(CapturedReply {
        id: reply.id,
        seq: reply.seq,
        ttl: ip.ttl,
        src: ip.src,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_echo_reply(id: u16, seq: u16) -> Vec<u8> {
        let mut icmp = vec![0u8; ICMP_HEADER_LEN];
        icmp[4..6].copy_from_slice(&id.to_be_bytes());
        icmp[6..8].copy_from_slice(&seq.to_be_bytes());
        let checksum = checksum16(&icmp);
        icmp[2..4].copy_from_slice(&checksum.to_be_bytes());
        icmp
    }

    fn build_ipv4_packet(src: Ipv4Addr, ttl: u8, options: usize, payload: &[u8]) -> Vec<u8> {
        let header_len = IPV4_MIN_HEADER_LEN + options;
        let total_len = header_len + payload.len();
        let mut packet = vec![0u8; header_len];
        packet[0] = 0x40 | (header_len / 4) as u8;
        packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        packet[8] = ttl;
        packet[9] = PROTOCOL_ICMP;
        packet[12..16].copy_from_slice(&src.octets());
        packet[16..20].copy_from_slice(&Ipv4Addr::new(10, 0, 0, 2).octets());
        let checksum = checksum16(&packet);
        packet[10..12].copy_from_slice(&checksum.to_be_bytes());
        packet.extend_from_slice(payload);
        packet
    }

    fn wrap_frame(packet: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; ETH_HEADER_LEN];
        frame[12..14].copy_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
        frame.extend_from_slice(packet);
        frame
    }

    #[test]
    fn checksum_known_vectors() {
        // Word sum 0x0001 + 0xf203 + 0xf4f5 + 0xf6f7 folds to 0xddf2.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum16(&data), 0x220d);
        assert_eq!(checksum16(&[]), 0xffff);
        assert_eq!(checksum16(&[0u8; 8]), 0xffff);
    }

    #[test]
    fn checksum_pads_odd_tail_on_the_right() {
        // 0x0102 + 0x0300, not 0x0102 + 0x0003.
        assert_eq!(checksum16(&[0x01, 0x02, 0x03]), !0x0402);
    }

    #[test]
    fn checksum_over_checksummed_message_is_zero() {
        let packet = build_echo_request(0x1234, 7, 0xdead_beef, 11);
        assert_eq!(checksum16(&packet), 0);
    }

    #[test]
    fn echo_request_layout() {
        let packet = build_echo_request(0xabcd, 0x0102, 0x0102_0304_0506_0708, 0);
        assert_eq!(packet.len(), ICMP_HEADER_LEN + TIMESTAMP_LEN);
        assert_eq!(packet[0], ICMP_ECHO_REQUEST);
        assert_eq!(packet[1], 0);
        assert_eq!(&packet[4..6], &[0xab, 0xcd]);
        assert_eq!(&packet[6..8], &[0x01, 0x02]);
        assert_eq!(&packet[8..16], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn echo_request_extra_payload_is_zeroed() {
        let packet = build_echo_request(1, 1, 0, 32);
        assert_eq!(packet.len(), ICMP_HEADER_LEN + TIMESTAMP_LEN + 32);
        assert!(packet[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reply_parse_extracts_correlation_fields() {
        let icmp = build_echo_reply(0xbeef, 42);
        let reply = parse_echo_reply(&icmp).unwrap();
        assert_eq!(reply.id, 0xbeef);
        assert_eq!(reply.seq, 42);
    }

    #[test]
    fn own_request_is_a_mismatch_not_an_error() {
        let packet = build_echo_request(7, 7, 0, 0);
        assert!(matches!(
            parse_echo_reply(&packet),
            Err(PingError::PacketMismatch)
        ));
    }

    #[test]
    fn short_message_is_too_short() {
        assert!(matches!(
            parse_echo_reply(&[0u8; 4]),
            Err(PingError::PacketTooShort { expected: 8, actual: 4 })
        ));
    }

    #[test]
    fn frame_parse_keeps_ttl_and_source() {
        let src = Ipv4Addr::new(8, 8, 8, 8);
        let packet = build_ipv4_packet(src, 57, 0, &build_echo_reply(0x0102, 9));
        let captured = parse_reply_frame(&wrap_frame(&packet)).unwrap();
        assert_eq!(captured.id, 0x0102);
        assert_eq!(captured.seq, 9);
        assert_eq!(captured.ttl, 57);
        assert_eq!(captured.src, src);
    }

    #[test]
    fn frame_parse_skips_ip_options() {
        let src = Ipv4Addr::new(192, 0, 2, 1);
        let packet = build_ipv4_packet(src, 64, 4, &build_echo_reply(3, 4));
        let captured = parse_reply_frame(&wrap_frame(&packet)).unwrap();
        assert_eq!(captured.id, 3);
        assert_eq!(captured.seq, 4);
    }

    #[test]
    fn frame_parse_ignores_ethernet_padding() {
        // Short frames arrive padded to the Ethernet minimum; the IP
        // total length decides where the message ends.
        let packet = build_ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), 64, 0, &build_echo_reply(5, 6));
        let mut frame = wrap_frame(&packet);
        frame.resize(60, 0xee);
        let captured = parse_reply_frame(&frame).unwrap();
        assert_eq!(captured.seq, 6);
    }

    #[test]
    fn truncated_capture_still_parses_header_bytes() {
        let mut packet =
            build_ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), 64, 0, &build_echo_reply(5, 6));
        // Claim a longer datagram than the capture holds.
        packet[2..4].copy_from_slice(&500u16.to_be_bytes());
        let captured = parse_reply_packet(&packet).unwrap();
        assert_eq!(captured.id, 5);
    }

    #[test]
    fn non_ipv4_ethertype_is_a_mismatch() {
        let packet = build_ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), 64, 0, &build_echo_reply(1, 1));
        let mut frame = wrap_frame(&packet);
        frame[12..14].copy_from_slice(&0x86ddu16.to_be_bytes());
        assert!(matches!(
            parse_reply_frame(&frame),
            Err(PingError::PacketMismatch)
        ));
    }

    #[test]
    fn non_icmp_protocol_is_a_mismatch() {
        let mut packet =
            build_ipv4_packet(Ipv4Addr::new(10, 0, 0, 1), 64, 0, &build_echo_reply(1, 1));
        packet[9] = 17;
        assert!(matches!(
            parse_reply_packet(&packet),
            Err(PingError::PacketMismatch)
        ));
    }
}
