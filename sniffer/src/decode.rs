use crate::pcap::LinkType;

/// TCP segment view into a captured packet.
#[derive(Debug, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub payload: &'a [u8],
}

/// Walk the link, network, and transport headers of a captured packet down
/// to its TCP payload. Malformed or non-TCP packets yield `None`; empty
/// payloads (pure ACKs, handshakes) are dropped too.
pub fn decode_segment(link_type: LinkType, data: &[u8]) -> Option<TcpSegment<'_>> {
    let ip = match link_type {
        LinkType::Null => {
            // 4-byte address-family prefix.
            if data.len() < 4 {
                return None;
            }
            &data[4..]
        }
        LinkType::Ethernet => {
            if data.len() < 14 {
                return None;
            }
            &data[14..]
        }
        LinkType::Other(_) => return None,
    };

    if ip.is_empty() {
        return None;
    }
    let version = ip[0] >> 4;
    let tcp = match version {
        4 => {
            if ip.len() < 20 {
                return None;
            }
            let header_len = usize::from(ip[0] & 0x0f) * 4;
            if header_len < 20 || ip.len() < header_len {
                return None;
            }
            if ip[9] != 6 {
                return None;
            }
            &ip[header_len..]
        }
        6 => {
            if ip.len() < 40 {
                return None;
            }
            if ip[6] != 6 {
                return None;
            }
            &ip[40..]
        }
        _ => return None,
    };

    if tcp.len() < 20 {
        return None;
    }
    let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
    let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
    let header_len = usize::from(tcp[12] >> 4) * 4;
    if header_len < 20 || tcp.len() <= header_len {
        return None;
    }
    let flags = tcp[13];
    let payload = &tcp[header_len..];

    Some(TcpSegment {
        src_port,
        dst_port,
        flags,
        payload,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    /// A NULL-link loopback packet: AF_INET prefix, minimal IPv4 + TCP
    /// headers, then the payload.
    pub fn loopback_packet(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();
        packet.extend_from_slice(&2u32.to_le_bytes()); // AF_INET

        let total_len = 20 + 20 + payload.len();
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45; // version 4, IHL 5
        ip[2] = (total_len >> 8) as u8;
        ip[3] = (total_len & 0xff) as u8;
        ip[8] = 64; // TTL
        ip[9] = 6; // TCP
        ip[12..16].copy_from_slice(&[127, 0, 0, 1]);
        ip[16..20].copy_from_slice(&[127, 0, 0, 1]);
        packet.extend_from_slice(&ip);

        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 0x50; // data offset 5
        tcp[13] = 0x18; // PSH|ACK
        packet.extend_from_slice(&tcp);

        packet.extend_from_slice(payload);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_ipv4_loopback_payload() {
        let packet = test_support::loopback_packet(50000, 55123, b"hello");
        let segment = decode_segment(LinkType::Null, &packet).unwrap();
        assert_eq!(segment.src_port, 50000);
        assert_eq!(segment.dst_port, 55123);
        assert_eq!(segment.payload, b"hello");
    }

    #[test]
    fn decodes_ipv6_fixed_header() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&30u32.to_le_bytes()); // AF_INET6 (macOS)
        let mut ip6 = vec![0u8; 40];
        ip6[0] = 0x60;
        ip6[6] = 6; // next header: TCP
        packet.extend_from_slice(&ip6);
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&4000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&5000u16.to_be_bytes());
        tcp[12] = 0x50;
        packet.extend_from_slice(&tcp);
        packet.extend_from_slice(b"x");

        let segment = decode_segment(LinkType::Null, &packet).unwrap();
        assert_eq!(segment.dst_port, 5000);
        assert_eq!(segment.payload, b"x");
    }

    #[test]
    fn drops_non_tcp_and_empty_payloads() {
        // UDP protocol byte.
        let mut udp = test_support::loopback_packet(1, 2, b"payload");
        udp[4 + 9] = 17;
        assert_eq!(decode_segment(LinkType::Null, &udp), None);

        // Pure ACK: no payload.
        let ack = test_support::loopback_packet(1, 2, b"");
        assert_eq!(decode_segment(LinkType::Null, &ack), None);

        // Truncated packet.
        assert_eq!(decode_segment(LinkType::Null, &[0, 0]), None);

        // Unknown link type.
        let packet = test_support::loopback_packet(1, 2, b"data");
        assert_eq!(decode_segment(LinkType::Other(113), &packet), None);
    }

    #[test]
    fn ethernet_framing_skips_fourteen_bytes() {
        let loopback = test_support::loopback_packet(7, 8, b"eth");
        // Swap the 4-byte AF prefix for a 14-byte Ethernet header.
        let mut packet = vec![0u8; 14];
        packet[12] = 0x08; // EtherType IPv4
        packet.extend_from_slice(&loopback[4..]);

        let segment = decode_segment(LinkType::Ethernet, &packet).unwrap();
        assert_eq!(segment.payload, b"eth");
    }
}
