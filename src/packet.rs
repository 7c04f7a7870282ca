use crate::session::Session;
use crate::session_info::{IpProtocol, SessionInfo, connection_key};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;
pub const DEFAULT_WINDOW: u16 = 65535;

pub struct TcpFlags;

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub const SYN_ACK: u8 = Self::SYN | Self::ACK;
    pub const PSH_ACK: u8 = Self::PSH | Self::ACK;
    pub const RST_ACK: u8 = Self::RST | Self::ACK;
    pub const FIN_ACK: u8 = Self::FIN | Self::ACK;
}

/// Renders flag bits as `"SYN+ACK"`, or `"NONE"` when no bit is set.
pub fn flags_string(flags: u8) -> String {
    const NAMES: [(u8, &str); 6] = [
        (TcpFlags::FIN, "FIN"),
        (TcpFlags::SYN, "SYN"),
        (TcpFlags::RST, "RST"),
        (TcpFlags::PSH, "PSH"),
        (TcpFlags::ACK, "ACK"),
        (TcpFlags::URG, "URG"),
    ];
    let names: Vec<&str> = NAMES.iter().filter(|(bit, _)| flags & bit != 0).map(|(_, name)| *name).collect();
    if names.is_empty() { "NONE".to_string() } else { names.join("+") }
}

/// Fields common to every IPv4 datagram, recomputed for each packet read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub protocol: IpProtocol,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub header_len: usize,
    pub total_len: usize,
}

impl PacketInfo {
    pub fn connection_key(&self) -> String {
        connection_key(self.src, self.dst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpPacketInfo {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub sequence_number: u32,
    pub ack_number: u32,
    pub flags: u8,
    pub ip_header_len: usize,
    pub tcp_header_len: usize,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl TcpPacketInfo {
    pub fn connection_key(&self) -> String {
        connection_key(self.src, self.dst)
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo::new(self.src, self.dst, IpProtocol::Tcp)
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.payload_offset..self.payload_offset + self.payload_len]
    }
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn read_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3])
}

/// Length of the datagram as declared by the header, clamped to the buffer.
fn datagram_end(packet: &[u8], header_len: usize) -> usize {
    let total_len = read_u16(packet, 2) as usize;
    if total_len >= header_len && total_len <= packet.len() {
        total_len
    } else {
        packet.len()
    }
}

pub fn parse_ip_packet(packet: &[u8]) -> Option<PacketInfo> {
    let first = *packet.first()?;
    let version = first >> 4;
    if version == 6 {
        log::trace!("IPv6 packet dropped");
        return None;
    }
    if packet.len() < IPV4_HEADER_LEN {
        log::trace!("Packet too short for IPv4 header: {} bytes", packet.len());
        return None;
    }
    let header_len = ((first & 0x0f) as usize) * 4;
    if version != 4 || header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        log::trace!("Invalid IPv4 packet: version={version}, header length={header_len}");
        return None;
    }

    let protocol = IpProtocol::from(packet[9]);
    let src_ip = read_ipv4(packet, 12);
    let dst_ip = read_ipv4(packet, 16);

    let (mut src_port, mut dst_port) = (0, 0);
    if matches!(protocol, IpProtocol::Tcp | IpProtocol::Udp) && packet.len() >= header_len + 4 {
        src_port = read_u16(packet, header_len);
        dst_port = read_u16(packet, header_len + 2);
    }

    Some(PacketInfo {
        protocol,
        src: SocketAddrV4::new(src_ip, src_port),
        dst: SocketAddrV4::new(dst_ip, dst_port),
        header_len,
        total_len: datagram_end(packet, header_len),
    })
}

pub fn parse_tcp_packet(packet: &[u8]) -> Option<TcpPacketInfo> {
    let ip = parse_ip_packet(packet)?;
    if ip.protocol != IpProtocol::Tcp {
        return None;
    }
    let start = ip.header_len;
    let end = ip.total_len;
    if end < start + TCP_HEADER_LEN {
        log::trace!("Truncated TCP header in {}", ip.connection_key());
        return None;
    }

    let offset_and_flags = read_u16(packet, start + 12);
    let tcp_header_len = ((offset_and_flags >> 12) as usize) * 4;
    if tcp_header_len < TCP_HEADER_LEN || start + tcp_header_len > end {
        log::trace!("Invalid TCP data offset {tcp_header_len} in {}", ip.connection_key());
        return None;
    }
    let payload_offset = start + tcp_header_len;

    Some(TcpPacketInfo {
        src: ip.src,
        dst: ip.dst,
        sequence_number: read_u32(packet, start + 4),
        ack_number: read_u32(packet, start + 8),
        flags: (offset_and_flags & 0x3f) as u8,
        ip_header_len: start,
        tcp_header_len,
        payload_offset,
        payload_len: end - payload_offset,
    })
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// RFC 791 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, segment_len: usize) -> u32 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = IpProtocol::TCP;
    pseudo[10..12].copy_from_slice(&(segment_len as u16).to_be_bytes());
    sum_words(0, &pseudo)
}

/// Checksum of a TCP segment (header and payload) under its IPv4 pseudo-header.
/// The checksum field of `segment` must be zero.
pub fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let sum = pseudo_header_sum(src, dst, segment.len());
    !fold(sum_words(sum, segment))
}

/// Checks both the IPv4 header checksum and the TCP checksum of a datagram.
pub fn verify_checksums(datagram: &[u8]) -> bool {
    let Some(info) = parse_tcp_packet(datagram) else {
        return false;
    };
    let header = &datagram[..info.ip_header_len];
    let segment = &datagram[info.ip_header_len..info.payload_offset + info.payload_len];
    let tcp_sum = pseudo_header_sum(*info.src.ip(), *info.dst.ip(), segment.len());
    fold(sum_words(0, header)) == 0xffff && fold(sum_words(tcp_sum, segment)) == 0xffff
}

pub fn build_tcp_packet(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    sequence_number: u32,
    ack_number: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let segment_len = TCP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + segment_len;
    let mut packet = vec![0u8; total_len];

    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = DEFAULT_TTL;
    packet[9] = IpProtocol::TCP;
    packet[12..16].copy_from_slice(&src.ip().octets());
    packet[16..20].copy_from_slice(&dst.ip().octets());
    let ip_checksum = checksum(&packet[..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let tcp = &mut packet[IPV4_HEADER_LEN..];
    tcp[0..2].copy_from_slice(&src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&sequence_number.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack_number.to_be_bytes());
    tcp[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&DEFAULT_WINDOW.to_be_bytes());
    tcp[TCP_HEADER_LEN..].copy_from_slice(payload);
    let tcp_sum = tcp_checksum(*src.ip(), *dst.ip(), tcp);
    tcp[16..18].copy_from_slice(&tcp_sum.to_be_bytes());

    packet
}

// Responses travel from the flow's destination back to its source.

pub fn syn_ack_packet(session: &Session) -> Vec<u8> {
    let info = session.info;
    build_tcp_packet(
        info.dst,
        info.src,
        session.local_sequence_number,
        session.last_ack_number,
        TcpFlags::SYN_ACK,
        &[],
    )
}

pub fn data_packet(session: &Session, payload: &[u8]) -> Vec<u8> {
    let info = session.info;
    build_tcp_packet(
        info.dst,
        info.src,
        session.remote_sequence_number,
        session.last_ack_number,
        TcpFlags::PSH_ACK,
        payload,
    )
}

pub fn ack_packet(session: &Session) -> Vec<u8> {
    let info = session.info;
    build_tcp_packet(
        info.dst,
        info.src,
        session.remote_sequence_number,
        session.last_ack_number,
        TcpFlags::ACK,
        &[],
    )
}

pub fn fin_ack_packet(session: &Session) -> Vec<u8> {
    let info = session.info;
    build_tcp_packet(
        info.dst,
        info.src,
        session.remote_sequence_number,
        session.last_ack_number,
        TcpFlags::FIN_ACK,
        &[],
    )
}

/// Reset aborting a flow whose SYN was already answered. It sits at the
/// sequence number the client expects next, so the client accepts it.
pub fn rst_packet(session: &Session) -> Vec<u8> {
    let info = session.info;
    build_tcp_packet(
        info.dst,
        info.src,
        session.local_sequence_number,
        session.last_ack_number,
        TcpFlags::RST_ACK,
        &[],
    )
}

/// Splits a chunk read from the interface into datagrams using the IPv4
/// total length field. Readers backed by a real tun device return exactly
/// one datagram per read; pipes may coalesce several.
pub fn split_datagrams(chunk: &[u8]) -> Vec<&[u8]> {
    let mut datagrams = Vec::new();
    let mut rest = chunk;
    while !rest.is_empty() {
        let len = match rest[0] >> 4 {
            4 if rest.len() >= IPV4_HEADER_LEN => read_u16(rest, 2) as usize,
            6 if rest.len() >= 40 => 40 + read_u16(rest, 4) as usize,
            _ => rest.len(),
        };
        let len = if len == 0 || len > rest.len() { rest.len() } else { len };
        let (datagram, tail) = rest.split_at(len);
        datagrams.push(datagram);
        rest = tail;
    }
    datagrams
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    fn syn(seq: u32) -> Vec<u8> {
        build_tcp_packet(addr("10.0.0.2:5000"), addr("93.184.216.34:443"), seq, 0, TcpFlags::SYN, &[])
    }

    #[test]
    fn checksum_matches_reference_header() {
        // Well-known example header from RFC 1071 discussions.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8, 0x00, 0x01, 0xc0,
            0xa8, 0x00, 0xc7,
        ];
        assert_eq!(checksum(&header), 0xb861);
    }

    #[test]
    fn checksum_pads_odd_length() {
        assert_eq!(checksum(&[0x01]), !0x0100);
        assert_eq!(checksum(&[0x01, 0x02, 0x03]), !(0x0102 + 0x0300));
    }

    #[test]
    fn built_packets_validate() {
        for payload in [&b""[..], b"a", b"hello world", &[0xffu8; 1461][..]] {
            let packet = build_tcp_packet(
                addr("93.184.216.34:443"),
                addr("10.0.0.2:5000"),
                0xfffffff0,
                7,
                TcpFlags::PSH_ACK,
                payload,
            );
            assert!(verify_checksums(&packet));
            // A summed header including its checksum folds to all ones.
            assert_eq!(checksum(&packet[..IPV4_HEADER_LEN]), 0);
        }
    }

    #[test]
    fn corrupted_packet_fails_validation() {
        let mut packet = build_tcp_packet(addr("1.2.3.4:80"), addr("10.0.0.2:4000"), 1, 2, TcpFlags::ACK, b"xyz");
        let last = packet.len() - 1;
        packet[last] ^= 0x55;
        assert!(!verify_checksums(&packet));
    }

    #[test]
    fn parses_synthesized_tcp_packet() {
        let packet = build_tcp_packet(addr("10.0.0.2:5000"), addr("93.184.216.34:443"), 1000, 55, TcpFlags::PSH_ACK, b"abcd");
        let info = parse_tcp_packet(&packet).unwrap();
        assert_eq!(info.connection_key(), "10.0.0.2:5000->93.184.216.34:443");
        assert_eq!(info.sequence_number, 1000);
        assert_eq!(info.ack_number, 55);
        assert_eq!(info.flags, TcpFlags::PSH_ACK);
        assert_eq!(info.tcp_header_len, 20);
        assert_eq!(info.payload_offset, 40);
        assert_eq!(info.payload(&packet), b"abcd");
    }

    #[test]
    fn drops_ipv6_and_garbage() {
        let mut v6 = vec![0u8; 60];
        v6[0] = 0x60;
        assert!(parse_ip_packet(&v6).is_none());
        assert!(parse_ip_packet(&[]).is_none());
        assert!(parse_ip_packet(&[0x45, 0, 0]).is_none());
        let mut bad_ihl = syn(1);
        bad_ihl[0] = 0x44;
        assert!(parse_ip_packet(&bad_ihl).is_none());
    }

    #[test]
    fn udp_is_not_tcp() {
        let mut packet = syn(1);
        packet[9] = IpProtocol::UDP;
        let ip = parse_ip_packet(&packet).unwrap();
        assert_eq!(ip.protocol, IpProtocol::Udp);
        assert_eq!(ip.src.port(), 5000);
        assert!(parse_tcp_packet(&packet).is_none());
    }

    #[test]
    fn rst_follows_syn_ack() {
        let store = crate::session::SessionStore::default();
        let info = parse_tcp_packet(&syn(41)).unwrap();
        let mut session = store
            .create_session(info.session_info(), tokio_util::sync::CancellationToken::new(), |s| {
                s.local_sequence_number = 7000;
                s.last_ack_number = 42;
            })
            .unwrap();
        let syn_ack = parse_tcp_packet(&syn_ack_packet(&session)).unwrap();
        session.local_sequence_number += 1;

        let rst = parse_tcp_packet(&rst_packet(&session)).unwrap();
        assert_eq!(rst.src, info.dst);
        assert_eq!(rst.dst, info.src);
        assert_eq!(rst.sequence_number, syn_ack.sequence_number + 1);
        assert_eq!(rst.ack_number, 42);
        assert_eq!(rst.flags, TcpFlags::RST_ACK);
    }

    #[test]
    fn flag_names() {
        assert_eq!(flags_string(TcpFlags::SYN_ACK), "SYN+ACK");
        assert_eq!(flags_string(0), "NONE");
        assert_eq!(flags_string(TcpFlags::RST_ACK), "RST+ACK");
    }

    #[test]
    fn splits_coalesced_datagrams() {
        let a = syn(1);
        let b = build_tcp_packet(addr("10.0.0.2:5001"), addr("1.1.1.1:80"), 9, 0, TcpFlags::ACK, b"data");
        let mut chunk = a.clone();
        chunk.extend_from_slice(&b);
        let parts = split_datagrams(&chunk);
        assert_eq!(parts, vec![&a[..], &b[..]]);
    }
}
