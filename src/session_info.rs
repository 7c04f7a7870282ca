use std::net::{Ipv4Addr, SocketAddrV4};

#[derive(Hash, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug, Default)]
pub enum IpProtocol {
    Icmp,
    #[default]
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;

    pub fn number(&self) -> u8 {
        match self {
            IpProtocol::Icmp => Self::ICMP,
            IpProtocol::Tcp => Self::TCP,
            IpProtocol::Udp => Self::UDP,
            IpProtocol::Other(v) => *v,
        }
    }
}

impl From<u8> for IpProtocol {
    fn from(value: u8) -> Self {
        match value {
            Self::ICMP => IpProtocol::Icmp,
            Self::TCP => IpProtocol::Tcp,
            Self::UDP => IpProtocol::Udp,
            v => IpProtocol::Other(v),
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Other(v) => write!(f, "Protocol {}", v),
        }
    }
}

/// The identity of one flow as seen on the virtual interface.
#[derive(Hash, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Debug)]
pub struct SessionInfo {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub protocol: IpProtocol,
}

impl Default for SessionInfo {
    fn default() -> Self {
        let src = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let dst = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self::new(src, dst, IpProtocol::Tcp)
    }
}

impl SessionInfo {
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, protocol: IpProtocol) -> Self {
        Self { src, dst, protocol }
    }

    /// Canonical lookup key, `"srcIP:srcPort->dstIP:dstPort"`.
    pub fn connection_key(&self) -> String {
        connection_key(self.src, self.dst)
    }
}

pub fn connection_key(src: SocketAddrV4, dst: SocketAddrV4) -> String {
    format!("{}:{}->{}:{}", src.ip(), src.port(), dst.ip(), dst.port())
}

impl std::fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src, self.dst)
    }
}
