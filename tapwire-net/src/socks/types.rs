pub const SOCKS5_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
    UdpAssociate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddress {
    IpV4([u8; 4]),
    IpV6([u8; 16]),
    Domain(String),
}

impl SocksAddress {
    pub fn host(&self) -> String {
        match self {
            SocksAddress::IpV4(ip) => std::net::Ipv4Addr::from(*ip).to_string(),
            SocksAddress::IpV6(ip) => std::net::Ipv6Addr::from(*ip).to_string(),
            SocksAddress::Domain(domain) => domain.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksGreeting {
    pub methods: Vec<u8>,
}

impl SocksGreeting {
    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub command: SocksCommand,
    pub address: SocksAddress,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReply {
    Succeeded,
    GeneralFailure,
    ConnectionNotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl SocksReply {
    pub fn code(self) -> u8 {
        match self {
            SocksReply::Succeeded => 0x00,
            SocksReply::GeneralFailure => 0x01,
            SocksReply::ConnectionNotAllowed => 0x02,
            SocksReply::NetworkUnreachable => 0x03,
            SocksReply::HostUnreachable => 0x04,
            SocksReply::ConnectionRefused => 0x05,
            SocksReply::TtlExpired => 0x06,
            SocksReply::CommandNotSupported => 0x07,
            SocksReply::AddressTypeNotSupported => 0x08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksError {
    pub kind: SocksErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksErrorKind {
    InvalidVersion,
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
    UnexpectedEof,
}

impl std::fmt::Display for SocksError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "socks {:?} at offset {}", self.kind, self.offset)
    }
}

impl std::error::Error for SocksError {}
