use super::types::{SOCKS5_VERSION, SocksAddress, SocksReply};

pub fn build_method_selection(method: u8) -> [u8; 2] {
    [SOCKS5_VERSION, method]
}

/// Server reply: `VER REP RSV ATYP BND.ADDR BND.PORT`.
pub fn build_reply(reply: SocksReply, bound: &SocksAddress, port: u16) -> Vec<u8> {
    let mut buf = vec![SOCKS5_VERSION, reply.code(), 0x00];
    encode_address(&mut buf, bound);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

fn encode_address(buf: &mut Vec<u8>, address: &SocksAddress) {
    match address {
        SocksAddress::IpV4(ip) => {
            buf.push(0x01);
            buf.extend_from_slice(ip);
        }
        SocksAddress::Domain(domain) => {
            let len = domain.len().min(u8::MAX as usize);
            buf.push(0x03);
            buf.push(len as u8);
            buf.extend_from_slice(&domain.as_bytes()[..len]);
        }
        SocksAddress::IpV6(ip) => {
            buf.push(0x04);
            buf.extend_from_slice(ip);
        }
    }
}
