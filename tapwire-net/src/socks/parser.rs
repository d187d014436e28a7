use super::types::{
    SOCKS5_VERSION, SocksAddress, SocksCommand, SocksError, SocksErrorKind, SocksGreeting,
    SocksRequest,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksParseStatus<T> {
    NeedMore,
    Complete { message: T, consumed: usize },
    Error { error: SocksError },
}

fn need_more<T>(error: SocksError) -> SocksParseStatus<T> {
    match error.kind {
        SocksErrorKind::UnexpectedEof => SocksParseStatus::NeedMore,
        _ => SocksParseStatus::Error { error },
    }
}

fn eof(offset: usize) -> SocksError {
    SocksError {
        kind: SocksErrorKind::UnexpectedEof,
        offset,
    }
}

/// Client greeting: `VER NMETHODS METHODS...`.
pub fn parse_greeting(bytes: &[u8]) -> SocksParseStatus<SocksGreeting> {
    match try_parse_greeting(bytes) {
        Ok((message, consumed)) => SocksParseStatus::Complete { message, consumed },
        Err(error) => need_more(error),
    }
}

fn try_parse_greeting(bytes: &[u8]) -> Result<(SocksGreeting, usize), SocksError> {
    if bytes.len() < 2 {
        return Err(eof(bytes.len()));
    }
    if bytes[0] != SOCKS5_VERSION {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidVersion,
            offset: 0,
        });
    }
    let count = bytes[1] as usize;
    if bytes.len() < 2 + count {
        return Err(eof(bytes.len()));
    }
    Ok((
        SocksGreeting {
            methods: bytes[2..2 + count].to_vec(),
        },
        2 + count,
    ))
}

/// Client request: `VER CMD RSV ATYP DST.ADDR DST.PORT`.
pub fn parse_request(bytes: &[u8]) -> SocksParseStatus<SocksRequest> {
    match try_parse_request(bytes) {
        Ok((message, consumed)) => SocksParseStatus::Complete { message, consumed },
        Err(error) => need_more(error),
    }
}

fn try_parse_request(bytes: &[u8]) -> Result<(SocksRequest, usize), SocksError> {
    if bytes.len() < 4 {
        return Err(eof(bytes.len()));
    }
    if bytes[0] != SOCKS5_VERSION {
        return Err(SocksError {
            kind: SocksErrorKind::InvalidVersion,
            offset: 0,
        });
    }
    let command = match bytes[1] {
        0x01 => SocksCommand::Connect,
        0x02 => SocksCommand::Bind,
        0x03 => SocksCommand::UdpAssociate,
        other => {
            return Err(SocksError {
                kind: SocksErrorKind::UnsupportedCommand(other),
                offset: 1,
            });
        }
    };

    let mut cursor = 4;
    let address = match bytes[3] {
        0x01 => {
            if bytes.len() < cursor + 4 {
                return Err(eof(bytes.len()));
            }
            let mut ip = [0u8; 4];
            ip.copy_from_slice(&bytes[cursor..cursor + 4]);
            cursor += 4;
            SocksAddress::IpV4(ip)
        }
        0x03 => {
            if bytes.len() < cursor + 1 {
                return Err(eof(bytes.len()));
            }
            let len = bytes[cursor] as usize;
            cursor += 1;
            if bytes.len() < cursor + len {
                return Err(eof(bytes.len()));
            }
            let domain = String::from_utf8_lossy(&bytes[cursor..cursor + len]).to_string();
            cursor += len;
            SocksAddress::Domain(domain)
        }
        0x04 => {
            if bytes.len() < cursor + 16 {
                return Err(eof(bytes.len()));
            }
            let mut ip = [0u8; 16];
            ip.copy_from_slice(&bytes[cursor..cursor + 16]);
            cursor += 16;
            SocksAddress::IpV6(ip)
        }
        other => {
            return Err(SocksError {
                kind: SocksErrorKind::UnsupportedAddressType(other),
                offset: 3,
            });
        }
    };

    if bytes.len() < cursor + 2 {
        return Err(eof(bytes.len()));
    }
    let port = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
    cursor += 2;

    Ok((
        SocksRequest {
            command,
            address,
            port,
        },
        cursor,
    ))
}
