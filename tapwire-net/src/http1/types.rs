use super::body::BodyFraming;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
    pub raw_name: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            raw_name: name.clone(),
            name,
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: HttpVersion,
    pub status_code: u16,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
    Other(String),
}

impl HttpVersion {
    pub fn as_str(&self) -> &str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
            HttpVersion::Other(other) => other.as_str(),
        }
    }

    /// Version written on an HTTP/1.x wire. HTTP/2 heads travel as HTTP/1.1.
    pub fn wire_str(&self) -> &str {
        match self {
            HttpVersion::Http2 => "HTTP/1.1",
            other => other.as_str(),
        }
    }
}

/// Ordered, multi-valued header list shared by request and response heads.
pub trait HeaderList {
    fn header_list(&self) -> &[Header];
    fn header_list_mut(&mut self) -> &mut Vec<Header>;

    fn header(&self, name: &str) -> Option<&str> {
        self.header_list()
            .iter()
            .find(|header| header.is(name))
            .map(|header| header.value.as_str())
    }

    fn headers_named<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a Header> + 'a> {
        Box::new(self.header_list().iter().filter(move |header| header.is(name)))
    }

    fn append_header(&mut self, name: &str, value: &str) {
        self.header_list_mut().push(Header::new(name, value));
    }

    /// Replaces every value of `name`, keeping the position of the first one.
    fn set_header(&mut self, name: &str, value: &str) {
        let headers = self.header_list_mut();
        match headers.iter().position(|header| header.is(name)) {
            Some(index) => {
                headers[index].value = value.to_string();
                let mut seen = 0usize;
                headers.retain(|header| {
                    if header.is(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => headers.push(Header::new(name, value)),
        }
    }

    fn remove_header(&mut self, name: &str) -> usize {
        let headers = self.header_list_mut();
        let before = headers.len();
        headers.retain(|header| !header.is(name));
        before - headers.len()
    }

    fn has_token(&self, name: &str, token: &str) -> bool {
        self.header_list().iter().any(|header| {
            header.is(name)
                && header
                    .value
                    .split(',')
                    .any(|value| value.trim().eq_ignore_ascii_case(token))
        })
    }

    fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse::<u64>().ok())
    }

    fn is_chunked(&self) -> bool {
        self.has_token("transfer-encoding", "chunked")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: Vec<Header>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub line: StatusLine,
    pub headers: Vec<Header>,
}

impl HeaderList for RequestHead {
    fn header_list(&self) -> &[Header] {
        &self.headers
    }

    fn header_list_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl HeaderList for ResponseHead {
    fn header_list(&self) -> &[Header] {
        &self.headers
    }

    fn header_list_mut(&mut self) -> &mut Vec<Header> {
        &mut self.headers
    }
}

impl RequestHead {
    pub fn new(method: &str, target: &str, version: HttpVersion) -> Self {
        Self {
            line: RequestLine {
                method: method.to_string(),
                target: target.to_string(),
                version,
            },
            headers: Vec::new(),
        }
    }

    pub fn method(&self) -> &str {
        &self.line.method
    }

    pub fn is_connect(&self) -> bool {
        self.line.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn connection_close(&self) -> bool {
        match self.line.version {
            HttpVersion::Http10 => !self.has_token("connection", "keep-alive"),
            _ => self.has_token("connection", "close") || self.has_token("proxy-connection", "close"),
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.has_token("connection", "upgrade") && self.has_token("upgrade", "websocket")
    }

    pub fn expects_continue(&self) -> bool {
        self.has_token("expect", "100-continue")
    }

    pub fn body_framing(&self) -> BodyFraming {
        if self.is_chunked() {
            return BodyFraming::Chunked;
        }
        match self.content_length() {
            Some(0) | None => BodyFraming::Empty,
            Some(length) => BodyFraming::ContentLength(length),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.method,
                self.line.target,
                self.line.version.wire_str()
            )
            .as_bytes(),
        );
        write_headers(&mut bytes, &self.headers);
        bytes
    }
}

impl ResponseHead {
    pub fn new(status_code: u16, reason: &str) -> Self {
        Self {
            line: StatusLine {
                version: HttpVersion::Http11,
                status_code,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
        }
    }

    pub fn status_code(&self) -> u16 {
        self.line.status_code
    }

    pub fn connection_close(&self) -> bool {
        match self.line.version {
            HttpVersion::Http10 => !self.has_token("connection", "keep-alive"),
            _ => self.has_token("connection", "close"),
        }
    }

    pub fn is_websocket_accept(&self) -> bool {
        self.line.status_code == 101 && self.has_token("upgrade", "websocket")
    }

    pub fn body_framing(&self, request_method: &str) -> BodyFraming {
        let status = self.line.status_code;
        if request_method.eq_ignore_ascii_case("HEAD")
            || status / 100 == 1
            || status == 204
            || status == 304
        {
            return BodyFraming::Empty;
        }
        if self.is_chunked() {
            return BodyFraming::Chunked;
        }
        match self.content_length() {
            Some(0) => BodyFraming::Empty,
            Some(length) => BodyFraming::ContentLength(length),
            None => BodyFraming::CloseDelimited,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        let reason = if self.line.reason.is_empty() {
            default_reason(self.line.status_code)
        } else {
            self.line.reason.as_str()
        };
        bytes.extend_from_slice(
            format!(
                "{} {} {}\r\n",
                self.line.version.wire_str(),
                self.line.status_code,
                reason
            )
            .as_bytes(),
        );
        write_headers(&mut bytes, &self.headers);
        bytes
    }
}

fn write_headers(bytes: &mut Vec<u8>, headers: &[Header]) {
    for header in headers {
        let name = if header.raw_name.trim().is_empty() {
            header.name.as_str()
        } else {
            header.raw_name.trim()
        };
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    bytes.extend_from_slice(b"\r\n");
}

pub fn default_reason(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidStartLine,
    InvalidStatusLine,
    InvalidHeaderName,
    HeaderTooLarge,
    BodyTooLarge,
    InvalidChunkSize,
    InvalidChunkTerminator,
    UnexpectedEof,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} at offset {}", self.kind, self.offset)
    }
}

impl std::error::Error for ParseError {}
