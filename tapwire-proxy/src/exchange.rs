use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tapwire_archive::{ExchangeInfo, ExchangeMetrics, ExchangeState, HeaderRecord};
use tapwire_net::{HeaderList, RequestHead, ResponseHead};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

static NEXT_EXCHANGE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_exchange_id() -> u64 {
    NEXT_EXCHANGE_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Logical upstream destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }

    /// Parses `host[:port]`, bracketed IPv6 included.
    pub fn parse(value: &str, secure: bool) -> Option<Self> {
        let default_port = if secure { 443 } else { 80 };
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Some(rest) = value.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port, secure));
        }
        match value.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                Some(Self::new(host, port.parse().ok()?, secure))
            }
            _ => Some(Self::new(value, default_port, secure)),
        }
    }

    /// Resolves the destination of a request read from a proxy client.
    /// Absolute-form targets are rewritten to origin-form in place.
    pub fn from_request(head: &mut RequestHead, tunnel: Option<&Authority>) -> Option<Self> {
        let target = head.line.target.clone();
        if target.starts_with("http://") || target.starts_with("https://") {
            let url = url::Url::parse(&target).ok()?;
            let secure = url.scheme() == "https";
            let host = url.host_str()?.trim_matches(['[', ']']).to_string();
            let port = url.port_or_known_default()?;
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            head.line.target = path;
            if head.header("host").is_none() {
                head.append_header("Host", &host_header(&host, port, secure));
            }
            return Some(Self::new(host, port, secure));
        }
        if let Some(tunnel) = tunnel {
            return Some(tunnel.clone());
        }
        Self::parse(head.header("host")?, false)
    }
}

fn host_header(host: &str, port: u16, secure: bool) -> String {
    let default_port = if secure { 443 } else { 80 };
    let host = if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if port == default_port {
        host
    } else {
        format!("{host}:{port}")
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Message payload. Request bodies are buffered so a retried send can replay
/// them; response bodies usually stream from the upstream connection.
#[derive(Debug)]
pub enum Body {
    Full(Bytes),
    Stream(mpsc::Receiver<io::Result<Bytes>>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Full(Bytes::new())
    }

    pub fn full_len(&self) -> Option<usize> {
        match self {
            Body::Full(bytes) => Some(bytes.len()),
            Body::Stream(_) => None,
        }
    }

    pub fn as_full(&self) -> Option<&Bytes> {
        match self {
            Body::Full(bytes) => Some(bytes),
            Body::Stream(_) => None,
        }
    }

    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        match self {
            Body::Full(bytes) => {
                if bytes.is_empty() {
                    None
                } else {
                    Some(Ok(std::mem::take(bytes)))
                }
            }
            Body::Stream(receiver) => receiver.recv().await,
        }
    }
}

/// Byte stream either leg of the proxy can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

/// Raw upstream stream handed back after a protocol switch (WebSocket).
pub struct Upgraded {
    pub io: Box<dyn ByteStream>,
    pub buffered: Bytes,
}

impl fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.buffered.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct Request {
    pub head: RequestHead,
    pub body: Option<Body>,
}

#[derive(Debug, Default)]
pub struct Response {
    pub head: Option<ResponseHead>,
    pub body: Option<Body>,
    pub upgrade: Option<Upgraded>,
}

/// Upstream session that served an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: u64,
    pub authority: Authority,
    pub alpn: Option<String>,
    pub tls_version: Option<String>,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub exchange_count: u64,
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(authority: Authority) -> Self {
        Self {
            id: next_connection_id(),
            authority,
            alpn: None,
            tls_version: None,
            local_addr: None,
            remote_addr: None,
            exchange_count: 0,
            opened_at: Utc::now(),
        }
    }

    pub fn to_info(&self, closed: bool) -> tapwire_archive::ConnectionInfo {
        tapwire_archive::ConnectionInfo {
            id: self.id,
            host: self.authority.host.clone(),
            port: self.authority.port,
            secure: self.authority.secure,
            local_addr: self.local_addr.map(|addr| addr.to_string()),
            remote_addr: self.remote_addr.map(|addr| addr.to_string()),
            alpn: self.alpn.clone(),
            tls_version: self.tls_version.clone(),
            exchange_count: self.exchange_count,
            opened_at: self.opened_at.to_rfc3339(),
            closed_at: closed.then(|| Utc::now().to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub received_from_client: Option<DateTime<Utc>>,
    pub sent_to_remote: Option<DateTime<Utc>>,
    pub response_header_received: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

/// One request/response unit. Only constructible from a parsed request head.
#[derive(Debug)]
pub struct Exchange {
    pub id: u64,
    pub authority: Authority,
    pub request: Request,
    pub response: Response,
    pub connection: Option<Connection>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub agent: Option<String>,
    pub metrics: Metrics,
    pub errors: Vec<String>,
    pub request_body_size: u64,
    pub request_body_truncated: bool,
    pub response_body_size: u64,
    pub response_body_truncated: bool,
}

impl Exchange {
    pub fn new(authority: Authority, head: RequestHead) -> Self {
        Self {
            id: next_exchange_id(),
            authority,
            request: Request { head, body: None },
            response: Response::default(),
            connection: None,
            tags: Vec::new(),
            comment: None,
            agent: None,
            metrics: Metrics {
                received_from_client: Some(Utc::now()),
                ..Metrics::default()
            },
            errors: Vec::new(),
            request_body_size: 0,
            request_body_truncated: false,
            response_body_size: 0,
            response_body_truncated: false,
        }
    }

    pub fn is_websocket(&self) -> bool {
        self.request.head.is_websocket_upgrade()
    }

    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|existing| existing == tag) {
            self.tags.push(tag.to_string());
        }
    }

    pub fn to_info(&self, state: ExchangeState) -> ExchangeInfo {
        let response = self.response.head.as_ref();
        ExchangeInfo {
            id: self.id,
            connection_id: self.connection.as_ref().map(|connection| connection.id),
            state,
            method: self.request.head.method().to_string(),
            scheme: self.authority.scheme().to_string(),
            host: self.authority.host.clone(),
            port: self.authority.port,
            path: self.request.head.line.target.clone(),
            http_version: self.request.head.line.version.as_str().to_string(),
            request_headers: header_records(&self.request.head),
            request_body_size: self.request_body_size,
            request_body_truncated: self.request_body_truncated,
            status_code: response.map(ResponseHead::status_code),
            reason: response.map(|head| head.line.reason.clone()),
            response_headers: response.map(header_records).unwrap_or_default(),
            response_body_size: self.response_body_size,
            response_body_truncated: self.response_body_truncated,
            tags: self.tags.clone(),
            comment: self.comment.clone(),
            agent: self.agent.clone(),
            metrics: ExchangeMetrics {
                received_from_client: stamp(self.metrics.received_from_client),
                sent_to_remote: stamp(self.metrics.sent_to_remote),
                response_header_received: stamp(self.metrics.response_header_received),
                completed: stamp(self.metrics.completed),
            },
            errors: self.errors.clone(),
        }
    }
}

fn header_records<H: HeaderList>(head: &H) -> Vec<HeaderRecord> {
    head.header_list()
        .iter()
        .map(|header| HeaderRecord {
            name: header.name.clone(),
            value: header.value.clone(),
        })
        .collect()
}

fn stamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|value| value.to_rfc3339())
}

/// First product token of a User-Agent value, e.g. `curl/8.4.0`.
pub fn resolve_agent(user_agent: &str) -> Option<String> {
    user_agent
        .split_whitespace()
        .next()
        .filter(|token| token.contains('/'))
        .map(str::to_string)
}
