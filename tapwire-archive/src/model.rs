use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderRecord {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExchangeState::Pending)
    }
}

/// RFC 3339 timestamps of the exchange's milestones.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeMetrics {
    pub received_from_client: Option<String>,
    pub sent_to_remote: Option<String>,
    pub response_header_received: Option<String>,
    pub completed: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExchangeInfo {
    pub id: u64,
    pub connection_id: Option<u64>,
    pub state: ExchangeState,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub http_version: String,
    pub request_headers: Vec<HeaderRecord>,
    pub request_body_size: u64,
    pub request_body_truncated: bool,
    pub status_code: Option<u16>,
    pub reason: Option<String>,
    pub response_headers: Vec<HeaderRecord>,
    pub response_body_size: u64,
    pub response_body_truncated: bool,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub agent: Option<String>,
    pub metrics: ExchangeMetrics,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pub alpn: Option<String>,
    pub tls_version: Option<String>,
    pub exchange_count: u64,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

impl ConnectionInfo {
    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BodyLimits {
    pub request_max_bytes: u64,
    pub response_max_bytes: u64,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            request_max_bytes: 5 * 1024 * 1024,
            response_max_bytes: 20 * 1024 * 1024,
        }
    }
}
