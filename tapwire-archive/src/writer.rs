use std::collections::{HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;

use tokio::io::AsyncWrite;

use crate::error::ArchiveError;
use crate::model::{ConnectionInfo, ExchangeInfo};

/// Destination of a tee'd request or response body.
pub type BodySink = Pin<Box<dyn AsyncWrite + Send>>;

/// Persistence boundary of the proxy. Updates may arrive from many connection
/// tasks at once; implementations record terminal updates (completed/failed
/// exchanges, closed connections) at most once per id and report a repeated
/// one with `Ok(false)`.
pub trait ArchiveWriter: Send + Sync {
    fn update_exchange(&self, info: &ExchangeInfo) -> Result<bool, ArchiveError>;
    fn update_connection(&self, info: &ConnectionInfo) -> Result<bool, ArchiveError>;
    fn create_request_body(&self, exchange_id: u64) -> Result<Option<BodySink>, ArchiveError>;
    fn create_response_body(&self, exchange_id: u64) -> Result<Option<BodySink>, ArchiveError>;

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Writer used when nothing should be persisted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullArchiveWriter;

impl ArchiveWriter for NullArchiveWriter {
    fn update_exchange(&self, _info: &ExchangeInfo) -> Result<bool, ArchiveError> {
        Ok(false)
    }

    fn update_connection(&self, _info: &ConnectionInfo) -> Result<bool, ArchiveError> {
        Ok(false)
    }

    fn create_request_body(&self, _exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        Ok(None)
    }

    fn create_response_body(&self, _exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        Ok(None)
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Finalized ids kept per kind before the oldest are forgotten.
const DEFAULT_LEDGER_CAPACITY: usize = 65_536;

/// Remembers which ids already received their terminal update. Only the
/// most recent `capacity` ids of each kind are kept; ids are allocated in
/// increasing order, so an evicted id belongs to a long finished exchange.
#[derive(Debug)]
pub struct TerminalLedger {
    exchanges: Mutex<Window>,
    connections: Mutex<Window>,
}

impl Default for TerminalLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LEDGER_CAPACITY)
    }
}

impl TerminalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            exchanges: Mutex::new(Window::new(capacity)),
            connections: Mutex::new(Window::new(capacity)),
        }
    }

    /// Returns false when the exchange was already finalized.
    pub fn admit_exchange(&self, info: &ExchangeInfo) -> bool {
        admit(&self.exchanges, info.id, info.state.is_terminal())
    }

    pub fn admit_connection(&self, info: &ConnectionInfo) -> bool {
        admit(&self.connections, info.id, info.is_closed())
    }

    /// Number of finalized ids currently remembered, exchanges first.
    pub fn remembered(&self) -> (usize, usize) {
        (lock(&self.exchanges).ids.len(), lock(&self.connections).ids.len())
    }
}

#[derive(Debug)]
struct Window {
    ids: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, id: u64) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

fn lock(window: &Mutex<Window>) -> std::sync::MutexGuard<'_, Window> {
    match window.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn admit(window: &Mutex<Window>, id: u64, terminal: bool) -> bool {
    let mut window = lock(window);
    if window.ids.contains(&id) {
        return false;
    }
    if terminal {
        window.insert(id);
    }
    true
}
