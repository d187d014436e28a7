use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::Serialize;

use crate::error::ArchiveError;
use crate::layout::ArchivePaths;
use crate::model::{ConnectionInfo, ExchangeInfo};

#[derive(Debug, Clone)]
pub struct ArchiveWorkerConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_queue_size: usize,
}

impl Default for ArchiveWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_ms: 200,
            max_queue_size: 50_000,
        }
    }
}

#[derive(Debug)]
pub enum ArchiveRecord {
    Exchange(ExchangeInfo),
    Connection(ConnectionInfo),
    Flush(Sender<()>),
}

#[derive(Debug, Clone)]
pub struct ArchiveWorkerHandle {
    sender: Sender<ArchiveRecord>,
}

impl ArchiveWorkerHandle {
    pub fn send(&self, record: ArchiveRecord) -> Result<(), ArchiveError> {
        self.sender.send(record).map_err(|_| ArchiveError::Closed)
    }

    /// Blocks until every record queued before this call is on disk.
    pub fn flush(&self) -> Result<(), ArchiveError> {
        let (ack, done) = bounded(1);
        self.send(ArchiveRecord::Flush(ack))?;
        done.recv().map_err(|_| ArchiveError::Closed)
    }
}

pub fn spawn_archive_worker(paths: ArchivePaths, config: ArchiveWorkerConfig) -> ArchiveWorkerHandle {
    let (sender, receiver) = bounded(config.max_queue_size);
    std::thread::spawn(move || worker_loop(receiver, paths, config));
    ArchiveWorkerHandle { sender }
}

#[derive(Default)]
struct Batch {
    exchanges: BTreeMap<u64, ExchangeInfo>,
    connections: BTreeMap<u64, ConnectionInfo>,
}

impl Batch {
    fn len(&self) -> usize {
        self.exchanges.len() + self.connections.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn worker_loop(receiver: Receiver<ArchiveRecord>, paths: ArchivePaths, config: ArchiveWorkerConfig) {
    let mut batch = Batch::default();
    let mut last_flush = Instant::now();
    let timeout = Duration::from_millis(config.flush_interval_ms);

    loop {
        match receiver.recv_timeout(timeout) {
            // later updates of the same id supersede earlier ones in a batch
            Ok(ArchiveRecord::Exchange(info)) => {
                batch.exchanges.insert(info.id, info);
            }
            Ok(ArchiveRecord::Connection(info)) => {
                batch.connections.insert(info.id, info);
            }
            Ok(ArchiveRecord::Flush(ack)) => {
                flush_batch(&paths, &mut batch);
                last_flush = Instant::now();
                let _ = ack.send(());
                continue;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                flush_batch(&paths, &mut batch);
                break;
            }
        }

        if batch.len() >= config.batch_size
            || (!batch.is_empty() && last_flush.elapsed() >= timeout)
        {
            flush_batch(&paths, &mut batch);
            last_flush = Instant::now();
        }
    }
}

fn flush_batch(paths: &ArchivePaths, batch: &mut Batch) {
    for (id, info) in std::mem::take(&mut batch.exchanges) {
        if let Err(err) = write_json(&paths.exchange_file(id), &info) {
            tracing::warn!(exchange_id = id, error = %err, "failed to persist exchange");
        }
    }
    for (id, info) in std::mem::take(&mut batch.connections) {
        if let Err(err) = write_json(&paths.connection_file(id), &info) {
            tracing::warn!(connection_id = id, error = %err, "failed to persist connection");
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArchiveError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let staging = path.with_extension("json.tmp");
    std::fs::write(&staging, bytes)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}
