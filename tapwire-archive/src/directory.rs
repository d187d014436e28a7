use std::path::Path;

use crate::error::ArchiveError;
use crate::layout::{ArchiveLayout, ArchivePaths};
use crate::model::{ConnectionInfo, ExchangeInfo};
use crate::worker::{ArchiveRecord, ArchiveWorkerConfig, ArchiveWorkerHandle, spawn_archive_worker};
use crate::writer::{ArchiveWriter, BodySink, TerminalLedger};

/// Archive stored as one JSON file per exchange and connection plus raw body
/// files, written by a background worker thread.
pub struct DirectoryArchiveWriter {
    paths: ArchivePaths,
    worker: ArchiveWorkerHandle,
    ledger: TerminalLedger,
}

impl DirectoryArchiveWriter {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        Self::open_with(root, &ArchiveLayout::default(), ArchiveWorkerConfig::default())
    }

    pub fn open_with(
        root: impl AsRef<Path>,
        layout: &ArchiveLayout,
        config: ArchiveWorkerConfig,
    ) -> Result<Self, ArchiveError> {
        let paths = ArchivePaths::new(root, layout);
        paths.create_dirs()?;
        let worker = spawn_archive_worker(paths.clone(), config);
        Ok(Self {
            paths,
            worker,
            ledger: TerminalLedger::new(),
        })
    }

    pub fn paths(&self) -> &ArchivePaths {
        &self.paths
    }

    pub fn flush(&self) -> Result<(), ArchiveError> {
        self.worker.flush()
    }

    fn create_sink(&self, path: &Path) -> Result<Option<BodySink>, ArchiveError> {
        let file = std::fs::File::create(path)?;
        Ok(Some(Box::pin(tokio::fs::File::from_std(file))))
    }
}

impl ArchiveWriter for DirectoryArchiveWriter {
    fn update_exchange(&self, info: &ExchangeInfo) -> Result<bool, ArchiveError> {
        if !self.ledger.admit_exchange(info) {
            return Ok(false);
        }
        self.worker.send(ArchiveRecord::Exchange(info.clone()))?;
        Ok(true)
    }

    fn update_connection(&self, info: &ConnectionInfo) -> Result<bool, ArchiveError> {
        if !self.ledger.admit_connection(info) {
            return Ok(false);
        }
        self.worker.send(ArchiveRecord::Connection(info.clone()))?;
        Ok(true)
    }

    fn create_request_body(&self, exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        self.create_sink(&self.paths.request_body_file(exchange_id))
    }

    fn create_response_body(&self, exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        self.create_sink(&self.paths.response_body_file(exchange_id))
    }
}
