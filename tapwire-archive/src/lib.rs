mod directory;
mod error;
mod layout;
mod model;
mod tee;
mod worker;
mod writer;
#[cfg(test)]
mod directory_test;

pub use directory::DirectoryArchiveWriter;
pub use error::ArchiveError;
pub use layout::{ArchiveLayout, ArchivePaths};
pub use model::{
    BodyLimits, ConnectionInfo, ExchangeInfo, ExchangeMetrics, ExchangeState, HeaderRecord,
};
pub use tee::{BodyTee, TeeSummary};
pub use worker::{ArchiveRecord, ArchiveWorkerConfig, ArchiveWorkerHandle, spawn_archive_worker};
pub use writer::{ArchiveWriter, BodySink, NullArchiveWriter, TerminalLedger};
