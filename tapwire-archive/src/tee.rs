use tokio::io::AsyncWriteExt;

use crate::error::ArchiveError;
use crate::writer::BodySink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeeSummary {
    pub total: u64,
    pub written: u64,
    pub truncated: bool,
}

/// Copies body chunks into an archive sink up to a byte limit. Bytes past
/// the limit are counted but dropped.
pub struct BodyTee {
    sink: BodySink,
    limit: u64,
    summary: TeeSummary,
}

impl BodyTee {
    pub fn new(sink: BodySink, limit: u64) -> Self {
        Self {
            sink,
            limit,
            summary: TeeSummary::default(),
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        self.summary.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.summary.written);
        let take = (chunk.len() as u64).min(room) as usize;
        if take < chunk.len() {
            self.summary.truncated = true;
        }
        if take > 0 {
            self.sink.write_all(&chunk[..take]).await?;
            self.summary.written += take as u64;
        }
        Ok(())
    }

    pub async fn finish(mut self) -> Result<TeeSummary, ArchiveError> {
        self.sink.flush().await?;
        self.sink.shutdown().await?;
        Ok(self.summary)
    }
}
