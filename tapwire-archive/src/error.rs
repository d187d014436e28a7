use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("archive worker closed")]
    Closed,
}
