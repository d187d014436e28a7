use assert_matches::assert_matches;
use tokio::io::AsyncWriteExt;

use crate::{
    ArchiveWriter, ConnectionInfo, DirectoryArchiveWriter, ExchangeInfo, ExchangeState,
    HeaderRecord, NullArchiveWriter,
};

fn exchange(id: u64) -> ExchangeInfo {
    ExchangeInfo {
        id,
        method: "GET".to_string(),
        scheme: "https".to_string(),
        host: "example.com".to_string(),
        port: 443,
        path: "/".to_string(),
        http_version: "HTTP/1.1".to_string(),
        request_headers: vec![HeaderRecord {
            name: "Host".to_string(),
            value: "example.com".to_string(),
        }],
        tags: vec!["api".to_string()],
        ..ExchangeInfo::default()
    }
}

#[test]
fn writes_exchange_json_after_flush() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DirectoryArchiveWriter::open(dir.path()).unwrap();

    let mut info = exchange(1);
    assert!(writer.update_exchange(&info).unwrap());
    info.state = ExchangeState::Completed;
    info.status_code = Some(200);
    assert!(writer.update_exchange(&info).unwrap());
    writer.flush().unwrap();

    let raw = std::fs::read(writer.paths().exchange_file(1)).unwrap();
    let stored: ExchangeInfo = serde_json::from_slice(&raw).unwrap();
    assert_eq!(stored, info);
}

#[test]
fn ignores_updates_after_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DirectoryArchiveWriter::open(dir.path()).unwrap();

    let mut info = exchange(2);
    info.state = ExchangeState::Failed;
    info.errors.push("upstream refused".to_string());
    assert!(writer.update_exchange(&info).unwrap());

    let mut late = info.clone();
    late.state = ExchangeState::Completed;
    assert!(!writer.update_exchange(&late).unwrap());
    writer.flush().unwrap();

    let raw = std::fs::read(writer.paths().exchange_file(2)).unwrap();
    let stored: ExchangeInfo = serde_json::from_slice(&raw).unwrap();
    assert_matches!(stored.state, ExchangeState::Failed);
}

#[test]
fn writes_connection_json() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DirectoryArchiveWriter::open(dir.path()).unwrap();
    let info = ConnectionInfo {
        id: 5,
        host: "example.com".to_string(),
        port: 443,
        secure: true,
        exchange_count: 3,
        ..ConnectionInfo::default()
    };
    assert!(writer.update_connection(&info).unwrap());
    writer.flush().unwrap();
    assert!(writer.paths().connection_file(5).exists());
}

#[tokio::test]
async fn body_sinks_land_in_contents_dir() {
    let dir = tempfile::tempdir().unwrap();
    let writer = DirectoryArchiveWriter::open(dir.path()).unwrap();

    let mut sink = writer.create_response_body(8).unwrap().unwrap();
    sink.write_all(b"payload").await.unwrap();
    sink.shutdown().await.unwrap();

    let stored = tokio::fs::read(writer.paths().response_body_file(8)).await.unwrap();
    assert_eq!(stored, b"payload");
}

#[test]
fn null_writer_persists_nothing() {
    let writer = NullArchiveWriter;
    assert!(!writer.is_enabled());
    assert!(!writer.update_exchange(&exchange(1)).unwrap());
    assert!(writer.create_request_body(1).unwrap().is_none());
}
