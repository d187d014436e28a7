use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tapwire_archive::NullArchiveWriter;
use tapwire_net::{HeaderList, HttpVersion, RequestHead};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::ExchangeContext;
use crate::error::PoolError;
use crate::exchange::{Authority, Body, Exchange};
use crate::pool::{NoRequalification, PoolProvider, send_with_retry};
use crate::upstream::{Http11PoolProvider, UpstreamSettings};

fn provider() -> Http11PoolProvider {
    Http11PoolProvider::new(UpstreamSettings::default(), Arc::new(NullArchiveWriter))
}

fn exchange(host: &str, port: u16, target: &str) -> (Exchange, ExchangeContext) {
    let authority = Authority::new(host, port, false);
    let mut head = RequestHead::new("GET", target, HttpVersion::Http11);
    head.append_header("Host", &authority.to_string());
    let mut exchange = Exchange::new(authority.clone(), head);
    exchange.request.body = Some(Body::empty());
    (exchange, ExchangeContext::new(authority))
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Request line of the next request on `stream`.
async fn read_request(stream: &mut TcpStream) -> String {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    while !bytes.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    let head = String::from_utf8(bytes).unwrap();
    head.lines().next().unwrap_or_default().to_string()
}

async fn collect(body: Option<Body>) -> Vec<u8> {
    let mut body = body.unwrap();
    let mut out = Vec::new();
    while let Some(chunk) = body.next_chunk().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

#[tokio::test]
async fn keep_alive_connection_is_reused() {
    let (listener, port) = listener().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut lines = Vec::new();
        for body in ["first", "second"] {
            lines.push(read_request(&mut stream).await);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        }
        lines
    });

    let provider = provider();
    let token = CancellationToken::new();
    let mut connection_ids = Vec::new();
    for (target, expected) in [("/one", "first"), ("/two", "second")] {
        let (mut exchange, context) = exchange("127.0.0.1", port, target);
        let pool = provider.get_pool(&exchange, &context, &token).await.unwrap();
        pool.send(&mut exchange, &context, &token).await.unwrap();
        assert_eq!(exchange.response.head.as_ref().unwrap().status_code(), 200);
        assert_eq!(collect(exchange.response.body.take()).await, expected.as_bytes());
        connection_ids.push(exchange.connection.unwrap().id);
    }
    assert_eq!(connection_ids[0], connection_ids[1]);
    assert_eq!(provider.idle_connections().await, 1);
    assert_eq!(
        server.await.unwrap(),
        vec!["GET /one HTTP/1.1", "GET /two HTTP/1.1"]
    );
}

#[tokio::test]
async fn closed_idle_connection_is_retried() {
    let (listener, port) = listener().await;
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\na")
            .await
            .unwrap();
        drop(stream);
        let _ = closed_tx.send(());

        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nb")
            .await
            .unwrap();
    });

    let provider = provider();
    let token = CancellationToken::new();
    let (mut first, mut context) = exchange("127.0.0.1", port, "/");
    send_with_retry(
        &provider,
        &NoRequalification,
        &mut first,
        &mut context,
        Duration::from_secs(5),
        &token,
    )
    .await
    .unwrap();
    assert_eq!(collect(first.response.body.take()).await, b"a");
    closed_rx.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (mut second, mut context) = exchange("127.0.0.1", port, "/");
    send_with_retry(
        &provider,
        &NoRequalification,
        &mut second,
        &mut context,
        Duration::from_secs(5),
        &token,
    )
    .await
    .unwrap();
    assert_eq!(collect(second.response.body.take()).await, b"b");
    assert_ne!(
        first.connection.unwrap().id,
        second.connection.unwrap().id
    );
}

#[tokio::test]
async fn repeated_connect_failures_become_terminal() {
    let port = {
        let (listener, port) = listener().await;
        drop(listener);
        port
    };
    let provider = provider();
    let token = CancellationToken::new();
    let (mut exchange, context) = exchange("127.0.0.1", port, "/");
    let pool = provider.get_pool(&exchange, &context, &token).await.unwrap();
    for _ in 0..3 {
        assert_matches!(
            pool.send(&mut exchange, &context, &token).await,
            Err(PoolError::Connect { .. })
        );
    }
    assert_matches!(
        pool.send(&mut exchange, &context, &token).await,
        Err(PoolError::Terminal(_))
    );
}

#[tokio::test]
async fn spoofed_host_and_close_delimited_body() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n\r\nuntil close")
            .await
            .unwrap();
    });

    let provider = provider();
    let token = CancellationToken::new();
    let (mut exchange, mut context) = exchange("upstream.invalid", port, "/");
    context.remote_host_override = Some("127.0.0.1".to_string());
    let pool = provider.get_pool(&exchange, &context, &token).await.unwrap();
    pool.send(&mut exchange, &context, &token).await.unwrap();

    assert_eq!(exchange.response.head.as_ref().unwrap().status_code(), 200);
    assert_eq!(collect(exchange.response.body.take()).await, b"until close");
    assert_eq!(provider.idle_connections().await, 0);
}

#[tokio::test]
async fn websocket_switch_hands_back_the_stream() {
    let (listener, port) = listener().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\nframe",
            )
            .await
            .unwrap();
    });

    let provider = provider();
    let token = CancellationToken::new();
    let (mut exchange, context) = exchange("127.0.0.1", port, "/socket");
    let pool = provider.get_pool(&exchange, &context, &token).await.unwrap();
    pool.send(&mut exchange, &context, &token).await.unwrap();

    let head = exchange.response.head.as_ref().unwrap();
    assert!(head.is_websocket_accept());
    let mut upgraded = exchange.response.upgrade.take().unwrap();
    let mut received = upgraded.buffered.to_vec();
    while received.len() < 5 {
        let mut rest = [0u8; 8];
        let read = upgraded.io.read(&mut rest).await.unwrap();
        assert!(read > 0);
        received.extend_from_slice(&rest[..read]);
    }
    assert_eq!(received, b"frame");
}
