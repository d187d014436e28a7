use std::pin::Pin;
use std::sync::Arc;

use assert_matches::assert_matches;
use tapwire_net::{CertCache, ClientTlsConfig, TlsVersionRange, build_connector, generate_ca};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_openssl::SslStream;

use crate::error::ProxyError;
use crate::sniff::{
    CaCertificateProvider, CertificateProvider, StreamKind, TlsImpersonator, classify, sniff,
};

fn impersonator() -> TlsImpersonator {
    let ca = generate_ca("Tapwire Test CA").unwrap();
    let provider = Arc::new(CaCertificateProvider::new(ca, CertCache::new(8)));
    TlsImpersonator::new(provider, false)
}

#[test]
fn classifies_by_first_byte() {
    assert_eq!(classify(0x16), StreamKind::Tls);
    assert_eq!(classify(0x05), StreamKind::Socks5);
    assert_eq!(classify(b'G'), StreamKind::Http);
    assert_eq!(classify(b'C'), StreamKind::Http);
}

#[tokio::test]
async fn sniffed_byte_is_replayed() {
    let (mut client, server) = tokio::io::duplex(64);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let (kind, mut stream) = sniff(server).await.unwrap();
    assert_eq!(kind, StreamKind::Http);
    let mut start = [0u8; 4];
    stream.read_exact(&mut start).await.unwrap();
    assert_eq!(&start, b"GET ");
}

#[tokio::test]
async fn closed_stream_is_a_client_close() {
    let (client, server) = tokio::io::duplex(8);
    drop(client);
    assert_matches!(sniff(server).await, Err(ProxyError::ClientClosed));
}

#[test]
fn sibling_hosts_share_a_leaf() {
    let ca = generate_ca("Tapwire Test CA").unwrap();
    let provider = CaCertificateProvider::new(ca, CertCache::new(8));
    let first = provider.certificate_for("a.example.com").unwrap();
    let second = provider.certificate_for("b.example.com").unwrap();
    assert_eq!(first, second);
    assert_eq!(provider.cached(), 1);

    provider.certificate_for("other.org").unwrap();
    assert_eq!(provider.cached(), 2);
}

#[tokio::test]
async fn handshake_presents_certificate_for_host() {
    let impersonator = impersonator();
    let (client, server) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(async move {
        let (kind, stream) = sniff(server).await.unwrap();
        assert_eq!(kind, StreamKind::Tls);
        let mut tls = impersonator
            .accept("example.com", stream, TlsVersionRange::default())
            .await
            .unwrap();
        let mut greeting = [0u8; 5];
        tls.read_exact(&mut greeting).await.unwrap();
        tls.write_all(&greeting).await.unwrap();
        tls.flush().await.unwrap();
    });

    let connector = build_connector(&ClientTlsConfig {
        skip_verify: true,
        alpn: vec!["http/1.1".to_string()],
        ..ClientTlsConfig::default()
    })
    .unwrap();
    let ssl = connector
        .configure()
        .unwrap()
        .verify_hostname(false)
        .into_ssl("example.com")
        .unwrap();
    let mut tls = SslStream::new(ssl, client).unwrap();
    Pin::new(&mut tls).connect().await.unwrap();
    let subject = tls
        .ssl()
        .peer_certificate()
        .unwrap()
        .subject_name()
        .entries()
        .map(|entry| String::from_utf8_lossy(entry.data().as_slice()).to_string())
        .collect::<Vec<_>>();
    assert!(subject.iter().any(|name| name == "example.com"));

    tls.write_all(b"hello").await.unwrap();
    tls.flush().await.unwrap();
    let mut echo = [0u8; 5];
    tls.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"hello");
    server.await.unwrap();
}

#[tokio::test]
async fn malformed_client_hello_is_a_handshake_error() {
    let impersonator = impersonator();
    let (mut client, server) = tokio::io::duplex(4096);
    client
        .write_all(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0xff])
        .await
        .unwrap();

    let (_, stream) = sniff(server).await.unwrap();
    let result = impersonator
        .accept("example.com", stream, TlsVersionRange::default())
        .await;
    assert_matches!(result, Err(ProxyError::TlsHandshake { host, .. }) if host == "example.com");
    drop(client);
}
