use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use tapwire_archive::{
    ArchiveError, ArchiveWriter, BodySink, ConnectionInfo, ExchangeInfo, ExchangeState,
    NullArchiveWriter,
};
use tapwire_net::{
    CertCache, ClientTlsConfig, HeaderList, HttpVersion, ResponseHead, SocksError,
    SocksErrorKind, build_connector, generate_ca,
};
use tapwire_proxy::{
    Action, Authority, Body, BodyEdit, BreakPointLocation, BreakPointManager, BreakPointModel,
    BreakPointStatus, CaCertificateProvider, ConnectionPool, Exchange, ExchangeContext, Filter,
    FilterScope, Orchestrator, PoolError, PoolProvider, ProxyError, RequestEditModel,
    ResponseBody, Rule, RuleEngine, RuleSet, StringSelector, TlsImpersonator, event_channel,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_openssl::SslStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Request as it reached the upstream side of the proxy.
#[derive(Debug, Clone)]
struct Seen {
    authority: Authority,
    target: String,
    tags: Vec<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Seen {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

enum Reply {
    Full(&'static str),
    /// HTTP/2 head with a body that streams without a length.
    Http2Stream(Vec<&'static str>),
}

struct Upstream {
    authority: Authority,
    seen: Mutex<Vec<Seen>>,
    races: AtomicUsize,
    sends: AtomicUsize,
    reply: Reply,
}

impl Upstream {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            authority: Authority::new("upstream", 80, false),
            seen: Mutex::new(Vec::new()),
            races: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            reply,
        })
    }

    fn racing(reply: Reply, races: usize) -> Arc<Self> {
        let upstream = Self::new(reply);
        upstream.races.store(races, Ordering::SeqCst);
        upstream
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionPool for Upstream {
    fn authority(&self) -> &Authority {
        &self.authority
    }

    async fn send(
        &self,
        exchange: &mut Exchange,
        _context: &ExchangeContext,
        _token: &CancellationToken,
    ) -> Result<(), PoolError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if self
            .races
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(PoolError::ConnectionClosedConcurrently);
        }

        let head = &exchange.request.head;
        self.seen.lock().unwrap().push(Seen {
            authority: exchange.authority.clone(),
            target: head.line.target.clone(),
            tags: exchange.tags.clone(),
            headers: head
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            body: exchange
                .request
                .body
                .as_ref()
                .and_then(Body::as_full)
                .cloned()
                .unwrap_or_default(),
        });

        match &self.reply {
            Reply::Full(body) => {
                let mut head = ResponseHead::new(200, "OK");
                head.append_header("Content-Length", &body.len().to_string());
                exchange.response.head = Some(head);
                exchange.response.body = Some(Body::Full(Bytes::from_static(body.as_bytes())));
            }
            Reply::Http2Stream(chunks) => {
                let mut head = ResponseHead::new(200, "OK");
                head.line.version = HttpVersion::Http2;
                let (sender, receiver) = mpsc::channel(chunks.len().max(1));
                for chunk in chunks {
                    let _ = sender.try_send(Ok(Bytes::from_static(chunk.as_bytes())));
                }
                exchange.response.head = Some(head);
                exchange.response.body = Some(Body::Stream(receiver));
            }
        }
        Ok(())
    }
}

struct Provider(Arc<Upstream>);

#[async_trait]
impl PoolProvider for Provider {
    async fn get_pool(
        &self,
        _exchange: &Exchange,
        _context: &ExchangeContext,
        _token: &CancellationToken,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        let pool: Arc<dyn ConnectionPool> = self.0.clone();
        Ok(pool)
    }
}

/// Keeps the last record written for every exchange.
#[derive(Default)]
struct RecordingArchive {
    exchanges: Mutex<Vec<ExchangeInfo>>,
}

impl RecordingArchive {
    fn completed(&self) -> Vec<ExchangeInfo> {
        self.exchanges
            .lock()
            .unwrap()
            .iter()
            .filter(|info| info.state == ExchangeState::Completed)
            .cloned()
            .collect()
    }
}

impl ArchiveWriter for RecordingArchive {
    fn update_exchange(&self, info: &ExchangeInfo) -> Result<bool, ArchiveError> {
        self.exchanges.lock().unwrap().push(info.clone());
        Ok(true)
    }

    fn update_connection(&self, _info: &ConnectionInfo) -> Result<bool, ArchiveError> {
        Ok(true)
    }

    fn create_request_body(&self, _exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        Ok(None)
    }

    fn create_response_body(&self, _exchange_id: u64) -> Result<Option<BodySink>, ArchiveError> {
        Ok(None)
    }
}

fn build(
    rules: Vec<Rule>,
    upstream: &Arc<Upstream>,
    breakpoints: Arc<BreakPointManager>,
    archive: Arc<dyn ArchiveWriter>,
) -> Orchestrator {
    let engine = RuleEngine::new(RuleSet::new(rules), breakpoints);
    Orchestrator::new(
        engine,
        Arc::new(Provider(Arc::clone(upstream))),
        archive,
        CancellationToken::new(),
    )
}

fn orchestrator(
    rules: Vec<Rule>,
    upstream: &Arc<Upstream>,
    breakpoints: Arc<BreakPointManager>,
) -> Arc<Orchestrator> {
    Arc::new(build(rules, upstream, breakpoints, Arc::new(NullArchiveWriter)))
}

/// Orchestrator that decrypts tunnels with a throwaway root CA.
fn intercepting(upstream: &Arc<Upstream>) -> Arc<Orchestrator> {
    let ca = generate_ca("Tapwire Test CA").unwrap();
    let provider = Arc::new(CaCertificateProvider::new(ca, CertCache::new(8)));
    Arc::new(
        build(
            Vec::new(),
            upstream,
            quiet_breakpoints(),
            Arc::new(NullArchiveWriter),
        )
        .with_impersonator(TlsImpersonator::new(provider, false)),
    )
}

async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    while !received.ends_with(needle) {
        let read = stream.read(&mut chunk).await.unwrap();
        assert!(read > 0, "stream closed before {:?}", String::from_utf8_lossy(needle));
        received.extend_from_slice(&chunk[..read]);
    }
    received
}

fn quiet_breakpoints() -> Arc<BreakPointManager> {
    Arc::new(BreakPointManager::new(CancellationToken::new(), None))
}

/// Writes `request`, half-closes, and returns everything the proxy sent back.
async fn roundtrip(orchestrator: Arc<Orchestrator>, request: &str) -> String {
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });
    client.write_all(request.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    let _ = task.await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn host_rule_adds_response_header_once() {
    let upstream = Upstream::new(Reply::Full("ok"));
    let rules = vec![Rule::new(
        "tag x",
        Filter::Host(StringSelector::exact("x.test")),
        Action::AddResponseHeader {
            name: "X-Seen".to_string(),
            value: "yes".to_string(),
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "GET http://x.test/a HTTP/1.1\r\nHost: x.test\r\n\r\n\
         GET http://y.test/b HTTP/1.1\r\nHost: y.test\r\n\r\n",
    )
    .await;

    let replies: Vec<&str> = response.split("HTTP/1.1 200 OK").skip(1).collect();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].matches("X-Seen: yes").count(), 1);
    assert_eq!(replies[1].matches("X-Seen").count(), 0);
    assert!(replies[0].ends_with("ok"));

    let seen = upstream.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].target, "/a");
    assert_eq!(seen[1].target, "/b");
}

#[tokio::test]
async fn update_header_expands_previous_value() {
    let upstream = Upstream::new(Reply::Full(""));
    let rules = vec![Rule::new(
        "suffix agent",
        Filter::Any,
        Action::UpdateRequestHeader {
            name: "User-Agent".to_string(),
            value: "{{previous}} tapwire".to_string(),
            add_if_missing: false,
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, quiet_breakpoints());

    roundtrip(
        orchestrator,
        "GET http://h.test/ HTTP/1.1\r\nHost: h.test\r\nUser-Agent: curl/8.0\r\n\r\n",
    )
    .await;

    let seen = upstream.seen();
    assert_eq!(seen[0].header("user-agent"), Some("curl/8.0 tapwire"));
}

#[tokio::test]
async fn request_body_is_forwarded_with_a_length() {
    let upstream = Upstream::new(Reply::Full("done"));
    let orchestrator = orchestrator(Vec::new(), &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "POST http://h.test/upload HTTP/1.1\r\nHost: h.test\r\n\
         Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let seen = upstream.seen();
    assert_eq!(seen[0].body, Bytes::from_static(b"hello"));
    assert_eq!(seen[0].header("content-length"), Some("5"));
    assert_eq!(seen[0].header("transfer-encoding"), None);
}

#[tokio::test]
async fn breakpoint_edit_reaches_upstream() {
    let upstream = Upstream::new(Reply::Full("edited"));
    let (sender, mut events) = event_channel(16);
    let breakpoints = Arc::new(BreakPointManager::new(
        CancellationToken::new(),
        Some(sender),
    ));
    let rules = vec![Rule::new(
        "pause",
        Filter::Path(StringSelector::exact("/old")),
        Action::BreakPoint {
            skip: vec![
                BreakPointLocation::ConnectionSetup,
                BreakPointLocation::ResponseHeader,
                BreakPointLocation::EndPoint,
            ],
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, Arc::clone(&breakpoints));

    let controller = {
        let breakpoints = Arc::clone(&breakpoints);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.status != BreakPointStatus::Running {
                    continue;
                }
                let Some(BreakPointModel::Request(mut model)) = event.snapshot else {
                    continue;
                };
                model.flat_header = model.flat_header.replacen("/old", "/new", 1);
                let resolved = breakpoints
                    .resolve(
                        event.exchange_id,
                        event.location,
                        Some(BreakPointModel::Request(model)),
                    )
                    .unwrap();
                assert!(resolved);
                return event.location;
            }
            panic!("no breakpoint event");
        })
    };

    let response = roundtrip(
        orchestrator,
        "GET http://h.test/old HTTP/1.1\r\nHost: h.test\r\n\r\n",
    )
    .await;

    assert_eq!(controller.await.unwrap(), BreakPointLocation::RequestHeader);
    assert!(response.ends_with("edited"));
    assert_eq!(upstream.seen()[0].target, "/new");
    assert!(breakpoints.pending().is_empty());
}

#[tokio::test]
async fn pool_race_is_retried() {
    let upstream = Upstream::racing(Reply::Full("second try"), 1);
    let orchestrator = orchestrator(Vec::new(), &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "GET http://h.test/ HTTP/1.1\r\nHost: h.test\r\n\r\n",
    )
    .await;

    assert!(response.ends_with("second try"));
    assert_eq!(upstream.sends.load(Ordering::SeqCst), 2);
    assert_eq!(upstream.seen().len(), 1);
}

#[tokio::test]
async fn http2_response_without_length_is_chunked() {
    let upstream = Upstream::new(Reply::Http2Stream(vec!["abc", "de"]));
    let orchestrator = orchestrator(Vec::new(), &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "GET http://h.test/ HTTP/1.1\r\nHost: h.test\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(response.ends_with("\r\n\r\n3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n"));
}

#[tokio::test]
async fn full_response_skips_upstream() {
    let upstream = Upstream::new(Reply::Full("never"));
    let rules = vec![Rule::new(
        "block",
        Filter::Host(StringSelector::exact("ads.test")),
        Action::FullResponse {
            status: 403,
            headers: vec![("X-Blocked".to_string(), "1".to_string())],
            body: ResponseBody::Text("blocked".to_string()),
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "GET http://ads.test/pixel HTTP/1.1\r\nHost: ads.test\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"));
    assert!(response.contains("X-Blocked: 1\r\n"));
    assert!(response.contains("Content-Length: 7\r\n"));
    assert!(response.ends_with("blocked"));
    assert_eq!(upstream.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn abort_closes_without_a_response() {
    let upstream = Upstream::new(Reply::Full("never"));
    let rules = vec![Rule::new("drop", Filter::Any, Action::Abort)];
    let orchestrator = orchestrator(rules, &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "GET http://h.test/ HTTP/1.1\r\nHost: h.test\r\n\r\n",
    )
    .await;

    assert!(response.is_empty());
    assert_eq!(upstream.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_request_gets_bad_request() {
    let upstream = Upstream::new(Reply::Full("never"));
    let orchestrator = orchestrator(Vec::new(), &upstream, quiet_breakpoints());

    let response = roundtrip(orchestrator, "GET\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 400"));
    assert_eq!(upstream.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn blind_connect_tunnel_relays_bytes() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut ping = [0u8; 4];
        stream.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        stream.write_all(b"pong").await.unwrap();
    });

    let upstream = Upstream::new(Reply::Full("never"));
    let orchestrator = orchestrator(Vec::new(), &upstream, quiet_breakpoints());
    let (mut client, server) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });

    client
        .write_all(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut established = vec![0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
    client.read_exact(&mut established).await.unwrap();
    assert!(established.starts_with(b"HTTP/1.1 200"));

    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");
    drop(client);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn deleted_length_header_keeps_pipelined_framing() {
    let upstream = Upstream::new(Reply::Full("ok"));
    let rules = vec![Rule::new(
        "strip length",
        Filter::Any,
        Action::DeleteRequestHeader {
            name: "Content-Length".to_string(),
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, quiet_breakpoints());

    let response = roundtrip(
        orchestrator,
        "POST http://h.test/a HTTP/1.1\r\nHost: h.test\r\nContent-Length: 5\r\n\r\nhello\
         GET http://h.test/b HTTP/1.1\r\nHost: h.test\r\n\r\n",
    )
    .await;

    assert_eq!(response.matches("HTTP/1.1 200 OK").count(), 2);
    let seen = upstream.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].target, "/a");
    assert_eq!(seen[0].body, Bytes::from_static(b"hello"));
    assert_eq!(seen[0].header("content-length"), Some("5"));
    assert_eq!(seen[1].target, "/b");
    assert!(seen[1].body.is_empty());
}

#[tokio::test]
async fn longer_breakpoint_body_does_not_stall_the_read() {
    let upstream = Upstream::new(Reply::Full("stored"));
    let (sender, mut events) = event_channel(16);
    let breakpoints = Arc::new(BreakPointManager::new(
        CancellationToken::new(),
        Some(sender),
    ));
    let rules = vec![Rule::new(
        "rewrite form",
        Filter::Any,
        Action::BreakPoint {
            skip: vec![
                BreakPointLocation::ConnectionSetup,
                BreakPointLocation::ResponseHeader,
                BreakPointLocation::EndPoint,
            ],
        },
    )];
    let orchestrator = orchestrator(rules, &upstream, Arc::clone(&breakpoints));

    let controller = {
        let breakpoints = Arc::clone(&breakpoints);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if event.status != BreakPointStatus::Running {
                    continue;
                }
                let Some(BreakPointModel::Request(model)) = event.snapshot else {
                    continue;
                };
                let edit = RequestEditModel {
                    flat_header: model.flat_header,
                    body: BodyEdit::Text("a much longer replacement".to_string()),
                };
                breakpoints
                    .resolve(
                        event.exchange_id,
                        event.location,
                        Some(BreakPointModel::Request(edit)),
                    )
                    .unwrap();
            }
        })
    };

    // The client keeps its side open, so only the declared five bytes exist.
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });
    client
        .write_all(
            b"POST http://h.test/form HTTP/1.1\r\nHost: h.test\r\n\
              Connection: close\r\nContent-Length: 5\r\n\r\nhello",
        )
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut response))
        .await
        .expect("exchange stalled after the body edit")
        .unwrap();
    task.await.unwrap().unwrap();
    controller.abort();

    assert!(response.ends_with(b"stored"));
    let seen = upstream.seen();
    assert_eq!(seen[0].body, Bytes::from_static(b"a much longer replacement"));
    assert_eq!(seen[0].header("content-length"), Some("25"));
}

#[tokio::test]
async fn decrypted_connect_reaches_upstream_over_tls() {
    let upstream = Upstream::new(Reply::Full("secret"));
    let orchestrator = intercepting(&upstream);
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });

    client
        .write_all(b"CONNECT h.test:443 HTTP/1.1\r\nHost: h.test:443\r\n\r\n")
        .await
        .unwrap();
    let mut established = vec![0u8; "HTTP/1.1 200 Connection Established\r\n\r\n".len()];
    client.read_exact(&mut established).await.unwrap();
    assert!(established.starts_with(b"HTTP/1.1 200"));

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
        .into_ssl("h.test")
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
    assert!(subject.iter().any(|name| name == "h.test"));

    tls.write_all(b"GET /account HTTP/1.1\r\nHost: h.test\r\n\r\n")
        .await
        .unwrap();
    tls.flush().await.unwrap();
    let response = read_until(&mut tls, b"secret").await;
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    drop(tls);
    let _ = task.await.unwrap();

    let seen = upstream.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].target, "/account");
    assert_eq!(seen[0].authority.host, "h.test");
    assert_eq!(seen[0].authority.port, 443);
    assert!(seen[0].authority.secure);
}

#[tokio::test]
async fn socks5_connect_carries_plain_http() {
    let upstream = Upstream::new(Reply::Full("via socks"));
    let orchestrator = intercepting(&upstream);
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });

    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();
    assert_eq!(selection, [5, 0]);

    let mut connect = vec![5, 1, 0, 3, 6];
    connect.extend_from_slice(b"h.test");
    connect.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&connect).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    client
        .write_all(b"GET /socks HTTP/1.1\r\nHost: h.test\r\n\r\n")
        .await
        .unwrap();
    client.shutdown().await.unwrap();
    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    task.await.unwrap().unwrap();

    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("via socks"));
    let seen = upstream.seen();
    assert_eq!(seen[0].target, "/socks");
    assert_eq!(seen[0].authority.host, "h.test");
    assert_eq!(seen[0].authority.port, 80);
    assert!(!seen[0].authority.secure);
}

#[tokio::test]
async fn malformed_socks5_request_is_a_socks_error() {
    let upstream = Upstream::new(Reply::Full("never"));
    let orchestrator = intercepting(&upstream);
    let (mut client, server) = tokio::io::duplex(4096);
    let task = tokio::spawn(async move { orchestrator.serve(server).await });

    client.write_all(&[5, 1, 0]).await.unwrap();
    let mut selection = [0u8; 2];
    client.read_exact(&mut selection).await.unwrap();
    // Address type 9 does not exist.
    client.write_all(&[5, 1, 0, 9, 0, 0]).await.unwrap();

    let result = task.await.unwrap();
    assert_matches!(
        result,
        Err(ProxyError::Socks(SocksError {
            kind: SocksErrorKind::UnsupportedAddressType(9),
            ..
        }))
    );
    assert_eq!(upstream.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn tags_follow_scope_order() {
    let upstream = Upstream::new(Reply::Full("ok"));
    let scopes = [
        (FilterScope::OnAuthorityReceived, "authority"),
        (FilterScope::RequestHeaderReceivedFromClient, "request-header"),
        (FilterScope::RequestBodyReceivedFromClient, "request-body"),
        (FilterScope::ResponseHeaderReceivedFromRemote, "response-header"),
        (FilterScope::ResponseBodyReceivedFromRemote, "response-body"),
    ];
    // Declared backwards so rule order cannot explain the result.
    let rules = scopes
        .iter()
        .rev()
        .map(|(scope, tag)| {
            Rule::new(
                *tag,
                Filter::Any,
                Action::ApplyTag {
                    tag: tag.to_string(),
                    run_scope: Some(*scope),
                },
            )
        })
        .collect();
    let archive = Arc::new(RecordingArchive::default());
    let orchestrator = Arc::new(build(
        rules,
        &upstream,
        quiet_breakpoints(),
        archive.clone(),
    ));

    roundtrip(
        orchestrator,
        "POST http://h.test/ HTTP/1.1\r\nHost: h.test\r\nContent-Length: 2\r\n\r\nhi",
    )
    .await;

    let expected: Vec<String> = scopes.iter().map(|(_, tag)| tag.to_string()).collect();
    let seen = upstream.seen();
    assert_eq!(seen[0].tags, &expected[..3]);
    let completed = archive.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].tags, expected);
}
