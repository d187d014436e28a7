use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tapwire_archive::ArchiveWriter;
use tapwire_net::{
    BodyDecoder, BodyFraming, ClientTlsConfig, Limits, TlsVersion, build_connector,
};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::context::ExchangeContext;
use crate::error::{PoolError, ProxyError, is_disconnect};
use crate::exchange::{Authority, Body, ByteStream, Connection, Exchange, Upgraded};
use crate::pool::{ConnectionPool, PoolProvider};
use crate::wire::MessageStream;

const CONNECT_FAILURE_LIMIT: u32 = 3;
const CONNECT_FAILURE_BACKOFF: Duration = Duration::from_secs(5);
const BODY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub max_idle_per_authority: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
    pub limits: Limits,
}

impl UpstreamSettings {
    pub fn from_config(config: &PoolConfig, limits: Limits) -> Self {
        Self {
            max_idle_per_authority: config.max_idle_per_authority,
            idle_timeout: config.idle_timeout(),
            connect_timeout: config.connect_timeout(),
            limits,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default(), Limits::default())
    }
}

/// Everything that makes two upstream connections interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PoolKey {
    authority: Authority,
    remote_host: String,
    remote_port: u16,
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    skip_verify: bool,
    alpn: Option<Vec<String>>,
    client_certificate: Option<Vec<u8>>,
}

impl PoolKey {
    fn new(authority: &Authority, context: &ExchangeContext) -> Self {
        Self {
            authority: authority.clone(),
            remote_host: context.remote_host().to_string(),
            remote_port: context.remote_port(),
            min_version: context.ssl_protocols.min,
            max_version: context.ssl_protocols.max,
            skip_verify: context.skip_remote_certificate_validation,
            alpn: context.alpn.clone(),
            client_certificate: context
                .client_certificates
                .first()
                .map(|cert| cert.cert_pem.clone()),
        }
    }
}

/// Default provider: one HTTP/1.1 pool per distinct upstream setup.
pub struct Http11PoolProvider {
    pools: Mutex<HashMap<PoolKey, Arc<Http11Pool>>>,
    settings: UpstreamSettings,
    archive: Arc<dyn ArchiveWriter>,
}

impl Http11PoolProvider {
    pub fn new(settings: UpstreamSettings, archive: Arc<dyn ArchiveWriter>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            settings,
            archive,
        }
    }

    pub async fn idle_connections(&self) -> usize {
        let pools: Vec<Arc<Http11Pool>> = self.pools.lock().await.values().cloned().collect();
        let mut total = 0;
        for pool in pools {
            total += pool.checkin.idle.lock().await.len();
        }
        total
    }
}

#[async_trait]
impl PoolProvider for Http11PoolProvider {
    async fn get_pool(
        &self,
        exchange: &Exchange,
        context: &ExchangeContext,
        _token: &CancellationToken,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError> {
        let key = PoolKey::new(&exchange.authority, context);
        let mut pools = self.pools.lock().await;
        let pool = pools
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Http11Pool::new(
                    key,
                    self.settings.clone(),
                    Arc::clone(&self.archive),
                ))
            })
            .clone();
        Ok(pool)
    }
}

struct PooledConnection {
    stream: MessageStream<Box<dyn ByteStream>>,
    info: Connection,
    idle_since: Instant,
}

/// Return path for connections whose response finished.
#[derive(Clone)]
struct Checkin {
    idle: Arc<Mutex<VecDeque<PooledConnection>>>,
    max_idle: usize,
    archive: Arc<dyn ArchiveWriter>,
}

impl Checkin {
    async fn put(&self, mut connection: PooledConnection, reusable: bool) {
        if !reusable {
            self.discard(&connection.info);
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max_idle {
            drop(idle);
            self.discard(&connection.info);
            return;
        }
        connection.idle_since = Instant::now();
        idle.push_back(connection);
    }

    fn discard(&self, info: &Connection) {
        tracing::debug!(connection_id = info.id, authority = %info.authority, "upstream connection closed");
        if let Err(err) = self.archive.update_connection(&info.to_info(true)) {
            tracing::debug!(connection_id = info.id, error = %err, "failed to archive connection");
        }
    }
}

#[derive(Debug, Default)]
struct ConnectFailures {
    count: u32,
    last: Option<Instant>,
}

pub struct Http11Pool {
    key: PoolKey,
    settings: UpstreamSettings,
    checkin: Checkin,
    failures: std::sync::Mutex<ConnectFailures>,
}

impl Http11Pool {
    fn new(key: PoolKey, settings: UpstreamSettings, archive: Arc<dyn ArchiveWriter>) -> Self {
        let checkin = Checkin {
            idle: Arc::new(Mutex::new(VecDeque::new())),
            max_idle: settings.max_idle_per_authority,
            archive,
        };
        Self {
            key,
            settings,
            checkin,
            failures: std::sync::Mutex::new(ConnectFailures::default()),
        }
    }

    async fn checkout(&self) -> Option<PooledConnection> {
        let mut idle = self.checkin.idle.lock().await;
        while let Some(connection) = idle.pop_back() {
            if connection.idle_since.elapsed() < self.settings.idle_timeout {
                return Some(connection);
            }
            self.checkin.discard(&connection.info);
        }
        None
    }

    fn label(&self) -> String {
        self.key.authority.to_string()
    }

    fn check_failures(&self) -> Result<(), PoolError> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let backing_off = failures
            .last
            .is_some_and(|last| last.elapsed() < CONNECT_FAILURE_BACKOFF);
        if failures.count >= CONNECT_FAILURE_LIMIT && backing_off {
            return Err(PoolError::Terminal(format!(
                "{} failed {} connects in a row",
                self.label(),
                failures.count
            )));
        }
        Ok(())
    }

    fn record_connect(&self, success: bool) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        if success {
            *failures = ConnectFailures::default();
        } else {
            failures.count += 1;
            failures.last = Some(Instant::now());
        }
    }

    async fn connect(
        &self,
        context: &ExchangeContext,
        token: &CancellationToken,
    ) -> Result<PooledConnection, PoolError> {
        self.check_failures()?;
        let connect = TcpStream::connect((self.key.remote_host.as_str(), self.key.remote_port));
        let result = tokio::select! {
            _ = token.cancelled() => return Err(PoolError::Cancelled),
            result = tokio::time::timeout(self.settings.connect_timeout, connect) => result,
        };
        let tcp = match result {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(err)) => return Err(self.connect_failed(err.to_string())),
            Err(_) => return Err(self.connect_failed("timed out".to_string())),
        };
        self.record_connect(true);
        let _ = tcp.set_nodelay(true);

        let mut info = Connection::new(self.key.authority.clone());
        info.local_addr = tcp.local_addr().ok();
        info.remote_addr = tcp.peer_addr().ok();

        let io: Box<dyn ByteStream> = if self.key.authority.secure {
            let tls = self.handshake(tcp, context).await?;
            info.alpn = tls
                .ssl()
                .selected_alpn_protocol()
                .map(|protocol| String::from_utf8_lossy(protocol).to_string());
            info.tls_version = Some(tls.ssl().version_str().to_string());
            Box::new(tls)
        } else {
            Box::new(tcp)
        };
        tracing::debug!(
            connection_id = info.id,
            authority = %info.authority,
            remote = ?info.remote_addr,
            "upstream connection opened"
        );
        Ok(PooledConnection {
            stream: MessageStream::new(io, self.settings.limits),
            info,
            idle_since: Instant::now(),
        })
    }

    fn connect_failed(&self, message: String) -> PoolError {
        self.record_connect(false);
        PoolError::Connect {
            authority: self.label(),
            message,
        }
    }

    async fn handshake(
        &self,
        tcp: TcpStream,
        context: &ExchangeContext,
    ) -> Result<SslStream<TcpStream>, PoolError> {
        let tls_error = |message: String| PoolError::Tls {
            authority: self.label(),
            message,
        };
        let config = ClientTlsConfig {
            versions: context.ssl_protocols,
            skip_verify: context.skip_remote_certificate_validation,
            alpn: context
                .alpn
                .clone()
                .unwrap_or_else(|| vec!["http/1.1".to_string()]),
            client_certificate: context.client_certificates.first().cloned(),
        };
        let connector = build_connector(&config).map_err(|err| tls_error(err.to_string()))?;
        let ssl = connector
            .configure()
            .map_err(|err| tls_error(err.to_string()))?
            .verify_hostname(!config.skip_verify)
            .into_ssl(&self.key.authority.host)
            .map_err(|err| tls_error(err.to_string()))?;
        let mut stream = SslStream::new(ssl, tcp).map_err(|err| tls_error(err.to_string()))?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|err| tls_error(err.to_string()))?;
        Ok(stream)
    }
}

#[async_trait]
impl ConnectionPool for Http11Pool {
    fn authority(&self) -> &Authority {
        &self.key.authority
    }

    async fn send(
        &self,
        exchange: &mut Exchange,
        context: &ExchangeContext,
        token: &CancellationToken,
    ) -> Result<(), PoolError> {
        let idle = if context.force_new_connection {
            None
        } else {
            self.checkout().await
        };
        let reused = idle.is_some();
        let mut connection = match idle {
            Some(connection) => connection,
            None => self.connect(context, token).await?,
        };
        // A reused connection failing before any response byte lost a race
        // with the server closing it.
        let lost = |err: PoolError| {
            if reused {
                PoolError::ConnectionClosedConcurrently
            } else {
                err
            }
        };

        let head = exchange.request.head.to_bytes();
        let body = exchange
            .request
            .body
            .as_ref()
            .and_then(Body::as_full)
            .cloned()
            .unwrap_or_default();
        let written: io::Result<()> = async {
            connection.stream.write_all(&head).await?;
            if !body.is_empty() {
                connection.stream.write_all(&body).await?;
            }
            connection.stream.flush().await
        }
        .await;
        if let Err(err) = written {
            self.checkin.discard(&connection.info);
            return Err(lost(PoolError::Io(err)));
        }
        exchange.metrics.sent_to_remote = Some(Utc::now());

        let head = loop {
            let read = tokio::select! {
                _ = token.cancelled() => return Err(PoolError::Cancelled),
                read = connection.stream.read_response_head() => read,
            };
            match read {
                Ok(Some(head)) if head.status_code() / 100 == 1 && head.status_code() != 101 => {
                    continue;
                }
                Ok(Some(head)) => break head,
                Ok(None) => {
                    self.checkin.discard(&connection.info);
                    return Err(lost(PoolError::Protocol(
                        "upstream closed before responding".to_string(),
                    )));
                }
                Err(ProxyError::Io(err)) if is_disconnect(&err) => {
                    self.checkin.discard(&connection.info);
                    return Err(lost(PoolError::Io(err)));
                }
                Err(ProxyError::Io(err)) => {
                    self.checkin.discard(&connection.info);
                    return Err(PoolError::Io(err));
                }
                Err(err) => {
                    self.checkin.discard(&connection.info);
                    return Err(PoolError::Protocol(err.to_string()));
                }
            }
        };
        exchange.metrics.response_header_received = Some(Utc::now());
        connection.info.exchange_count += 1;
        exchange.connection = Some(connection.info.clone());

        if head.status_code() == 101 {
            let (io, buffered) = connection.stream.into_parts();
            exchange.response.head = Some(head);
            exchange.response.body = None;
            exchange.response.upgrade = Some(Upgraded { io, buffered });
            return Ok(());
        }

        let method = exchange.request.head.method().to_string();
        let framing = head.body_framing(&method);
        let reusable = !exchange.request.head.connection_close()
            && !head.connection_close()
            && framing != BodyFraming::CloseDelimited;
        exchange.response.head = Some(head);

        if framing == BodyFraming::Empty {
            exchange.response.body = Some(Body::empty());
            self.checkin.put(connection, reusable).await;
            return Ok(());
        }
        let (sender, receiver) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        exchange.response.body = Some(Body::Stream(receiver));
        tokio::spawn(stream_body(
            connection,
            framing,
            sender,
            reusable,
            self.checkin.clone(),
        ));
        Ok(())
    }
}

/// Forwards a response body and hands the connection back once the message
/// is complete.
async fn stream_body(
    mut connection: PooledConnection,
    framing: BodyFraming,
    sender: mpsc::Sender<io::Result<bytes::Bytes>>,
    reusable: bool,
    checkin: Checkin,
) {
    let mut decoder = BodyDecoder::new(framing);
    loop {
        match connection.stream.next_body_chunk(&mut decoder).await {
            Ok(Some(chunk)) => {
                if sender.send(Ok(chunk)).await.is_err() {
                    checkin.discard(&connection.info);
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let err = match err {
                    ProxyError::Io(err) => err,
                    other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
                };
                let _ = sender.send(Err(err)).await;
                checkin.discard(&connection.info);
                return;
            }
        }
    }
    // Back in the idle list before the reader sees the end of the body.
    checkin.put(connection, reusable).await;
    drop(sender);
}
