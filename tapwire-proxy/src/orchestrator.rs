use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use tapwire_archive::{ArchiveWriter, BodyLimits, BodyTee, ExchangeState};
use tapwire_net::{
    BodyFraming, HeaderList, HttpVersion, LAST_CHUNK, Limits, METHOD_NO_AUTH,
    METHOD_NONE_ACCEPTABLE, ParseErrorKind, RequestHead, ResponseHead, SocksAddress,
    SocksCommand, SocksParseStatus, SocksReply, build_method_selection, build_reply,
    default_reason, encode_chunk, parse_greeting, parse_request,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::breakpoint::{
    BreakPointLocation, BreakPointManager, BreakPointModel, EditError, apply_connection_setup,
    apply_request_edit, apply_response_edit, connection_setup_snapshot, request_snapshot,
    response_snapshot,
};
use crate::config::ProxyConfig;
use crate::context::ExchangeContext;
use crate::error::{PoolError, ProxyError, is_disconnect};
use crate::exchange::{Authority, Body, ByteStream, Connection, Exchange, Upgraded, resolve_agent};
use crate::pool::{DowngradeTlsPolicy, PoolProvider, RequalificationPolicy, send_with_retry};
use crate::rules::{FilterScope, RuleEngine, ScopeTracker};
use crate::sniff::{Replay, StreamKind, TlsImpersonator, sniff};
use crate::wire::MessageStream;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const SOCKS_READ_CHUNK: usize = 512;

type ClientStream = MessageStream<Box<dyn ByteStream>>;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub limits: Limits,
    pub body_limits: BodyLimits,
    pub resolve_user_agents: bool,
    pub race_timeout: Duration,
    /// Used for blind tunnels, which bypass the pool.
    pub connect_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            limits: config.limits.to_limits(),
            body_limits: config.archive.body_limits,
            resolve_user_agents: config.resolve_user_agents,
            race_timeout: config.pool.race_timeout(),
            connect_timeout: config.pool.connect_timeout(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

enum Next {
    KeepAlive,
    Close,
}

/// How a response body goes out on the downstream leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    None,
    Raw,
    Chunked,
    UntilClose,
}

enum BodyFailure {
    Upstream(io::Error),
    Downstream(io::Error),
}

/// Drives downstream connections: entry protocol, rule passes, breakpoints,
/// upstream dispatch and response streaming.
pub struct Orchestrator {
    engine: RuleEngine,
    pools: Arc<dyn PoolProvider>,
    policy: Arc<dyn RequalificationPolicy>,
    archive: Arc<dyn ArchiveWriter>,
    impersonator: Option<TlsImpersonator>,
    settings: OrchestratorSettings,
    token: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        engine: RuleEngine,
        pools: Arc<dyn PoolProvider>,
        archive: Arc<dyn ArchiveWriter>,
        token: CancellationToken,
    ) -> Self {
        Self {
            engine,
            pools,
            policy: Arc::new(DowngradeTlsPolicy),
            archive,
            impersonator: None,
            settings: OrchestratorSettings::default(),
            token,
        }
    }

    /// Without an impersonator every tunnel is relayed blind.
    pub fn with_impersonator(mut self, impersonator: TlsImpersonator) -> Self {
        self.impersonator = Some(impersonator);
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn RequalificationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    /// Serves one accepted downstream connection until it closes.
    pub async fn serve<S>(&self, stream: S) -> Result<(), ProxyError>
    where
        S: ByteStream + 'static,
    {
        let (kind, stream) = sniff(stream).await?;
        match kind {
            StreamKind::Socks5 => self.serve_socks(stream).await,
            StreamKind::Http => self.serve_http(Box::new(stream)).await,
            StreamKind::Tls => Err(ProxyError::TlsHandshake {
                host: "unknown".to_string(),
                message: "client hello without a CONNECT or SOCKS5 authority".to_string(),
            }),
        }
    }

    async fn serve_http(&self, stream: Box<dyn ByteStream>) -> Result<(), ProxyError> {
        let mut client = MessageStream::new(stream, self.settings.limits);
        let Some(connect) = self.run_exchanges(&mut client, None).await? else {
            return Ok(());
        };
        let Some(authority) = Authority::parse(&connect.line.target, true) else {
            write_plain(&mut client, 400, "invalid CONNECT target").await?;
            return Ok(());
        };
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
        let (io, buffered) = client.into_parts();
        self.tunnel(Box::new(Replay::new_buffered(io, buffered)), authority)
            .await
    }

    async fn serve_socks<S>(&self, mut stream: S) -> Result<(), ProxyError>
    where
        S: ByteStream + 'static,
    {
        let mut buffer = BytesMut::new();
        let greeting = read_socks(&mut stream, &mut buffer, parse_greeting).await?;
        if !greeting.offers(METHOD_NO_AUTH) {
            stream
                .write_all(&build_method_selection(METHOD_NONE_ACCEPTABLE))
                .await?;
            return Ok(());
        }
        stream
            .write_all(&build_method_selection(METHOD_NO_AUTH))
            .await?;

        let request = read_socks(&mut stream, &mut buffer, parse_request).await?;
        let unbound = SocksAddress::IpV4([0; 4]);
        if request.command != SocksCommand::Connect {
            tracing::debug!(command = ?request.command, "unsupported socks5 command");
            stream
                .write_all(&build_reply(SocksReply::CommandNotSupported, &unbound, 0))
                .await?;
            return Ok(());
        }
        stream
            .write_all(&build_reply(SocksReply::Succeeded, &unbound, 0))
            .await?;
        stream.flush().await?;
        let authority = Authority::new(request.address.host(), request.port, request.port == 443);
        self.tunnel(
            Box::new(Replay::new_buffered(stream, buffer.freeze())),
            authority,
        )
        .await
    }

    async fn tunnel(
        &self,
        stream: Box<dyn ByteStream>,
        mut authority: Authority,
    ) -> Result<(), ProxyError> {
        let mut context = ExchangeContext::new(authority.clone());
        self.engine
            .enforce(&mut context, None, None, FilterScope::OnAuthorityReceived)?;
        if context.abort {
            tracing::debug!(%authority, "tunnel aborted by rule");
            return Ok(());
        }
        let impersonator = match &self.impersonator {
            Some(impersonator) if !context.blind_mode => impersonator,
            _ => return self.blind_tunnel(stream, &context).await,
        };

        let (kind, stream) = sniff(stream).await?;
        let stream: Box<dyn ByteStream> = if kind == StreamKind::Tls {
            authority.secure = true;
            let tls = impersonator
                .accept(&authority.host, stream, context.proxy_tls_protocols)
                .await?;
            Box::new(tls)
        } else {
            authority.secure = false;
            Box::new(stream)
        };
        tracing::debug!(%authority, secure = authority.secure, "tunnel opened");
        context.authority = authority;

        let mut client = MessageStream::new(stream, self.settings.limits);
        if let Some(connect) = self.run_exchanges(&mut client, Some(&context)).await? {
            tracing::debug!(target = %connect.line.target, "nested CONNECT refused");
            write_plain(&mut client, 400, "CONNECT inside a tunnel is not supported").await?;
        }
        Ok(())
    }

    async fn blind_tunnel(
        &self,
        mut client: Box<dyn ByteStream>,
        context: &ExchangeContext,
    ) -> Result<(), ProxyError> {
        let failed = |message: String| PoolError::Connect {
            authority: context.authority.to_string(),
            message,
        };
        let connect = TcpStream::connect((context.remote_host(), context.remote_port()));
        let mut upstream = match tokio::time::timeout(self.settings.connect_timeout, connect).await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => return Err(failed(err.to_string()).into()),
            Err(_) => return Err(failed("timed out".to_string()).into()),
        };
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::debug!(authority = %context.authority, sent, received, "blind tunnel closed");
                Ok(())
            }
            Err(err) if is_disconnect(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Serves requests until the connection ends. A CONNECT request is
    /// handed back to the caller.
    async fn run_exchanges(
        &self,
        client: &mut ClientStream,
        tunnel: Option<&ExchangeContext>,
    ) -> Result<Option<RequestHead>, ProxyError> {
        loop {
            let head = match client.read_request_head().await {
                Ok(Some(head)) => head,
                Ok(None) => return Ok(None),
                Err(ProxyError::Io(err)) => {
                    tracing::debug!(error = %err, "downstream closed between requests");
                    return Ok(None);
                }
                Err(ProxyError::Parse(err)) => {
                    let _ = write_plain(client, 400, "malformed request").await;
                    return Err(err.into());
                }
                Err(err) => return Err(err),
            };
            if head.is_connect() {
                return Ok(Some(head));
            }
            if let Next::Close = self.handle_exchange(client, head, tunnel).await? {
                return Ok(None);
            }
        }
    }

    async fn handle_exchange(
        &self,
        client: &mut ClientStream,
        mut head: RequestHead,
        tunnel: Option<&ExchangeContext>,
    ) -> Result<Next, ProxyError> {
        let tunnel_authority = tunnel.map(|context| &context.authority);
        let Some(authority) = Authority::from_request(&mut head, tunnel_authority) else {
            write_plain(client, 400, "request has no usable host").await?;
            return Ok(Next::Close);
        };
        let (mut context, mut scopes) = match tunnel {
            Some(tunnel) => (
                tunnel.for_exchange(authority.clone()),
                ScopeTracker::after(FilterScope::OnAuthorityReceived),
            ),
            None => (ExchangeContext::new(authority.clone()), ScopeTracker::new()),
        };
        // The client frames its body by the head it sent, whatever rules or
        // edits later do to that head.
        let framing = head.body_framing();
        let expects_continue = head.expects_continue();
        let mut exchange = Exchange::new(authority, head);
        let _release = Release {
            manager: self.engine.breakpoints(),
            exchange_id: exchange.id,
        };
        let mut should_close = exchange.request.head.connection_close();
        if self.settings.resolve_user_agents {
            exchange.agent = exchange
                .request
                .head
                .header("user-agent")
                .and_then(resolve_agent);
        }
        tracing::debug!(
            exchange_id = exchange.id,
            method = exchange.request.head.method(),
            authority = %exchange.authority,
            target = %exchange.request.head.line.target,
            "exchange started"
        );
        self.archive_exchange(&exchange, ExchangeState::Pending);

        if tunnel.is_none() {
            self.enforce(&mut scopes, &mut context, &mut exchange, FilterScope::OnAuthorityReceived)?;
        }
        self.enforce(
            &mut scopes,
            &mut context,
            &mut exchange,
            FilterScope::RequestHeaderReceivedFromClient,
        )?;
        if context.abort {
            self.fail(&mut exchange, "aborted by rule");
            return Ok(Next::Close);
        }
        if let Some(breakpoint) = context.breakpoint.clone() {
            breakpoint
                .wait_for_edit(connection_setup_snapshot(&context), |model| {
                    apply_connection_setup(&mut context, model)
                })
                .await
                .map_err(edit_failed)?;
            breakpoint
                .wait_for_edit(request_snapshot(&exchange), |model| {
                    apply_request_edit(&mut exchange, &mut context, model)
                })
                .await
                .map_err(edit_failed)?;
        }
        context.apply_request_alterations(&mut exchange.request.head);

        if expects_continue {
            exchange.request.head.remove_header("expect");
            client.write_all(CONTINUE).await?;
            client.flush().await?;
        }
        let body = match client
            .read_body(framing, self.settings.limits.max_body_bytes)
            .await
        {
            Ok(body) => body,
            Err(ProxyError::Parse(err)) if err.kind == ParseErrorKind::BodyTooLarge => {
                self.respond_error(client, &mut exchange, 413, "request body too large")
                    .await;
                return Ok(Next::Close);
            }
            Err(err) => {
                self.fail(&mut exchange, err.to_string());
                return Err(err);
            }
        };
        let overridden = context.request_body_override.is_some();
        let body = context.request_body_override.take().unwrap_or(body);
        if framing != BodyFraming::Empty || overridden || !body.is_empty() {
            let head = &mut exchange.request.head;
            head.remove_header("transfer-encoding");
            head.set_header("Content-Length", &body.len().to_string());
        }
        exchange.request_body_size = body.len() as u64;
        if !body.is_empty() {
            self.tee_request(&mut exchange, &body).await;
        }
        exchange.request.body = Some(Body::Full(body));

        self.enforce(
            &mut scopes,
            &mut context,
            &mut exchange,
            FilterScope::RequestBodyReceivedFromClient,
        )?;
        if context.abort {
            self.fail(&mut exchange, "aborted by rule");
            return Ok(Next::Close);
        }
        context.apply_request_alterations(&mut exchange.request.head);

        if let Some(response) = context.pre_made_response.take() {
            exchange.metrics.response_header_received = Some(Utc::now());
            exchange.response.head = Some(response.head);
            exchange.response.body = Some(Body::Full(response.body));
        } else if let Err(err) = send_with_retry(
            self.pools.as_ref(),
            self.policy.as_ref(),
            &mut exchange,
            &mut context,
            self.settings.race_timeout,
            &self.token,
        )
        .await
        {
            if matches!(err, PoolError::Cancelled) {
                self.fail(&mut exchange, err.to_string());
                return Err(ProxyError::Cancelled);
            }
            self.respond_error(client, &mut exchange, 502, &err.to_string())
                .await;
            return Err(err.into());
        }

        if let Some(upgraded) = exchange.response.upgrade.take() {
            return self.relay_upgrade(client, &mut exchange, upgraded).await;
        }
        let Some(head) = exchange.response.head.as_ref() else {
            self.respond_error(client, &mut exchange, 502, "upstream produced no response")
                .await;
            return Ok(Next::Close);
        };
        let upstream_framing = head.body_framing(exchange.request.head.method());

        self.enforce(
            &mut scopes,
            &mut context,
            &mut exchange,
            FilterScope::ResponseHeaderReceivedFromRemote,
        )?;
        if let Some(breakpoint) = context.breakpoint.clone() {
            if breakpoint.is_armed(BreakPointLocation::ResponseHeader) {
                if let Err(err) = self.buffer_response(&mut exchange).await {
                    tracing::warn!(exchange_id = exchange.id, error = %err, "upstream body failed");
                    self.respond_error(client, &mut exchange, 502, &err.to_string())
                        .await;
                    return Ok(Next::Close);
                }
                if let Some(snapshot) = response_snapshot(&exchange) {
                    breakpoint
                        .wait_for_edit(snapshot, |model| apply_response_edit(&mut exchange, model))
                        .await
                        .map_err(edit_failed)?;
                }
            }
        }

        let Some(mut response_head) = exchange.response.head.take() else {
            self.respond_error(client, &mut exchange, 502, "upstream produced no response")
                .await;
            return Ok(Next::Close);
        };
        context.apply_response_alterations(&mut response_head);
        let encoding = prepare_response_head(
            &mut response_head,
            exchange.request.head.method(),
            upstream_framing,
            exchange.response.body.as_ref(),
        );
        should_close |= encoding == Encoding::UntilClose || response_head.connection_close();
        let head_bytes = response_head.to_bytes();
        exchange.response.head = Some(response_head);
        if let Err(err) = client.write_all(&head_bytes).await {
            tracing::debug!(exchange_id = exchange.id, error = %err, "downstream gone before response");
            self.fail(&mut exchange, "client disconnected");
            return Ok(Next::Close);
        }

        match self.copy_response_body(client, &mut exchange, encoding).await {
            Ok(()) => {}
            Err(BodyFailure::Downstream(err)) => {
                tracing::debug!(exchange_id = exchange.id, error = %err, "downstream gone during response");
                self.fail(&mut exchange, "client disconnected");
                return Ok(Next::Close);
            }
            Err(BodyFailure::Upstream(err)) => {
                tracing::warn!(exchange_id = exchange.id, error = %err, "upstream body failed");
                self.fail(&mut exchange, err.to_string());
                return Ok(Next::Close);
            }
        }

        self.enforce(
            &mut scopes,
            &mut context,
            &mut exchange,
            FilterScope::ResponseBodyReceivedFromRemote,
        )?;
        if let Some(breakpoint) = context.breakpoint.clone() {
            breakpoint
                .wait_for_edit(BreakPointModel::EndPoint, |_| Ok(()))
                .await
                .map_err(edit_failed)?;
        }

        exchange.metrics.completed = Some(Utc::now());
        self.archive_exchange(&exchange, ExchangeState::Completed);
        if let Some(connection) = &exchange.connection {
            self.archive_connection(connection);
        }
        tracing::debug!(
            exchange_id = exchange.id,
            status = exchange.response.head.as_ref().map(ResponseHead::status_code),
            bytes = exchange.response_body_size,
            "exchange completed"
        );
        Ok(if should_close { Next::Close } else { Next::KeepAlive })
    }

    fn enforce(
        &self,
        scopes: &mut ScopeTracker,
        context: &mut ExchangeContext,
        exchange: &mut Exchange,
        scope: FilterScope,
    ) -> Result<(), ProxyError> {
        scopes.advance(scope)?;
        let connection = exchange.connection.clone();
        let fired = self
            .engine
            .enforce(context, Some(&mut *exchange), connection.as_ref(), scope)?;
        if fired > 0 {
            tracing::debug!(exchange_id = exchange.id, %scope, fired, "rules applied");
        }
        Ok(())
    }

    /// Collects a streaming response so a breakpoint edit sees a fixed body.
    async fn buffer_response(&self, exchange: &mut Exchange) -> io::Result<()> {
        if !matches!(exchange.response.body, Some(Body::Stream(_))) {
            return Ok(());
        }
        let Some(mut body) = exchange.response.body.take() else {
            return Ok(());
        };
        let max = self.settings.limits.max_body_bytes;
        let mut buffered = BytesMut::new();
        while let Some(chunk) = body.next_chunk().await {
            let chunk = chunk?;
            if buffered.len() + chunk.len() > max {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response body too large to hold at a breakpoint",
                ));
            }
            buffered.extend_from_slice(&chunk);
        }
        exchange.response.body = Some(Body::Full(buffered.freeze()));
        Ok(())
    }

    async fn copy_response_body(
        &self,
        client: &mut ClientStream,
        exchange: &mut Exchange,
        encoding: Encoding,
    ) -> Result<(), BodyFailure> {
        let body = exchange.response.body.take();
        let mut body = match body {
            Some(body) if encoding != Encoding::None => body,
            _ => return client.flush().await.map_err(BodyFailure::Downstream),
        };
        let mut tee = self.response_tee(exchange.id);
        let mut total = 0u64;
        let copied = loop {
            let chunk = match body.next_chunk().await {
                None => break Ok(()),
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => break Err(BodyFailure::Upstream(err)),
            };
            total += chunk.len() as u64;
            let tee_failed = match tee.as_mut() {
                Some(active) => active.write(&chunk).await.err(),
                None => None,
            };
            if let Some(err) = tee_failed {
                tracing::warn!(exchange_id = exchange.id, error = %err, "response archive stopped");
                tee = None;
            }
            let written = if encoding == Encoding::Chunked {
                client.write_all(&encode_chunk(&chunk)).await
            } else {
                client.write_all(&chunk).await
            };
            if let Err(err) = written {
                break Err(BodyFailure::Downstream(err));
            }
        };
        let result = match copied {
            Ok(()) => {
                let finished: io::Result<()> = async {
                    if encoding == Encoding::Chunked {
                        client.write_all(LAST_CHUNK).await?;
                    }
                    client.flush().await
                }
                .await;
                finished.map_err(BodyFailure::Downstream)
            }
            Err(failure) => Err(failure),
        };

        exchange.response_body_size = total;
        if let Some(tee) = tee {
            match tee.finish().await {
                Ok(summary) => exchange.response_body_truncated = summary.truncated,
                Err(err) => {
                    tracing::warn!(exchange_id = exchange.id, error = %err, "response archive failed")
                }
            }
        }
        result
    }

    async fn relay_upgrade(
        &self,
        client: &mut ClientStream,
        exchange: &mut Exchange,
        upgraded: Upgraded,
    ) -> Result<Next, ProxyError> {
        let Upgraded { mut io, buffered } = upgraded;
        if let Some(head) = exchange.response.head.as_ref() {
            client.write_all(&head.to_bytes()).await?;
        }
        if !buffered.is_empty() {
            client.write_all(&buffered).await?;
        }
        client.flush().await?;
        let pending = Bytes::copy_from_slice(client.buffered());
        if !pending.is_empty() {
            io.write_all(&pending).await?;
        }
        exchange.metrics.completed = Some(Utc::now());
        self.archive_exchange(exchange, ExchangeState::Completed);
        tracing::debug!(exchange_id = exchange.id, "protocol switched, relaying raw bytes");

        match tokio::io::copy_bidirectional(client.get_mut(), &mut io).await {
            Ok(_) => Ok(Next::Close),
            Err(err) if is_disconnect(&err) => Ok(Next::Close),
            Err(err) => Err(err.into()),
        }
    }

    async fn tee_request(&self, exchange: &mut Exchange, body: &Bytes) {
        let sink = match self.archive.create_request_body(exchange.id) {
            Ok(Some(sink)) => sink,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(exchange_id = exchange.id, error = %err, "request archive unavailable");
                return;
            }
        };
        let mut tee = BodyTee::new(sink, self.settings.body_limits.request_max_bytes);
        let result = async {
            tee.write(body).await?;
            tee.finish().await
        }
        .await;
        match result {
            Ok(summary) => exchange.request_body_truncated = summary.truncated,
            Err(err) => {
                tracing::warn!(exchange_id = exchange.id, error = %err, "request archive failed")
            }
        }
    }

    fn response_tee(&self, exchange_id: u64) -> Option<BodyTee> {
        match self.archive.create_response_body(exchange_id) {
            Ok(sink) => sink.map(|sink| BodyTee::new(sink, self.settings.body_limits.response_max_bytes)),
            Err(err) => {
                tracing::warn!(exchange_id, error = %err, "response archive unavailable");
                None
            }
        }
    }

    async fn respond_error(
        &self,
        client: &mut ClientStream,
        exchange: &mut Exchange,
        status: u16,
        message: &str,
    ) {
        if let Err(err) = write_plain(client, status, message).await {
            tracing::debug!(exchange_id = exchange.id, error = %err, "could not deliver error response");
        }
        exchange.response.head = Some(plain_head(status, message.len()));
        self.fail(exchange, message);
    }

    fn fail(&self, exchange: &mut Exchange, error: impl Into<String>) {
        exchange.errors.push(error.into());
        exchange.metrics.completed = Some(Utc::now());
        self.archive_exchange(exchange, ExchangeState::Failed);
    }

    fn archive_exchange(&self, exchange: &Exchange, state: ExchangeState) {
        if let Err(err) = self.archive.update_exchange(&exchange.to_info(state)) {
            tracing::warn!(exchange_id = exchange.id, error = %err, "failed to archive exchange");
        }
    }

    fn archive_connection(&self, connection: &Connection) {
        if let Err(err) = self.archive.update_connection(&connection.to_info(false)) {
            tracing::warn!(connection_id = connection.id, error = %err, "failed to archive connection");
        }
    }
}

/// Drops the exchange's breakpoint context on every exit path.
struct Release<'a> {
    manager: &'a BreakPointManager,
    exchange_id: u64,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.manager.release(self.exchange_id);
    }
}

fn edit_failed(err: EditError) -> ProxyError {
    ProxyError::Runtime(err.to_string())
}

fn bodyless(head: &ResponseHead, method: &str) -> bool {
    let status = head.status_code();
    method.eq_ignore_ascii_case("HEAD") || status / 100 == 1 || status == 204 || status == 304
}

/// Rewrites framing headers to match what will be written. Bodies that
/// arrived without a length over HTTP/2 are chunked for the HTTP/1.1 leg.
fn prepare_response_head(
    head: &mut ResponseHead,
    method: &str,
    upstream: BodyFraming,
    body: Option<&Body>,
) -> Encoding {
    let from_http2 = head.line.version == HttpVersion::Http2;
    if from_http2 {
        head.line.version = HttpVersion::Http11;
    }
    if bodyless(head, method) {
        return Encoding::None;
    }
    let length = match body {
        None => Some(0),
        Some(Body::Full(bytes)) => Some(bytes.len() as u64),
        Some(Body::Stream(_)) => match upstream {
            BodyFraming::ContentLength(length) => Some(length),
            BodyFraming::Empty => Some(0),
            BodyFraming::Chunked | BodyFraming::CloseDelimited => None,
        },
    };
    if let Some(length) = length {
        head.remove_header("transfer-encoding");
        head.set_header("Content-Length", &length.to_string());
        return if length == 0 { Encoding::None } else { Encoding::Raw };
    }
    if upstream == BodyFraming::CloseDelimited && !from_http2 {
        head.remove_header("content-length");
        return Encoding::UntilClose;
    }
    head.remove_header("content-length");
    head.set_header("Transfer-Encoding", "chunked");
    Encoding::Chunked
}

fn plain_head(status: u16, length: usize) -> ResponseHead {
    let mut head = ResponseHead::new(status, default_reason(status));
    head.append_header("Content-Type", "text/plain; charset=utf-8");
    head.append_header("Content-Length", &length.to_string());
    head.append_header("Connection", "close");
    head
}

async fn write_plain(client: &mut ClientStream, status: u16, message: &str) -> io::Result<()> {
    let mut bytes = plain_head(status, message.len()).to_bytes();
    bytes.extend_from_slice(message.as_bytes());
    client.write_all(&bytes).await?;
    client.flush().await
}

async fn read_socks<S, T>(
    stream: &mut S,
    buffer: &mut BytesMut,
    parse: fn(&[u8]) -> SocksParseStatus<T>,
) -> Result<T, ProxyError>
where
    S: AsyncRead + Unpin,
{
    loop {
        match parse(&buffer[..]) {
            SocksParseStatus::Complete { message, consumed } => {
                let _ = buffer.split_to(consumed);
                return Ok(message);
            }
            SocksParseStatus::Error { error } => return Err(error.into()),
            SocksParseStatus::NeedMore => {
                buffer.reserve(SOCKS_READ_CHUNK);
                if stream.read_buf(buffer).await? == 0 {
                    return Err(ProxyError::ClientClosed);
                }
            }
        }
    }
}
