use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use openssl::ssl::{ErrorCode, Ssl};
use tapwire_net::{
    CaCertificate, CertCache, LeafCertificate, TlsConfig, TlsError, TlsVersionRange,
    build_acceptor, generate_leaf_cert, wildcard_domain,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_openssl::SslStream;

use crate::error::{ProxyError, is_disconnect};

const TLS_HANDSHAKE_RECORD: u8 = 0x16;
const SOCKS5_GREETING: u8 = 0x05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tls,
    Socks5,
    Http,
}

pub fn classify(first: u8) -> StreamKind {
    match first {
        TLS_HANDSHAKE_RECORD => StreamKind::Tls,
        SOCKS5_GREETING => StreamKind::Socks5,
        _ => StreamKind::Http,
    }
}

/// Stream that serves already-read bytes before reading from `inner`.
#[derive(Debug)]
pub struct Replay<S> {
    pre: Option<Bytes>,
    inner: S,
}

impl<S> Replay<S> {
    pub fn new(inner: S) -> Self {
        Self { pre: None, inner }
    }

    pub fn new_buffered(inner: S, pre: Bytes) -> Self {
        Self {
            pre: (!pre.is_empty()).then_some(pre),
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> (S, Bytes) {
        (self.inner, self.pre.unwrap_or_default())
    }
}

impl<S> AsyncRead for Replay<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut pre) = self.pre.take() {
            if !pre.is_empty() {
                let len = pre.len().min(buf.remaining());
                buf.put_slice(&pre[..len]);
                pre.advance(len);
                if !pre.is_empty() {
                    self.pre = Some(pre);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for Replay<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Reads one byte and classifies the stream. The byte is replayed to the
/// next reader.
pub async fn sniff<S>(mut stream: S) -> Result<(StreamKind, Replay<S>), ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut first = [0u8; 1];
    let read = match stream.read(&mut first).await {
        Ok(read) => read,
        Err(err) if is_disconnect(&err) => return Err(ProxyError::ClientClosed),
        Err(err) => return Err(err.into()),
    };
    if read == 0 {
        return Err(ProxyError::ClientClosed);
    }
    let kind = classify(first[0]);
    Ok((kind, Replay::new_buffered(stream, Bytes::copy_from_slice(&first))))
}

/// Supplies the leaf certificate presented to clients for a host.
pub trait CertificateProvider: Send + Sync {
    fn certificate_for(&self, host: &str) -> Result<LeafCertificate, TlsError>;
}

/// Signs leaf certificates with one root CA and caches them by
/// [`wildcard_domain`].
pub struct CaCertificateProvider {
    ca: CaCertificate,
    cache: Mutex<CertCache>,
}

impl CaCertificateProvider {
    pub fn new(ca: CaCertificate, cache: CertCache) -> Self {
        Self {
            ca,
            cache: Mutex::new(cache),
        }
    }

    pub fn ca(&self) -> &CaCertificate {
        &self.ca
    }

    pub fn cached(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CertificateProvider for CaCertificateProvider {
    fn certificate_for(&self, host: &str) -> Result<LeafCertificate, TlsError> {
        let domain = wildcard_domain(host);
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cert) = cache.get(&domain) {
            return Ok(cert);
        }
        let cert = generate_leaf_cert(host, &self.ca)?;
        if let Err(err) = cache.persist(&domain, &cert) {
            tracing::warn!(%domain, error = %err, "failed to persist leaf certificate");
        }
        cache.insert(domain, cert.clone());
        Ok(cert)
    }
}

/// Server side of the decrypted leg: answers the client's handshake with a
/// certificate for the host it asked for.
#[derive(Clone)]
pub struct TlsImpersonator {
    provider: Arc<dyn CertificateProvider>,
    allow_legacy: bool,
}

impl TlsImpersonator {
    pub fn new(provider: Arc<dyn CertificateProvider>, allow_legacy: bool) -> Self {
        Self {
            provider,
            allow_legacy,
        }
    }

    pub async fn accept<S>(
        &self,
        host: &str,
        stream: S,
        versions: TlsVersionRange,
    ) -> Result<SslStream<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handshake_error = |message: String| ProxyError::TlsHandshake {
            host: host.to_string(),
            message,
        };
        let leaf = self
            .provider
            .certificate_for(host)
            .map_err(|err| handshake_error(err.to_string()))?;
        let acceptor = build_acceptor(
            &TlsConfig {
                allow_legacy: self.allow_legacy,
                versions,
            },
            &leaf,
        )
        .map_err(|err| handshake_error(err.to_string()))?;
        let ssl = Ssl::new(acceptor.context()).map_err(|err| handshake_error(err.to_string()))?;
        let mut tls = SslStream::new(ssl, stream).map_err(|err| handshake_error(err.to_string()))?;

        match Pin::new(&mut tls).accept().await {
            Ok(()) => Ok(tls),
            Err(err) if peer_closed(&err) => Err(ProxyError::ClientClosed),
            Err(err) => Err(handshake_error(err.to_string())),
        }
    }
}

fn peer_closed(err: &openssl::ssl::Error) -> bool {
    if let Some(io) = err.io_error() {
        return is_disconnect(io);
    }
    if err.code() == ErrorCode::ZERO_RETURN || err.code() == ErrorCode::SYSCALL {
        return true;
    }
    err.ssl_error().is_some_and(|stack| {
        stack
            .errors()
            .iter()
            .any(|error| error.reason() == Some("unexpected eof while reading"))
    })
}
