use std::net::SocketAddr;
use std::sync::Arc;

use tapwire_archive::ArchiveWriter;
use tapwire_net::{CaMaterialPaths, CertCache, load_or_generate_ca};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::breakpoint::BreakPointManager;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{BreakPointEvents, event_channel};
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::rules::{RuleEngine, RuleSet};
use crate::sniff::{CaCertificateProvider, TlsImpersonator};
use crate::upstream::{Http11PoolProvider, UpstreamSettings};

const BREAKPOINT_EVENT_CAPACITY: usize = 256;

/// Listener plus everything shared by its connection tasks.
pub struct Proxy {
    config: ProxyConfig,
    orchestrator: Arc<Orchestrator>,
    breakpoints: Arc<BreakPointManager>,
    token: CancellationToken,
    ca_paths: Option<CaMaterialPaths>,
}

impl Proxy {
    /// Wires the default pool and, when decryption is on, the root CA and
    /// leaf cache. Breakpoint events arrive on the returned stream.
    pub fn new(
        config: ProxyConfig,
        rules: RuleSet,
        archive: Arc<dyn ArchiveWriter>,
    ) -> Result<(Self, BreakPointEvents), ProxyError> {
        let token = CancellationToken::new();
        let (sender, events) = event_channel(BREAKPOINT_EVENT_CAPACITY);
        let breakpoints = Arc::new(BreakPointManager::new(token.clone(), Some(sender)));
        let engine = RuleEngine::new(rules, Arc::clone(&breakpoints));
        let pools = Arc::new(Http11PoolProvider::new(
            UpstreamSettings::from_config(&config.pool, config.limits.to_limits()),
            Arc::clone(&archive),
        ));
        let mut orchestrator = Orchestrator::new(engine, pools, archive, token.clone())
            .with_settings(OrchestratorSettings::from_config(&config));

        let mut ca_paths = None;
        if config.tls.decrypt {
            let (ca, paths) =
                load_or_generate_ca(&config.tls.ca_cert_dir, &config.tls.ca_common_name)
                    .map_err(|err| ProxyError::Config(err.to_string()))?;
            tracing::info!(cert = %paths.cert_path.display(), "root CA ready");
            let cache =
                CertCache::with_disk_path(config.tls.leaf_cache_size, &config.tls.leaf_cert_dir);
            let provider = Arc::new(CaCertificateProvider::new(ca, cache));
            orchestrator = orchestrator
                .with_impersonator(TlsImpersonator::new(provider, config.tls.allow_legacy));
            ca_paths = Some(paths);
        }

        Ok((
            Self {
                config,
                orchestrator: Arc::new(orchestrator),
                breakpoints,
                token,
                ca_paths,
            },
            events,
        ))
    }

    pub fn breakpoints(&self) -> &Arc<BreakPointManager> {
        &self.breakpoints
    }

    pub fn ca_paths(&self) -> Option<&CaMaterialPaths> {
        self.ca_paths.as_ref()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn run(&self) -> Result<(), ProxyError> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| ProxyError::Runtime(format!("bind {addr}: {err}")))?;
        self.serve(listener).await
    }

    /// Accepts until [`Proxy::shutdown`] is called. Each connection runs in
    /// its own task and unwinds at its next await once the token fires.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ProxyError> {
        let local = listener.local_addr()?;
        tracing::info!(%local, "proxy listening");
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let orchestrator = Arc::clone(&self.orchestrator);
            let token = self.token.clone();
            tokio::spawn(async move {
                tracing::debug!(%peer, "connection accepted");
                let result = tokio::select! {
                    _ = token.cancelled() => Err(ProxyError::Cancelled),
                    result = orchestrator.serve(stream) => result,
                };
                log_outcome(peer, result);
            });
        }
        tracing::info!(%local, "proxy stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.token.cancel();
        self.breakpoints.continue_all();
    }
}

fn log_outcome(peer: SocketAddr, result: Result<(), ProxyError>) {
    match result {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(err) if err.is_benign() => tracing::debug!(%peer, error = %err, "connection ended"),
        Err(
            err @ (ProxyError::Pool(_)
            | ProxyError::TlsHandshake { .. }
            | ProxyError::Parse(_)
            | ProxyError::Socks(_)),
        ) => tracing::warn!(%peer, error = %err, "connection failed"),
        Err(err) => tracing::error!(%peer, error = %err, "connection task failed"),
    }
}
