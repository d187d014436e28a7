use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tapwire_net::{TlsVersion, TlsVersionRange};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::ExchangeContext;
use crate::error::PoolError;
use crate::exchange::{Authority, Exchange};

/// Sends exchanges to one upstream destination.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn authority(&self) -> &Authority;

    /// Writes the request and fills `exchange.response` with the head and a
    /// body that is still streaming.
    async fn send(
        &self,
        exchange: &mut Exchange,
        context: &ExchangeContext,
        token: &CancellationToken,
    ) -> Result<(), PoolError>;
}

#[async_trait]
pub trait PoolProvider: Send + Sync {
    async fn get_pool(
        &self,
        exchange: &Exchange,
        context: &ExchangeContext,
        token: &CancellationToken,
    ) -> Result<Arc<dyn ConnectionPool>, PoolError>;
}

/// Hook given one chance to adjust the context after a send failed for a
/// reason other than a pool race.
pub trait RequalificationPolicy: Send + Sync {
    /// Returns `true` when the context changed and the send is worth
    /// repeating.
    fn requalify(&self, error: &PoolError, context: &mut ExchangeContext) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoRequalification;

impl RequalificationPolicy for NoRequalification {
    fn requalify(&self, _error: &PoolError, _context: &mut ExchangeContext) -> bool {
        false
    }
}

/// Retries a failed upstream handshake capped at TLS 1.2 over HTTP/1.1,
/// unless a rule already pinned the version.
#[derive(Debug, Clone, Copy, Default)]
pub struct DowngradeTlsPolicy;

impl RequalificationPolicy for DowngradeTlsPolicy {
    fn requalify(&self, error: &PoolError, context: &mut ExchangeContext) -> bool {
        if !matches!(error, PoolError::Tls { .. }) || !context.ssl_protocols.is_unbounded() {
            return false;
        }
        context.ssl_protocols = TlsVersionRange {
            min: None,
            max: Some(TlsVersion::Tls12),
        };
        context.alpn = Some(vec!["http/1.1".to_string()]);
        context.force_new_connection = true;
        true
    }
}

/// Sends an exchange, absorbing races with pooled connections that close
/// while being reused. Races are retried until the pool reports a terminal
/// error or `race_timeout` runs out.
pub async fn send_with_retry(
    provider: &dyn PoolProvider,
    policy: &dyn RequalificationPolicy,
    exchange: &mut Exchange,
    context: &mut ExchangeContext,
    race_timeout: Duration,
    token: &CancellationToken,
) -> Result<(), PoolError> {
    let deadline = Instant::now() + race_timeout;
    let mut requalified = false;
    let mut races = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let result = match provider.get_pool(exchange, context, token).await {
            Ok(pool) => pool.send(exchange, context, token).await,
            Err(err) => Err(err),
        };
        let error = match result {
            Ok(()) => {
                if races > 0 {
                    tracing::debug!(exchange_id = exchange.id, races, "sent after pool races");
                }
                return Ok(());
            }
            Err(error) => error,
        };
        match error {
            PoolError::ConnectionClosedConcurrently => {
                races += 1;
                tracing::debug!(
                    exchange_id = exchange.id,
                    authority = %exchange.authority,
                    races,
                    "pooled connection closed during reuse, retrying"
                );
                if Instant::now() >= deadline {
                    return Err(PoolError::RaceTimeout(race_timeout));
                }
                tokio::task::yield_now().await;
            }
            PoolError::Terminal(_) | PoolError::Cancelled => return Err(error),
            error => {
                if requalified || !policy.requalify(&error, context) {
                    return Err(error);
                }
                requalified = true;
                tracing::debug!(
                    exchange_id = exchange.id,
                    error = %error,
                    "requalified upstream settings, retrying once"
                );
            }
        }
    }
}
