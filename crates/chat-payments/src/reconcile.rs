//! Credit Reconciliation
//!
//! After a checkout redirect the ledger may take a moment to reflect the
//! purchase. The poller waits (bounded) for the credential to initialize,
//! then polls the balance until it turns positive or the timeout elapses.
//! The timeout covers both phases.
//!
//! A timeout is read as "purchase not completed". Completed and abandoned
//! purchases cannot be told apart client-side, so this is a heuristic.

use std::time::Duration;

use async_trait::async_trait;
use chat_core::Gateway;
use tokio::time::{sleep, timeout, Instant};

use crate::strategy::CredentialStrategy;

/// Poller timings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollConfig {
    /// Upper bound on waiting for the credential to initialize
    pub init_timeout: Duration,
    /// Delay between balance fetches
    pub interval: Duration,
    /// Upper bound on the whole wait, initialization included
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(3),
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(8),
        }
    }
}

/// Where the poller reads balances from
#[async_trait]
pub trait CreditSource: Send + Sync {
    /// Whether the credential has finished loading
    fn is_initialized(&self) -> bool {
        true
    }

    /// Current balance; `None` when unknown
    async fn fetch_credits(&self) -> Option<i64>;
}

/// [`CreditSource`] backed by the gateway's credit endpoint.
///
/// The credential is read from the strategy on every call, so a key that
/// lands while polling is picked up.
pub struct GatewayCredits<'a> {
    gateway: &'a dyn Gateway,
    strategy: &'a dyn CredentialStrategy,
}

impl<'a> GatewayCredits<'a> {
    pub fn new(gateway: &'a dyn Gateway, strategy: &'a dyn CredentialStrategy) -> Self {
        Self { gateway, strategy }
    }
}

#[async_trait]
impl CreditSource for GatewayCredits<'_> {
    fn is_initialized(&self) -> bool {
        self.strategy.is_authenticated()
    }

    async fn fetch_credits(&self) -> Option<i64> {
        match self.gateway.fetch_credits(&self.strategy.request_auth()).await {
            Ok(credits) => credits,
            Err(e) => {
                tracing::debug!(error = %e, "Credit fetch failed during reconciliation");
                None
            }
        }
    }
}

/// Two-phase bounded wait for a positive balance
#[derive(Clone, Copy, Debug, Default)]
pub struct CreditPoller {
    config: PollConfig,
}

impl CreditPoller {
    pub fn new(config: PollConfig) -> Self {
        Self { config }
    }

    /// Balance once positive, or `None` after the timeout
    pub async fn wait_for_credits(&self, source: &dyn CreditSource) -> Option<i64> {
        let started = Instant::now();

        let wait = async {
            let init_deadline = started + self.config.init_timeout;
            while !source.is_initialized() {
                let now = Instant::now();
                if now >= init_deadline {
                    tracing::warn!("Credential did not initialize in time; polling anyway");
                    break;
                }
                sleep(self.config.interval.min(init_deadline - now)).await;
            }

            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match source.fetch_credits().await {
                    Some(credits) if credits > 0 => {
                        tracing::info!(credits, attempts, "Credits available after checkout");
                        return credits;
                    }
                    credits => tracing::debug!(?credits, attempts, "Waiting for credits"),
                }
                sleep(self.config.interval).await;
            }
        };

        match timeout(self.config.timeout, wait).await {
            Ok(credits) => Some(credits),
            Err(_) => {
                tracing::info!(
                    waited_ms = started.elapsed().as_millis() as u64,
                    "No credits after checkout; treating purchase as not completed"
                );
                None
            }
        }
    }
}
