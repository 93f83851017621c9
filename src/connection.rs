//! Connection acquisition with timeout, health check and retry.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::classify::ErrorClass;
use crate::config::{ConnectionProfile, RetryConfig};
use crate::database::{Connector, Database};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Hands out live, health-checked connections.
#[derive(Clone)]
pub struct ConnectionProvider {
    connector: Arc<dyn Connector>,
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionProvider {
    /// Create a provider.
    pub fn new(connector: Arc<dyn Connector>, retry: RetryConfig) -> Self {
        Self {
            connector,
            retry,
            metrics: None,
        }
    }

    /// Count retries into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Open one connection to `profile`.
    ///
    /// Each attempt is bounded by the profile's connect timeout and must pass
    /// a ping. Up to `max_retries` further attempts follow, spaced by
    /// exponential backoff. Errors that another attempt cannot fix, such as
    /// rejected credentials, end the retries at once.
    #[instrument(skip(self, profile), fields(target = %profile.display_name()))]
    pub async fn acquire(&self, profile: &ConnectionProfile) -> Result<Box<dyn Database>> {
        let max_attempts = profile.max_retries() + 1;
        let mut backoff = create_backoff(&self.retry);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_connect(profile).await {
                Ok(conn) => {
                    if attempt > 1 {
                        info!("Connected to {} after {} attempts", profile.display_name(), attempt);
                    }
                    return Ok(conn);
                }
                Err(e) if attempt >= max_attempts || !e.is_retryable() => {
                    return Err(Error::connection(
                        format!("{}: {}", profile.display_name(), e),
                        attempt,
                    ));
                }
                Err(e) => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.retry.max_backoff());
                    warn!(
                        "Connection attempt {}/{} to {} failed: {}. Retrying in {:?}",
                        attempt,
                        max_attempts,
                        profile.display_name(),
                        e,
                        delay
                    );
                    if let Some(m) = &self.metrics {
                        m.record_retry();
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Open a dedicated source and destination pair.
    ///
    /// If the destination cannot be reached the source connection is closed
    /// before the error is returned.
    pub async fn acquire_pair(
        &self,
        source: &ConnectionProfile,
        destination: &ConnectionProfile,
    ) -> Result<ConnectionPair> {
        let source = self.acquire(source).await?;
        let destination = match self.acquire(destination).await {
            Ok(conn) => conn,
            Err(e) => {
                source.close().await;
                return Err(e);
            }
        };
        Ok(ConnectionPair {
            source,
            destination,
        })
    }

    async fn try_connect(&self, profile: &ConnectionProfile) -> Result<Box<dyn Database>> {
        let timeout = profile.connect_timeout();
        let attempt = async {
            let mut conn = self.connector.connect(profile).await?;
            if let Err(e) = conn.ping().await {
                conn.close().await;
                return Err(e);
            }
            Ok(conn)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::database(
                ErrorClass::ConnectionLost,
                None,
                format!("connect timed out after {:?}", timeout),
            )),
        }
    }
}

/// One source and one destination connection owned by a single task.
pub struct ConnectionPair {
    /// Source connection
    pub source: Box<dyn Database>,
    /// Destination connection
    pub destination: Box<dyn Database>,
}

impl ConnectionPair {
    /// Close both connections.
    pub async fn close(self) {
        self.source.close().await;
        self.destination.close().await;
        debug!("Connection pair closed");
    }
}

/// Create exponential backoff from config.
pub fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff())
        .with_max_interval(config.max_backoff())
        .with_multiplier(config.multiplier)
        .with_randomization_factor(if config.jitter { 0.5 } else { 0.0 })
        .with_max_elapsed_time(None)
        .build()
}
