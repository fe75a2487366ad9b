//! Connection strategies.
//!
//! A strategy decides how many peripherals connect concurrently and how
//! attempts are retried. Strategies operate purely on
//! [`PeripheralLink`]s and report per-peripheral outcomes; they never
//! mutate the state store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::StrategyConfig;
use crate::transport::{LinkState, PeripheralLink};

/// Outcome of one peripheral's connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    /// Radio address of the peripheral.
    pub address: String,
    /// `Ok` on a verified connection, else a human-readable reason.
    pub result: std::result::Result<(), String>,
}

/// Policy for connecting a batch of peripherals.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    /// Connect every peripheral in the batch, reporting one outcome per
    /// peripheral in input order.
    async fn connect(&self, peripherals: Vec<Arc<dyn PeripheralLink>>) -> Vec<ConnectOutcome>;
}

/// Build the configured strategy variant.
pub fn strategy_from_config(config: &StrategyConfig) -> Arc<dyn ConnectionStrategy> {
    match config.kind {
        crate::config::StrategyKind::Parallel => Arc::new(ParallelStrategy::new(config)),
        crate::config::StrategyKind::Sequential => Arc::new(SequentialStrategy::new(config)),
    }
}

async fn connect_once(
    link: &Arc<dyn PeripheralLink>,
    connection_timeout: Duration,
) -> std::result::Result<(), String> {
    match timeout(connection_timeout, link.connect()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => {
            // The in-flight connect is abandoned; tear the half-open
            // attempt down so the next try starts clean.
            let _ = link.disconnect().await;
            Err(format!("connect timed out after {connection_timeout:?}"))
        }
    }
}

/// Launches every connect concurrently with per-peripheral retries.
pub struct ParallelStrategy {
    max_retries: u32,
    retry_delay: Duration,
    connection_timeout: Duration,
}

impl ParallelStrategy {
    /// Build from strategy configuration.
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
        }
    }

    async fn connect_one(&self, link: Arc<dyn PeripheralLink>) -> ConnectOutcome {
        let address = link.address();
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                sleep(self.retry_delay).await;
                debug!(%address, attempt, "retrying connect");
            }
            match connect_once(&link, self.connection_timeout).await {
                Ok(()) => {
                    // Success requires the link to actually be up once
                    // the future resolves, not just a clean return.
                    if link.state().await == LinkState::Connected {
                        return ConnectOutcome {
                            address,
                            result: Ok(()),
                        };
                    }
                    last_error = "link not connected after resolution".to_string();
                }
                Err(e) => last_error = e,
            }
        }

        warn!(%address, %last_error, "parallel connect exhausted retries");
        ConnectOutcome {
            address,
            result: Err(last_error),
        }
    }
}

#[async_trait]
impl ConnectionStrategy for ParallelStrategy {
    async fn connect(&self, peripherals: Vec<Arc<dyn PeripheralLink>>) -> Vec<ConnectOutcome> {
        join_all(peripherals.into_iter().map(|link| self.connect_one(link))).await
    }
}

/// Connects one peripheral at a time through an internal FIFO queue.
///
/// Some adapters misbehave when asked for several simultaneous
/// connections; this variant trades latency for reliability with an
/// inter-connection pause, a post-connect stabilization delay, and an
/// explicit state verification deadline.
pub struct SequentialStrategy {
    inter_connection_delay: Duration,
    stabilization_delay: Duration,
    state_verification_timeout: Duration,
    connection_timeout: Duration,
}

impl SequentialStrategy {
    /// Build from strategy configuration.
    pub fn new(config: &StrategyConfig) -> Self {
        Self {
            inter_connection_delay: Duration::from_millis(config.inter_connection_delay_ms),
            stabilization_delay: Duration::from_millis(config.stabilization_delay_ms),
            state_verification_timeout: Duration::from_millis(config.state_verification_timeout_ms),
            connection_timeout: Duration::from_millis(config.connection_timeout_ms),
        }
    }

    async fn verify_connected(&self, link: &Arc<dyn PeripheralLink>) -> bool {
        let deadline = tokio::time::Instant::now() + self.state_verification_timeout;
        loop {
            if link.state().await == LinkState::Connected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl ConnectionStrategy for SequentialStrategy {
    async fn connect(&self, peripherals: Vec<Arc<dyn PeripheralLink>>) -> Vec<ConnectOutcome> {
        let mut outcomes = Vec::with_capacity(peripherals.len());
        let mut queue: std::collections::VecDeque<_> = peripherals.into();
        let mut first = true;

        while let Some(link) = queue.pop_front() {
            if !first {
                sleep(self.inter_connection_delay).await;
            }
            first = false;

            let address = link.address();
            let result = match connect_once(&link, self.connection_timeout).await {
                Ok(()) => {
                    sleep(self.stabilization_delay).await;
                    if self.verify_connected(&link).await {
                        Ok(())
                    } else {
                        Err(format!(
                            "link did not verify within {:?}",
                            self.state_verification_timeout
                        ))
                    }
                }
                Err(e) => Err(e),
            };

            if let Err(reason) = &result {
                warn!(%address, %reason, "sequential connect failed");
            }
            outcomes.push(ConnectOutcome { address, result });
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    /// Link that fails a set number of connects before succeeding.
    struct FlakyLink {
        address: String,
        failures_remaining: AtomicU32,
        connected: std::sync::Mutex<bool>,
    }

    impl FlakyLink {
        fn new(address: &str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                address: address.to_string(),
                failures_remaining: AtomicU32::new(failures),
                connected: std::sync::Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl PeripheralLink for FlakyLink {
        fn address(&self) -> String {
            self.address.clone()
        }

        async fn connect(&self) -> Result<()> {
            if self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::connection_failed(&self.address, "simulated failure"));
            }
            *self.connected.lock().unwrap() = true;
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            *self.connected.lock().unwrap() = false;
            Ok(())
        }

        async fn state(&self) -> LinkState {
            if *self.connected.lock().unwrap() {
                LinkState::Connected
            } else {
                LinkState::Disconnected
            }
        }

        async fn discover_services(&self) -> Result<()> {
            Ok(())
        }

        async fn has_service(&self, _service: Uuid) -> bool {
            false
        }

        async fn read(&self, _characteristic: Uuid) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        async fn write(
            &self,
            _characteristic: Uuid,
            _bytes: &[u8],
            _with_response: bool,
        ) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, _characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> StrategyConfig {
        StrategyConfig {
            retry_delay_ms: 1,
            inter_connection_delay_ms: 1,
            stabilization_delay_ms: 1,
            state_verification_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_parallel_retries_until_success() {
        let strategy = ParallelStrategy::new(&test_config());
        let link = FlakyLink::new("aa:01", 2);
        let outcomes = strategy
            .connect(vec![link as Arc<dyn PeripheralLink>])
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
    }

    #[tokio::test]
    async fn test_parallel_reports_exhaustion() {
        let strategy = ParallelStrategy::new(&test_config());
        let link = FlakyLink::new("aa:01", 10);
        let outcomes = strategy
            .connect(vec![link as Arc<dyn PeripheralLink>])
            .await;
        let err = outcomes[0].result.as_ref().unwrap_err();
        assert!(err.contains("simulated failure"));
    }

    #[tokio::test]
    async fn test_parallel_mixed_batch() {
        let strategy = ParallelStrategy::new(&test_config());
        let good = FlakyLink::new("aa:01", 0);
        let bad = FlakyLink::new("aa:02", 10);
        let outcomes = strategy
            .connect(vec![
                good as Arc<dyn PeripheralLink>,
                bad as Arc<dyn PeripheralLink>,
            ])
            .await;
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert_eq!(outcomes[0].address, "aa:01");
        assert_eq!(outcomes[1].address, "aa:02");
    }

    #[tokio::test]
    async fn test_sequential_processes_in_order() {
        let strategy = SequentialStrategy::new(&test_config());
        let links: Vec<Arc<dyn PeripheralLink>> = vec![
            FlakyLink::new("aa:01", 0),
            FlakyLink::new("aa:02", 1), // no retries in sequential: fails
            FlakyLink::new("aa:03", 0),
        ];
        let outcomes = strategy.connect(links).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
    }
}
