//! Reconnection with exponential backoff
//!
//! Startup tries the Modbus host a bounded number of times; when that fails
//! the service keeps running and a background task retries on a fixed period.

use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SharedSession;

/// Reconnection error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Maximum reconnection attempts exceeded")]
    MaxAttemptsExceeded,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Connection state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Max attempts reached
    Failed,
}

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum attempts (0 means unlimited)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add ±25% jitter to delays
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(max_attempts: u32, initial_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_secs(initial_delay_secs),
            max_delay: Duration::from_secs(max_delay_secs),
            ..Self::default()
        }
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
    pub last_connected: Option<Instant>,
}

/// Attempt counter with backoff and statistics
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    current_attempt: u32,
    state: ConnectionState,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            current_attempt: 0,
            state: ConnectionState::Disconnected,
            stats: ReconnectStats::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Delay before the attempt following `current_attempt`
    pub fn calculate_next_delay(&self) -> Duration {
        let exponent = self.current_attempt.saturating_sub(1);
        let mut delay = self
            .policy
            .initial_delay
            .mul_f64(self.policy.backoff_multiplier.powi(exponent as i32));

        if delay > self.policy.max_delay {
            delay = self.policy.max_delay;
        }

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }

    fn exhausted(&self) -> bool {
        self.policy.max_attempts > 0 && self.current_attempt >= self.policy.max_attempts
    }

    /// Run one attempt, waiting out the backoff delay first unless it is the first
    pub async fn execute_reconnect<F, Fut, E>(
        &mut self,
        token: &CancellationToken,
        mut connect_fn: F,
    ) -> Result<(), ReconnectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        if self.exhausted() {
            self.state = ConnectionState::Failed;
            warn!(
                "Maximum reconnection attempts ({}) exceeded",
                self.policy.max_attempts
            );
            return Err(ReconnectError::MaxAttemptsExceeded);
        }

        if self.current_attempt > 0 {
            let delay = self.calculate_next_delay();
            debug!("Waiting {:?} before reconnection attempt", delay);
            tokio::select! {
                _ = token.cancelled() => return Err(ReconnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {},
            }
        }

        self.state = ConnectionState::Reconnecting;
        self.current_attempt += 1;
        self.stats.total_attempts += 1;

        let start_time = Instant::now();
        match connect_fn().await {
            Ok(()) => {
                info!(
                    "Connected after {:?} (attempt {})",
                    start_time.elapsed(),
                    self.current_attempt
                );
                self.state = ConnectionState::Connected;
                self.current_attempt = 0;
                self.stats.successful_reconnects += 1;
                self.stats.last_connected = Some(Instant::now());
                Ok(())
            },
            Err(e) => {
                self.stats.failed_reconnects += 1;
                if self.exhausted() {
                    self.state = ConnectionState::Failed;
                } else {
                    self.state = ConnectionState::Disconnected;
                }
                warn!(
                    "Connection attempt {}/{} failed: {}",
                    self.current_attempt, self.policy.max_attempts, e
                );
                Err(ReconnectError::ConnectionFailed(e.to_string()))
            },
        }
    }
}

/// Connect the shared session, retrying per `policy` until success, exhaustion or cancellation
pub async fn connect_with_backoff(
    session: &SharedSession,
    policy: ReconnectPolicy,
    token: &CancellationToken,
) -> Result<(), ReconnectError> {
    let mut helper = ReconnectHelper::new(policy);
    loop {
        let result = helper
            .execute_reconnect(token, || async { session.lock().await.connect().await })
            .await;
        match result {
            Ok(()) => return Ok(()),
            Err(ReconnectError::ConnectionFailed(_)) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Retry the Modbus connection every `period` until it succeeds or the token is cancelled
pub fn spawn_background_reconnect(
    session: SharedSession,
    period: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Background Modbus reconnect every {:?}", period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Background reconnect cancelled");
                    return;
                },
                _ = tokio::time::sleep(period) => {},
            }

            let mut guard = session.lock().await;
            if guard.is_connected() {
                info!("Modbus session already up, background reconnect done");
                return;
            }
            match guard.connect().await {
                Ok(()) => {
                    info!("Modbus connection established by background task");
                    return;
                },
                Err(e) => debug!("Background reconnect failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::mock::MockTransport;
    use crate::core::transport::{ModbusSession, SessionConfig};
    use std::sync::Arc;

    fn shared(mock: &MockTransport) -> SharedSession {
        Arc::new(tokio::sync::Mutex::new(ModbusSession::new(
            Box::new(mock.clone()),
            SessionConfig::default(),
        )))
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy::default());
        let expected = [2, 4, 8, 16, 32, 60, 60];
        for (attempt, secs) in expected.iter().enumerate() {
            helper.current_attempt = attempt as u32 + 1;
            assert_eq!(helper.calculate_next_delay(), Duration::from_secs(*secs));
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy {
            jitter: true,
            ..ReconnectPolicy::default()
        });
        helper.current_attempt = 2;
        for _ in 0..50 {
            let delay = helper.calculate_next_delay();
            assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_backoff_exhausts_attempts() {
        let mock = MockTransport::new();
        mock.set_connection_failure(true);
        let session = shared(&mock);

        let result = connect_with_backoff(
            &session,
            ReconnectPolicy::default(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result, Err(ReconnectError::MaxAttemptsExceeded));
        assert_eq!(mock.connect_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_helper_tracks_state_and_stats() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        });
        let token = CancellationToken::new();

        let failed = helper
            .execute_reconnect(&token, || async { Err::<(), _>("refused") })
            .await;
        assert_eq!(failed, Err(ReconnectError::ConnectionFailed("refused".into())));
        assert_eq!(helper.connection_state(), ConnectionState::Disconnected);

        let ok = helper
            .execute_reconnect(&token, || async { Ok::<(), &str>(()) })
            .await;
        assert_eq!(ok, Ok(()));
        assert_eq!(helper.connection_state(), ConnectionState::Connected);

        let stats = helper.stats();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.failed_reconnects, 1);
        assert_eq!(stats.successful_reconnects, 1);
        assert!(stats.last_connected.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_with_backoff_cancelled() {
        let mock = MockTransport::new();
        mock.set_connection_failure(true);
        let session = shared(&mock);
        let token = CancellationToken::new();
        token.cancel();

        let result = connect_with_backoff(&session, ReconnectPolicy::default(), &token).await;
        assert_eq!(result, Err(ReconnectError::Cancelled));
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reconnect_exits_after_success() {
        let mock = MockTransport::new();
        mock.set_connection_failure(true);
        let session = shared(&mock);
        let token = CancellationToken::new();

        let handle =
            spawn_background_reconnect(session.clone(), Duration::from_secs(30), token.clone());
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(mock.connect_count(), 2);

        mock.set_connection_failure(false);
        handle.await.unwrap();
        assert!(session.lock().await.is_connected());
        assert!(!token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reconnect_stops_on_cancel() {
        let mock = MockTransport::new();
        mock.set_connection_failure(true);
        let token = CancellationToken::new();

        let handle =
            spawn_background_reconnect(shared(&mock), Duration::from_secs(30), token.clone());
        token.cancel();
        handle.await.unwrap();
        assert_eq!(mock.connect_count(), 0);
    }
}
