//! Reconnection backoff for callers that re-run a connect-and-serve attempt

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier (1.0 keeps the delay constant)
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl ReconnectConfig {
    /// Retry forever with the same delay between attempts
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial_backoff: delay,
            max_backoff: delay,
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next attempt, or return early if `cancel` fires
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            self.current_backoff, self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(self.current_backoff) => {}
        }

        let next_backoff =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);

        self.current_backoff = next_backoff.min(self.config.max_backoff);

        Ok(())
    }

    /// Reset backoff (call after a connection was established)
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay the next `wait` will sleep for
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}
