//! Timeout Manager Implementation
//!
//! Bounds task executions and oracle calls. An expired operation is dropped
//! (cancelled) and reported as `OperationTimeoutError::Timeout`; the caller
//! decides what that means for its domain.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Timeout-related errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OperationTimeoutError {
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },
}

/// Statistics for timeout operations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeoutStats {
    pub total_operations: u64,
    pub completed_operations: u64,
    pub timed_out_operations: u64,
    pub total_execution_time: Duration,
    pub max_execution_time: Duration,
}

impl TimeoutStats {
    pub fn timeout_rate(&self) -> f64 {
        if self.total_operations == 0 {
            0.0
        } else {
            self.timed_out_operations as f64 / self.total_operations as f64
        }
    }

    pub fn average_execution_time(&self) -> Duration {
        if self.completed_operations == 0 {
            Duration::ZERO
        } else {
            self.total_execution_time / self.completed_operations as u32
        }
    }
}

/// Runs futures under a deadline and keeps aggregate statistics
#[derive(Debug)]
pub struct TimeoutManager {
    default_timeout: Duration,
    stats: Mutex<TimeoutStats>,
}

impl TimeoutManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            stats: Mutex::new(TimeoutStats::default()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Run with the default timeout
    pub async fn run<F, T>(&self, operation: &str, future: F) -> Result<T, OperationTimeoutError>
    where
        F: Future<Output = T>,
    {
        self.run_with_timeout(operation, self.default_timeout, future)
            .await
    }

    pub async fn run_with_timeout<F, T>(
        &self,
        operation: &str,
        limit: Duration,
        future: F,
    ) -> Result<T, OperationTimeoutError>
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let result = timeout(limit, future).await;
        let elapsed = started.elapsed();

        let mut stats = self.stats.lock();
        stats.total_operations += 1;
        match result {
            Ok(value) => {
                stats.completed_operations += 1;
                stats.total_execution_time += elapsed;
                stats.max_execution_time = stats.max_execution_time.max(elapsed);
                debug!(operation, duration_ms = elapsed.as_millis() as u64, "Operation finished in time");
                Ok(value)
            }
            Err(_) => {
                stats.timed_out_operations += 1;
                warn!(operation, timeout_ms = limit.as_millis() as u64, "Operation timed out");
                Err(OperationTimeoutError::Timeout {
                    operation: operation.to_string(),
                    timeout: limit,
                })
            }
        }
    }

    pub fn stats(&self) -> TimeoutStats {
        self.stats.lock().clone()
    }
}
