use std::time::Duration;

use crate::error::AcquisitionError;

/// Operational tuning for downloads.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// HTTP timeout for one tile request
    pub request_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Retries after the first attempt, for transient failures only
    pub max_retries: u32,
    /// First retry delay (doubles each retry)
    pub initial_retry_delay: Duration,
    /// Upper bound on the retry delay
    pub max_retry_delay: Duration,
    /// Tile edge in pixels when tiled download is enabled
    pub max_tile_dim: usize,
    /// Largest window edge accepted when tiled download is disabled
    pub max_single_request_dim: usize,
    /// Windows with an edge above this are logged as large downloads
    pub large_request_warning_dim: usize,
    /// Simultaneous tile requests in flight
    pub max_concurrency: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(8),
            max_tile_dim: 2000,
            max_single_request_dim: 14_000,
            large_request_warning_dim: 10_000,
            max_concurrency: 4,
        }
    }
}

impl DownloadConfig {
    pub fn validate(&self) -> Result<(), AcquisitionError> {
        if self.max_tile_dim == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "max_tile_dim must be at least 1".into(),
            ));
        }
        if self.max_single_request_dim == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "max_single_request_dim must be at least 1".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(AcquisitionError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(AcquisitionError::InvalidConfig(
                "request_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based): doubled each time, capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}
