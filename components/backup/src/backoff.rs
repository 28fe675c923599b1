// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::Duration;

use crate::errors::{Error, Result};

/// A bounded sleep budget.
///
/// All backoffs of one fine-grained pass share a single budget, so a range
/// that keeps hitting retryable errors eventually fails instead of spinning
/// forever.
pub struct Backoffer {
    max_sleep_ms: u64,
    total_sleep_ms: u64,
}

impl Backoffer {
    pub fn new(max_sleep_ms: u64) -> Backoffer {
        Backoffer {
            max_sleep_ms,
            total_sleep_ms: 0,
        }
    }

    /// Sleeps for `ms` milliseconds, failing once the cumulative sleep would
    /// exceed the budget.
    pub async fn backoff(&mut self, ms: u64) -> Result<()> {
        if self.total_sleep_ms + ms > self.max_sleep_ms {
            return Err(Error::BackoffExhausted {
                limit_ms: self.max_sleep_ms,
            });
        }
        self.total_sleep_ms += ms;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(())
    }

    pub fn total_sleep_ms(&self) -> u64 {
        self.total_sleep_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_backoff_accumulates() {
        let mut bo = Backoffer::new(100);
        bo.backoff(40).await.unwrap();
        bo.backoff(60).await.unwrap();
        assert_eq!(bo.total_sleep_ms(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_exhausted() {
        let mut bo = Backoffer::new(100);
        bo.backoff(80).await.unwrap();
        let err = bo.backoff(21).await.unwrap_err();
        assert!(matches!(err, Error::BackoffExhausted { limit_ms: 100 }));
        // A smaller sleep still fits.
        bo.backoff(20).await.unwrap();
        assert_eq!(bo.total_sleep_ms(), 100);
    }
}
