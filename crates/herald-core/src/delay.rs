//! Cancellable delays
//!
//! The reconnection loop waits through this abstraction so tests can drive it
//! one tick at a time instead of waiting on the wall clock.

use crate::error::{ChatError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Delayer: Send + Sync {
    /// Wait for `duration`, returning [`ChatError::Cancelled`] if `token` fires first
    async fn delay(&self, duration: Duration, token: &CancellationToken) -> Result<()>;
}

/// Delays on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelayer;

#[async_trait]
impl Delayer for TokioDelayer {
    async fn delay(&self, duration: Duration, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => Err(ChatError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_delay_elapses() {
        let token = CancellationToken::new();
        TokioDelayer
            .delay(Duration::from_secs(60), &token)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delay_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let result = TokioDelayer.delay(Duration::from_secs(3600), &token).await;
        assert!(matches!(result, Err(ChatError::Cancelled)));
    }
}
