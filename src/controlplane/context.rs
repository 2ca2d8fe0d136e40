//! Request-scoped context
//!
//! Carries the cancellation signal of one API request down to driver calls.
//! Driver futures are raced against the signal and guarded against panics;
//! both outcomes leave the transaction record for the next bootstrap.

use crate::error::{Error, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context cancelled together with `token`
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Run a driver future under this context
    pub async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }

        let guarded = AssertUnwindSafe(fut).catch_unwind();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            outcome = guarded => match outcome {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(operation = %operation, reason = %reason, "Recovered from driver panic");
                    Err(Error::DriverPanic {
                        operation: operation.to_string(),
                        reason,
                    })
                }
            },
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_call_passes_result_through() {
        let ctx = RequestContext::new();
        let value = ctx.call("create", async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_call_recovers_panic() {
        let ctx = RequestContext::new();
        let err = ctx
            .call("destroy", async {
                if true {
                    panic!("array exploded");
                }
                Ok::<(), Error>(())
            })
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, Error::DriverPanic { ref reason, .. } if reason == "array exploded");
        assert!(err.skips_compensation());
    }

    #[tokio::test]
    async fn test_call_observes_cancellation() {
        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = ctx
            .call("resize", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<(), Error>(())
            })
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, Error::Cancelled { .. });
    }

    #[tokio::test]
    async fn test_cancelled_context_skips_call() {
        let ctx = RequestContext::new();
        ctx.cancel();
        let err = ctx.call("create", async { Ok::<_, Error>(()) }).await.unwrap_err();
        assert!(err.skips_compensation());
    }
}
