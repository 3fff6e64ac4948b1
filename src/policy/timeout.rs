//! Per-attempt deadlines.

use std::future::Future;
use std::time::Duration;

use crate::error::{KyroError, KyroResult};

/// Races `fut` against a `ms` deadline.
///
/// On expiry the future is dropped (its further effect is discarded) and
/// `KyroError::Timeout` is returned. No retry happens here.
pub async fn with_timeout<T, F>(fut: F, ms: u64, label: &str) -> KyroResult<T>
where
    F: Future<Output = KyroResult<T>>,
{
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(label, ms, "operation timed out");
            Err(KyroError::Timeout {
                label: label.to_string(),
                ms,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_deadline() {
        let out = with_timeout(async { Ok::<_, KyroError>(7) }, 100, "fast").await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_reports_label_and_ms() {
        let err = with_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, KyroError>(())
            },
            120,
            "memory.query",
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        let msg = err.to_string();
        assert!(msg.contains("120ms"), "{msg}");
        assert!(msg.contains("memory.query"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inner_error_passes_through() {
        let err = with_timeout(async { Err::<(), _>(KyroError::internal("boom")) }, 100, "op")
            .await
            .unwrap_err();
        assert_eq!(err, KyroError::internal("boom"));
    }
}
