//! Timeout enforcement.

use std::future::Future;
use std::time::Duration;

use crate::rpc::{TransportError, TransportResult};

/// Run `fut` with a deadline; expiry becomes [`TransportError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_maps_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        };
        let err = with_timeout(Duration::from_secs(1), slow).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn inner_error_passes_through() {
        let failing = async { Err::<(), _>(TransportError::ChannelLost("gone".into())) };
        let err = with_timeout(Duration::from_secs(1), failing).await.unwrap_err();
        assert_eq!(err.kind(), "channel_lost");
    }
}
