//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap upstream calls with a phase-tagged deadline
//! - Enforce an idle timeout between body chunks
//! - End streams cleanly on cancellation
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - A body timeout ends the stream with an error so the client sees an
//!   aborted transfer, not a truncated success

use std::future::Future;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, TimeoutPhase};

/// Run `fut` with a deadline; elapsed maps to `UpstreamTimeout { phase }`.
pub async fn with_timeout<F, T>(phase: TimeoutPhase, limit: Duration, fut: F) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProxyError::UpstreamTimeout { phase })?
}

/// Yield chunks from `inner` until it ends, goes quiet for `idle`, or `cancel` fires.
pub fn idle_timeout<S, E>(
    inner: S,
    idle: Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
{
    stream::unfold(Some(inner), move |state| {
        let cancel = cancel.clone();
        async move {
            let mut inner = state?;
            tokio::select! {
                _ = cancel.cancelled() => {
                    Some((Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled")), None))
                }
                next = tokio::time::timeout(idle, inner.next()) => match next {
                    Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
                    Ok(Some(Err(e))) => Some((Err(io::Error::other(e)), None)),
                    Ok(None) => None,
                    Err(_) => Some((
                        Err(io::Error::new(io::ErrorKind::TimedOut, "upstream body idle timeout")),
                        None,
                    )),
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_chunks_then_ends() {
        let inner = stream::iter(vec![Ok::<_, io::Error>(Bytes::from("a")), Ok(Bytes::from("b"))]);
        let out: Vec<_> = idle_timeout(inner, Duration::from_secs(1), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap(), &Bytes::from("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_stream_times_out() {
        let inner = stream::iter(vec![Ok::<_, io::Error>(Bytes::from("a"))]).chain(stream::pending());
        let mut out = Box::pin(idle_timeout(inner, Duration::from_secs(5), CancellationToken::new()));

        assert!(out.next().await.unwrap().is_ok());
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_ends_stream() {
        let cancel = CancellationToken::new();
        let inner = stream::pending::<Result<Bytes, io::Error>>();
        let mut out = Box::pin(idle_timeout(inner, Duration::from_secs(60), cancel.clone()));
        cancel.cancel();
        let err = out.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_tags_phase() {
        let result: Result<(), _> = with_timeout(TimeoutPhase::Response, Duration::from_millis(10), async {
            std::future::pending::<Result<(), ProxyError>>().await
        })
        .await;
        assert!(matches!(
            result,
            Err(ProxyError::UpstreamTimeout {
                phase: TimeoutPhase::Response
            })
        ));
    }
}
