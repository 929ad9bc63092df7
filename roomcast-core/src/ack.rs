//! Acknowledgement correlation types shared by the server and client
//! runtimes.
//!
//! Each peer keeps a table of outstanding acks keyed by a monotonic 32 bit
//! id. The sender half of a [`tokio::sync::oneshot`] channel lives in that
//! table; [`AckFuture`] wraps the receiver half and decodes the payload once
//! the matching ACK frame arrives or the reaper times the entry out.

use std::{
    fmt::Debug,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

/// Stable numbered code carried by ack-timeout results: a timed-out emit
/// resolves with the `ack_timeout` kind and this code, so callers can match
/// on either identifier.
pub const ACK_TIMEOUT_CODE: &str = "ERR_ACK_001";

/// What an outstanding-ack table entry resolves to.
pub type AckResult = Result<Value, AckError>;

/// Error type for acknowledgement results.
#[derive(Debug, thiserror::Error)]
pub enum AckError {
    /// The peer did not answer within the ack timeout.
    #[error("ack timed out ({ACK_TIMEOUT_CODE})")]
    Timeout,

    /// The socket closed while the ack was outstanding.
    #[error("socket closed before the ack arrived")]
    Closed,

    /// The ack payload does not deserialize to the requested type.
    #[error("error decoding ack payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl AckError {
    /// The stable error kind for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AckError::Timeout => "ack_timeout",
            AckError::Closed => "connection_lost",
            AckError::Decode(_) => "ack_invalid",
        }
    }

    /// The stable numbered code for this error, when one is defined.
    /// Timeouts carry [`ACK_TIMEOUT_CODE`].
    pub fn wire_code(&self) -> Option<&'static str> {
        match self {
            AckError::Timeout => Some(ACK_TIMEOUT_CODE),
            AckError::Closed | AckError::Decode(_) => None,
        }
    }
}

pin_project_lite::pin_project! {
    /// Resolves to the decoded ack payload, or to [`AckError::Timeout`] when
    /// the reaper wins the race. Exactly one of the two happens, exactly
    /// once, for every emit that requested an acknowledgement.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct AckFuture<T> {
        #[pin]
        rx: oneshot::Receiver<AckResult>,
        _marker: PhantomData<T>,
    }
}

impl<T> AckFuture<T> {
    pub fn new(rx: oneshot::Receiver<AckResult>) -> Self {
        Self {
            rx,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Future for AckFuture<T> {
    type Output = Result<T, AckError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().rx.poll(cx) {
            Poll::Ready(Ok(Ok(value))) => {
                Poll::Ready(serde_json::from_value(value).map_err(AckError::Decode))
            }
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
            // the table owner vanished without resolving us
            Poll::Ready(Err(_)) => Poll::Ready(Err(AckError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_with_decoded_payload() {
        let (tx, rx) = oneshot::channel();
        let fut = AckFuture::<Value>::new(rx);
        tx.send(Ok(json!({"ok": true, "id": 42}))).unwrap();
        assert_eq!(fut.await.unwrap(), json!({"ok": true, "id": 42}));
    }

    #[tokio::test]
    async fn resolves_with_timeout_error() {
        let (tx, rx) = oneshot::channel();
        let fut = AckFuture::<Value>::new(rx);
        tx.send(Err(AckError::Timeout)).unwrap();
        let err = fut.await.unwrap_err();
        assert!(matches!(err, AckError::Timeout));
        // both identifiers of a timeout are observable
        assert_eq!(err.code(), "ack_timeout");
        assert_eq!(err.wire_code(), Some("ERR_ACK_001"));
        assert!(err.to_string().contains(ACK_TIMEOUT_CODE));
    }

    #[tokio::test]
    async fn only_timeouts_carry_a_numbered_code() {
        assert_eq!(AckError::Timeout.wire_code(), Some(ACK_TIMEOUT_CODE));
        assert_eq!(AckError::Closed.wire_code(), None);
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_closed() {
        let (tx, rx) = oneshot::channel::<AckResult>();
        drop(tx);
        let err = AckFuture::<Value>::new(rx).await.unwrap_err();
        assert!(matches!(err, AckError::Closed));
    }

    #[tokio::test]
    async fn type_mismatch_reads_as_decode_error() {
        let (tx, rx) = oneshot::channel();
        let fut = AckFuture::<u32>::new(rx);
        tx.send(Ok(json!("not a number"))).unwrap();
        assert!(matches!(fut.await.unwrap_err(), AckError::Decode(_)));
    }
}
