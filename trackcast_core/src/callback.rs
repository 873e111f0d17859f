//! Fire-once completion handles for public API calls.

use crate::error::PublisherError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Completes a caller waiting on the other end of a oneshot channel.
///
/// Cloneable so work specifications can be re-queued or retained for error
/// hooks; only the first `complete` is delivered.
pub struct ResultCallback<T> {
    sender: Arc<Mutex<Option<oneshot::Sender<Result<T, PublisherError>>>>>,
}

impl<T> ResultCallback<T> {
    /// Creates a callback and the receiver its result is delivered to.
    pub fn channel() -> (Self, oneshot::Receiver<Result<T, PublisherError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// A callback whose result nobody awaits.
    pub fn detached() -> Self {
        Self {
            sender: Arc::new(Mutex::new(None)),
        }
    }

    /// Delivers the result. Returns false if it was already completed.
    pub fn complete(&self, result: Result<T, PublisherError>) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                // The caller may have given up waiting
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl<T> Clone for ResultCallback<T> {
    fn clone(&self) -> Self {
        Self {
            sender: Arc::clone(&self.sender),
        }
    }
}

impl<T> std::fmt::Debug for ResultCallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCallback")
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_callback_fires_once() {
        let (callback, rx) = ResultCallback::<u32>::channel();
        let clone = callback.clone();

        assert!(callback.complete(Ok(1)));
        assert!(!clone.complete(Ok(2)));
        assert!(clone.is_completed());
        assert_eq!(rx.await.unwrap(), Ok(1));
    }

    #[test]
    fn test_detached_callback_is_complete() {
        let callback = ResultCallback::<()>::detached();
        assert!(!callback.complete(Ok(())));
    }
}
