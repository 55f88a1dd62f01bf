use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::util::lock_unpoisoned;
use crate::{CourierError, Result};

/// Reason recorded when [`CancelToken::cancel`] is called without one.
pub const DEFAULT_CANCEL_REASON: &str = "request cancelled";

type Observer = Box<dyn FnOnce(&str) + Send>;

/// Identifies an observer registered with [`CancelToken::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverKey(u64);

#[derive(Default)]
struct State {
    reason: Option<String>,
    observers: Vec<(u64, Observer)>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_key: AtomicU64,
}

/// One-shot cancellation signal shared by any number of requests.
///
/// Clones share the same state. The transition from pending to cancelled
/// happens once; later calls to [`cancel`](Self::cancel) are ignored.
/// Observers registered after cancellation are invoked immediately with the
/// stored reason, so no notification is ever missed.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock_unpoisoned(&self.inner.state);
        f.debug_struct("CancelToken")
            .field("reason", &state.reason)
            .field("observers", &state.observers.len())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels with [`DEFAULT_CANCEL_REASON`].
    pub fn cancel(&self) -> bool {
        self.cancel_with(DEFAULT_CANCEL_REASON)
    }

    /// Cancels with `reason` and notifies every registered observer in
    /// registration order.
    ///
    /// Returns `false` if the token was already cancelled.
    pub fn cancel_with(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let observers = {
            let mut state = lock_unpoisoned(&self.inner.state);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason.clone());
            std::mem::take(&mut state.observers)
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            reason = %reason,
            observers = observers.len(),
            "cancel token fired"
        );

        for (_, observer) in observers {
            observer(&reason);
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        lock_unpoisoned(&self.inner.state).reason.is_some()
    }

    pub fn reason(&self) -> Option<String> {
        lock_unpoisoned(&self.inner.state).reason.clone()
    }

    /// Registers `observer` to run on cancellation.
    ///
    /// If the token is already cancelled, `observer` runs before this call
    /// returns.
    pub fn register<F>(&self, observer: F) -> ObserverKey
    where
        F: FnOnce(&str) + Send + 'static,
    {
        let key = self.inner.next_key.fetch_add(1, Ordering::Relaxed);
        let reason = {
            let mut state = lock_unpoisoned(&self.inner.state);
            match &state.reason {
                Some(reason) => reason.clone(),
                None => {
                    state.observers.push((key, Box::new(observer)));
                    return ObserverKey(key);
                }
            }
        };
        observer(&reason);
        ObserverKey(key)
    }

    /// Removes a pending observer. Returns `false` if it already ran or was
    /// never registered.
    pub fn unregister(&self, key: ObserverKey) -> bool {
        let mut state = lock_unpoisoned(&self.inner.state);
        let before = state.observers.len();
        state.observers.retain(|(id, _)| *id != key.0);
        state.observers.len() != before
    }

    /// Fails with [`CourierError::Cancelled`] if the token has fired.
    pub fn error_if_cancelled(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(CourierError::Cancelled { reason }),
            None => Ok(()),
        }
    }

    /// Resolves with the reason once the token is cancelled.
    ///
    /// Dropping the future removes its observer from the token.
    pub async fn cancelled(&self) -> String {
        let (tx, rx) = oneshot::channel();
        let key = self.register(move |reason| {
            let _ = tx.send(reason.to_owned());
        });
        let _registration = Registration { token: self, key };

        match rx.await {
            Ok(reason) => reason,
            Err(_) => std::future::pending().await,
        }
    }
}

struct Registration<'a> {
    token: &'a CancelToken,
    key: ObserverKey,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.token.unregister(self.key);
    }
}
