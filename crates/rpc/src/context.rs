//! Request-scoped context carrying cancellation, deadlines and metadata.
//!
//! Every [`Request`](crate::Request) owns a [`Context`]. Contexts form a tree:
//! deriving a child with [`Context::with_timeout`] or
//! [`Context::with_deadline`] yields a handle that is cancelled when its own
//! deadline fires *or* when any ancestor is cancelled. Cancellation is
//! cooperative: services should race their work against [`Context::done`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A cheaply cloneable cancellation/deadline scope with attached metadata.
///
/// Metadata is an append-only map of `String -> Vec<String>`; appending
/// produces a child context, so a context value never mutates under a reader.
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    deadline: Option<Instant>,
    metadata: HashMap<String, Vec<String>>,
}

impl Context {
    /// A root context: no deadline, cancelled only by an explicit [`cancel`].
    ///
    /// [`cancel`]: Context::cancel
    pub fn background() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                deadline: None,
                metadata: HashMap::new(),
            }),
        }
    }

    /// Derives a child context with this context's deadline and metadata.
    ///
    /// The child dies with its parent and can also be cancelled on its own
    /// without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                deadline: self.inner.deadline,
                metadata: self.inner.metadata.clone(),
            }),
        }
    }

    /// Derives a child context that is cancelled after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derives a child context that is cancelled at `deadline`.
    ///
    /// The child also dies with its parent. If the parent already carries an
    /// earlier deadline, the earlier one is kept.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.inner.deadline {
            Some(parent) if parent <= deadline => parent,
            _ => deadline,
        };

        let token = self.inner.token.child_token();
        let timer_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => timer_token.cancel(),
                () = timer_token.cancelled() => {}
            }
        });

        Self {
            inner: Arc::new(Inner {
                token,
                deadline: Some(deadline),
                metadata: self.inner.metadata.clone(),
            }),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Whether the context has been cancelled (directly, via an ancestor, or
    /// by its deadline firing).
    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the context is cancelled. Never resolves for a live
    /// root context.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Derives a child context with `values` appended under `key`.
    ///
    /// Existing values for `key` are preserved; retrieval via [`metadata`]
    /// sees the concatenation, so append + retrieve round-trips losslessly.
    ///
    /// [`metadata`]: Context::metadata
    pub fn append_metadata<K, I, V>(&self, key: K, values: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let mut metadata = self.inner.metadata.clone();
        metadata.entry(key.into()).or_default().extend(values.into_iter().map(Into::into));

        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.clone(),
                deadline: self.inner.deadline,
                metadata,
            }),
        }
    }

    pub fn metadata(&self) -> &HashMap<String, Vec<String>> {
        &self.inner.metadata
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
