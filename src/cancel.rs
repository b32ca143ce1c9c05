//! Caller-driven cancellation of store queries.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};

/// Owner side of a cancellation signal. Dropping it without calling
/// [`cancel`](Self::cancel) never cancels outstanding tokens.
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the source cancels; pends forever if it is dropped first.
    pub async fn cancelled(&mut self) {
        let closed = self.rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Run `query` under an optional deadline and cancellation token.
///
/// Either one firing yields [`EngineError::Cancelled`] and drops the query.
pub async fn guarded<T, F>(
    query: F,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
) -> EngineResult<T>
where
    F: Future<Output = EngineResult<T>>,
{
    let work = async move {
        match cancel {
            Some(mut token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(EngineError::Cancelled),
                    result = query => result,
                }
            }
            None => query.await,
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| EngineError::Cancelled)?,
        None => work.await,
    }
}

/// Deadline and token for work that continues after the store query has
/// resolved, such as consuming its lazy hits. Checked between items.
#[derive(Debug, Clone)]
pub(crate) struct Budget {
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl Budget {
    pub(crate) fn start(timeout: Option<Duration>, cancel: Option<CancelToken>) -> Self {
        Self {
            deadline: timeout.map(|limit| Instant::now() + limit),
            cancel,
        }
    }

    /// Time left before the deadline, for [`guarded`].
    pub(crate) fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub(crate) fn token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    pub(crate) fn check(&self) -> EngineResult<()> {
        let cancelled = self.cancel.as_ref().is_some_and(CancelToken::is_cancelled);
        let expired = self.deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if cancelled || expired {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}
