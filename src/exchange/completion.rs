//! One-shot completion signal of an exchange
//!
//! Resolved exactly once with success (and whether the upstream connection must
//! close), failure or cancellation. Later attempts are ignored.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CompletionState {
    Pending,
    Completed { close_connection: bool },
    Failed(String),
    Cancelled,
}

impl CompletionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Upstream connection may be reused
    pub fn allows_reuse(&self) -> bool {
        matches!(
            self,
            Self::Completed {
                close_connection: false
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeCompletion {
    tx: Arc<watch::Sender<CompletionState>>,
}

impl Default for ExchangeCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeCompletion {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CompletionState::Pending);
        Self { tx: Arc::new(tx) }
    }

    fn resolve(&self, state: CompletionState) -> bool {
        let mut state = Some(state);
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            if let Some(s) = state.take() {
                *current = s;
            }
            true
        })
    }

    pub fn complete(&self, close_connection: bool) -> bool {
        self.resolve(CompletionState::Completed { close_connection })
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.resolve(CompletionState::Failed(reason.into()))
    }

    pub fn cancel(&self) -> bool {
        self.resolve(CompletionState::Cancelled)
    }

    pub fn state(&self) -> CompletionState {
        self.tx.borrow().clone()
    }

    /// Wait for a terminal state
    pub async fn wait(&self) -> CompletionState {
        let mut rx = self.tx.subscribe();
        let result = rx.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }
}
