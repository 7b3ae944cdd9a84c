// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::watch;

use crate::error::EvalError;

/// Broadcast half of a cancellation signal.  The scheduler holds this;
/// dropping it (or calling [`CancelHandle::cancel`]) cancels every token.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { rx: Some(self.tx.subscribe()) }
    }
}

/// Cooperative cancellation token checked at every suspension point.
///
/// A dropped [`CancelHandle`] counts as cancellation: an orphaned sample
/// must unwind rather than run forever.  The default token is never
/// cancelled (tests, standalone solver runs).
#[derive(Clone, Default)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            // A closed channel (handle dropped) also counts as cancelled.
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    pub fn check(&self) -> Result<(), EvalError> {
        if self.is_cancelled() {
            Err(EvalError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancelled.  Never resolves for a default token.
    pub async fn cancelled(&self) {
        match self.rx.clone() {
            Some(mut rx) => {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        // Sender dropped without an explicit cancel: treat
                        // as cancelled so orphans unwind.
                        return;
                    }
                }
            }
            None => std::future::pending().await,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
