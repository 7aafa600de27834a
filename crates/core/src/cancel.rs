//! Cancellation and outstanding-work tracking for resolution attempts.
//!
//! [`CancellationToken`] is handed to every collaborator call of one attempt
//! and checked at each phase boundary. [`OutstandingCount`] counts requested
//! resolutions and wakes every waiter when the count returns to zero.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::errors::ResolveError;

// =============================================================================
// CancellationToken
// =============================================================================

#[derive(Default)]
struct TokenState {
    canceled: AtomicBool,
    notify: Notify,
}

/// A cloneable cancellation flag.
///
/// Clones share the same state; canceling any clone cancels all of them.
#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and wake everyone waiting in [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// Return `Err(Canceled)` once the token has been canceled.
    pub fn check(&self) -> Result<(), ResolveError> {
        if self.is_cancelled() {
            return Err(ResolveError::Canceled);
        }
        Ok(())
    }

    /// True when `other` is a clone of this token.
    pub fn same_scope(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Wait until the token is canceled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// =============================================================================
// OutstandingCount
// =============================================================================

/// Count of outstanding work items with a broadcast when it reaches zero.
#[derive(Default)]
pub struct OutstandingCount {
    count: AtomicUsize,
    notify: Notify,
}

impl OutstandingCount {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    /// Mark one item finished. Extra calls at zero are ignored.
    pub fn done(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if prev == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until the count is zero or `ctx` is canceled.
    pub async fn wait_zero(&self, ctx: &CancellationToken) -> Result<(), ResolveError> {
        loop {
            let notified = self.notify.notified();
            if self.get() == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = notified => {}
                _ = ctx.cancelled() => return Err(ResolveError::Canceled),
            }
        }
    }
}
