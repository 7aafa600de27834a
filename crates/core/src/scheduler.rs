//! Resolution scheduler.
//!
//! [`ConflictResolver`] is the single entry point for a folder. Callers
//! report new `(unmerged, merged)` revisions through
//! [`resolve`](ConflictResolver::resolve), which never blocks: it cancels an
//! attempt the new input supersedes and hands the input to a background
//! worker. The worker processes inputs serially. An input that does not
//! improve on the tracked baseline is ignored; otherwise the baseline moves
//! forward and a new attempt starts once the previous one has wound down,
//! so exactly one attempt runs at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cancel::{CancellationToken, OutstandingCount};
use crate::config::ResolverConfig;
use crate::engine::{ResolutionEngine, ResolutionReport};
use crate::errors::ResolveError;
use crate::model::{BranchId, ConflictInput, Revision};
use crate::source::FolderStore;

/// Reports kept for subscribers that fall behind.
const REPORT_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Aggregate counters across attempts.
#[derive(Default)]
pub struct ResolverStats {
    pub attempts: AtomicU64,
    pub resolved: AtomicU64,
    pub canceled: AtomicU64,
    pub failed: AtomicU64,
    pub consecutive_canceled: AtomicU64,
    /// Failed attempts since the last success or explicit clear.
    pub consecutive_failed: AtomicU64,
}

/// Point-in-time copy of [`ResolverStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub resolved: u64,
    pub canceled: u64,
    pub failed: u64,
    pub consecutive_canceled: u64,
    pub consecutive_failed: u64,
}

impl ResolverStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::SeqCst),
            resolved: self.resolved.load(Ordering::SeqCst),
            canceled: self.canceled.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            consecutive_canceled: self.consecutive_canceled.load(Ordering::SeqCst),
            consecutive_failed: self.consecutive_failed.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct InputState {
    baseline: ConflictInput,
    /// Token of the most recently started attempt.
    current: Option<CancellationToken>,
    branch: Option<BranchId>,
}

struct Shared<S> {
    engine: ResolutionEngine<S>,
    input: Mutex<InputState>,
    outstanding: OutstandingCount,
    stats: ResolverStats,
    reports: broadcast::Sender<ResolutionReport>,
    canceled_threshold: u64,
    max_attempts: u64,
}

impl<S> Shared<S> {
    fn input(&self) -> MutexGuard<'_, InputState> {
        self.input.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_stuck(&self) -> bool {
        self.stats.consecutive_failed.load(Ordering::SeqCst) >= self.max_attempts
    }

    /// Count one failed attempt and report when it makes the branch stuck.
    fn note_failure(&self) -> u64 {
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        let consecutive = self.stats.consecutive_failed.fetch_add(1, Ordering::SeqCst) + 1;
        if consecutive == self.max_attempts {
            error!(
                consecutive,
                "conflict resolution keeps failing; branch is stuck until failures are cleared"
            );
        }
        consecutive
    }
}

/// Ends one attempt when its task finishes: releases the attempt's scope and
/// its outstanding request. A task that unwinds before recording its result
/// counts as a failed attempt.
struct AttemptGuard<S> {
    shared: Arc<Shared<S>>,
    accepted: Accepted,
    recorded: bool,
}

impl<S> AttemptGuard<S> {
    fn new(shared: Arc<Shared<S>>, accepted: Accepted) -> Self {
        Self {
            shared,
            accepted,
            recorded: false,
        }
    }
}

impl<S> Drop for AttemptGuard<S> {
    fn drop(&mut self) {
        if !self.recorded {
            let consecutive = self.shared.note_failure();
            error!(consecutive, "conflict resolution attempt aborted");
        }
        // Release the scope if nothing newer replaced it.
        let mut state = self.shared.input();
        let same = state
            .current
            .as_ref()
            .is_some_and(|t| t.same_scope(&self.accepted.token));
        if same {
            state.current = None;
        }
        drop(state);
        self.shared.outstanding.done();
    }
}

/// Work accepted by the worker for one attempt.
struct Accepted {
    token: CancellationToken,
    prior: ConflictInput,
    branch: Option<BranchId>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Serializes, debounces and cancels resolution attempts for one folder.
pub struct ConflictResolver<S: FolderStore> {
    shared: Arc<Shared<S>>,
    tx: Mutex<Option<mpsc::UnboundedSender<ConflictInput>>>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: FolderStore> ConflictResolver<S> {
    /// Start a resolver and its worker. Must be called inside a tokio runtime.
    pub fn new(store: Arc<S>, config: ResolverConfig, writer: impl Into<String>) -> Self {
        Self::with_engine(ResolutionEngine::new(store, config, writer))
    }

    pub fn with_engine(engine: ResolutionEngine<S>) -> Self {
        let canceled_threshold = engine.config().canceled_threshold;
        let max_attempts = engine.config().max_resolution_attempts;
        let (reports, _) = broadcast::channel(REPORT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            engine,
            input: Mutex::new(InputState::default()),
            outstanding: OutstandingCount::new(),
            stats: ResolverStats::default(),
            reports,
            canceled_threshold,
            max_attempts,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run_worker(shared.clone(), rx, shutdown.clone()));
        info!("conflict resolver started");
        Self {
            shared,
            tx: Mutex::new(Some(tx)),
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Request a resolution for the given latest known revisions.
    ///
    /// Returns immediately. Any running attempt the new input supersedes is
    /// canceled before this returns.
    pub fn resolve(&self, unmerged: Revision, merged: Revision) -> Result<(), ResolveError> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(ResolveError::ShutDown);
        };
        let input = ConflictInput::new(unmerged, merged);
        {
            let state = self.shared.input();
            if input.is_covered_by(&state.baseline) {
                debug!(%input, baseline = %state.baseline, "input already covered");
                return Ok(());
            }
            if let Some(token) = &state.current {
                token.cancel();
            }
        }
        self.shared.outstanding.add(1);
        if tx.send(input).is_err() {
            self.shared.outstanding.done();
            return Err(ResolveError::ShutDown);
        }
        Ok(())
    }

    /// Wait until every requested resolution has finished, successfully or
    /// not, or until `ctx` is canceled.
    pub async fn wait(&self, ctx: &CancellationToken) -> Result<(), ResolveError> {
        self.shared.outstanding.wait_zero(ctx).await
    }

    /// Stop accepting requests, cancel the running attempt and halt the
    /// worker. Queued requests are discarded.
    pub fn shutdown(&self) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if tx.is_none() {
            return;
        }
        self.shutdown.cancel();
        self.force_cancel();
        info!("conflict resolver shutting down");
    }

    /// Shut down and wait for the worker to exit.
    pub async fn shutdown_and_join(&self) {
        self.shutdown();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "resolver worker panicked");
            }
        }
    }

    /// Cancel the running attempt, whatever its input.
    pub fn force_cancel(&self) {
        if let Some(token) = &self.shared.input().current {
            token.cancel();
        }
    }

    /// Forget the baseline so a fresh unmerged branch is resolved from its
    /// first revision, and resolve `branch` from now on.
    pub fn begin_new_branch(&self, branch: BranchId) {
        let mut state = self.shared.input();
        info!(branch = %branch, "beginning new unmerged branch");
        state.baseline = ConflictInput::default();
        state.branch = Some(branch);
        self.shared.stats.consecutive_failed.store(0, Ordering::SeqCst);
    }

    /// True once `max_resolution_attempts` consecutive attempts have failed.
    /// A stuck resolver refuses to run attempts until
    /// [`clear_failures`](Self::clear_failures) or a new branch.
    pub fn is_stuck(&self) -> bool {
        self.shared.is_stuck()
    }

    /// Forget recorded failures so the next request is attempted again.
    pub fn clear_failures(&self) {
        let previous = self.shared.stats.consecutive_failed.swap(0, Ordering::SeqCst);
        info!(previous, "cleared conflict resolution failures");
    }

    /// The tracked `(unmerged, merged)` baseline.
    pub fn current_input(&self) -> ConflictInput {
        self.shared.input().baseline
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Receive a report for every attempt that completes.
    pub fn subscribe(&self) -> broadcast::Receiver<ResolutionReport> {
        self.shared.reports.subscribe()
    }

    pub fn engine(&self) -> &ResolutionEngine<S> {
        &self.shared.engine
    }
}

impl<S: FolderStore> Drop for ConflictResolver<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker<S: FolderStore>(
    shared: Arc<Shared<S>>,
    mut rx: mpsc::UnboundedReceiver<ConflictInput>,
    shutdown: CancellationToken,
) {
    let mut previous: Option<JoinHandle<()>> = None;
    loop {
        let input = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            input = rx.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        let Some(accepted) = accept(&shared, input) else {
            debug!(%input, "ignoring uninteresting input");
            shared.outstanding.done();
            continue;
        };

        let wait_for = previous.take();
        let request_id = Uuid::new_v4();
        let span = info_span!("resolve", request_id = %request_id, unmerged = %input.unmerged, merged = %input.merged);
        let task_shared = shared.clone();
        previous = Some(tokio::spawn(
            async move {
                let mut guard = AttemptGuard::new(task_shared, accepted);
                if let Some(prev) = wait_for {
                    // The previous attempt was canceled when this input
                    // arrived; it only needs to unwind.
                    let _ = prev.await;
                }
                let result = attempt(&guard.shared, &guard.accepted, request_id).await;
                record(&guard.shared, result);
                guard.recorded = true;
            }
            .instrument(span),
        ));
    }

    rx.close();
    while rx.try_recv().is_ok() {
        shared.outstanding.done();
    }
    if let Some(token) = &shared.input().current {
        token.cancel();
    }
    if let Some(prev) = previous {
        let _ = prev.await;
    }
    debug!("resolver worker stopped");
}

/// Advance the baseline for `input` and start a new cancellation scope, or
/// return `None` if `input` brings nothing new.
fn accept<S>(shared: &Shared<S>, input: ConflictInput) -> Option<Accepted> {
    let mut state = shared.input();
    if input.is_covered_by(&state.baseline) {
        return None;
    }
    if let Some(token) = state.current.take() {
        token.cancel();
    }
    let prior = state.baseline;
    debug!(%input, old = %prior, "new conflict input");
    state.baseline = prior.max(&input);
    let token = CancellationToken::new();
    state.current = Some(token.clone());
    Some(Accepted {
        token,
        prior,
        branch: state.branch.clone(),
    })
}

async fn attempt<S: FolderStore>(
    shared: &Shared<S>,
    accepted: &Accepted,
    request_id: Uuid,
) -> Result<ResolutionReport, ResolveError> {
    let cancel = &accepted.token;
    cancel.check()?;
    if shared.is_stuck() {
        // Leave the input unresolved so it is retried once failures clear.
        restore_baseline(shared, accepted)?;
        return Err(ResolveError::TooManyAttempts {
            failures: shared.stats.consecutive_failed.load(Ordering::SeqCst),
        });
    }
    shared.stats.attempts.fetch_add(1, Ordering::SeqCst);
    info!("starting conflict resolution");

    let Some(branch) = &accepted.branch else {
        debug!("no unmerged branch to resolve");
        return Ok(ResolutionReport {
            request_id,
            branch: None,
            observed: None,
            committed: None,
            summary: Vec::new(),
            notifications: Vec::new(),
        });
    };

    let fetched = shared.engine.fetch(cancel, branch).await;
    let fetched = match fetched {
        Ok(fetched) => fetched,
        Err(_) if cancel.is_cancelled() => return Err(ResolveError::Canceled),
        Err(e) => return Err(e),
    };
    if let Some(observed) = fetched.observed() {
        update_baseline(shared, accepted, observed)?;
    }

    match shared.engine.resolve(cancel, request_id, branch, fetched).await {
        Err(e) if !matches!(e, ResolveError::Canceled) && cancel.is_cancelled() => {
            debug!(error = %e, "error after cancellation");
            Err(ResolveError::Canceled)
        }
        other => other,
    }
}

fn restore_baseline<S>(shared: &Shared<S>, accepted: &Accepted) -> Result<(), ResolveError> {
    let mut state = shared.input();
    accepted.token.check()?;
    state.baseline = accepted.prior;
    Ok(())
}

/// Check the fetched heads against the baseline and fold them in. On a
/// stale head the baseline returns to its value before this attempt.
fn update_baseline<S>(
    shared: &Shared<S>,
    accepted: &Accepted,
    observed: ConflictInput,
) -> Result<(), ResolveError> {
    let mut state = shared.input();
    // Checked under the lock so a newer input cannot slip in between.
    accepted.token.check()?;

    let baseline = state.baseline;
    let stale = if observed.unmerged < baseline.unmerged {
        Some(("unmerged", observed.unmerged, baseline.unmerged))
    } else if observed.merged < baseline.merged {
        Some(("merged", observed.merged, baseline.merged))
    } else {
        None
    };
    if let Some((branch, observed, baseline)) = stale {
        state.baseline = accepted.prior;
        return Err(ResolveError::StaleBaseline {
            branch,
            observed,
            baseline,
        });
    }
    state.baseline = baseline.max(&observed);
    Ok(())
}

fn record<S>(shared: &Shared<S>, result: Result<ResolutionReport, ResolveError>) {
    let stats = &shared.stats;
    match result {
        Ok(report) => {
            stats.consecutive_canceled.store(0, Ordering::SeqCst);
            stats.consecutive_failed.store(0, Ordering::SeqCst);
            if report.committed.is_some() {
                stats.resolved.fetch_add(1, Ordering::SeqCst);
            }
            info!(
                committed = ?report.committed.map(|r| r.0),
                actions = report.summary.len(),
                "conflict resolution finished"
            );
            let _ = shared.reports.send(report);
        }
        Err(ResolveError::Canceled) => {
            stats.canceled.fetch_add(1, Ordering::SeqCst);
            let consecutive = stats.consecutive_canceled.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(consecutive, "conflict resolution canceled");
            if consecutive > shared.canceled_threshold {
                warn!(
                    consecutive,
                    threshold = shared.canceled_threshold,
                    "conflict resolution keeps being superseded; branch looks stuck"
                );
            }
        }
        Err(e @ ResolveError::TooManyAttempts { .. }) => {
            warn!(error = %e, "skipping conflict resolution");
        }
        Err(e) => {
            let consecutive = shared.note_failure();
            if e.is_consistency() {
                error!(error = %e, consecutive, "conflict resolution failed");
            } else {
                warn!(error = %e, consecutive, transient = e.is_transient(), "conflict resolution failed");
            }
        }
    }
}
