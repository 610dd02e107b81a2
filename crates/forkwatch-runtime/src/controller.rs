//! Graceful degradation controller.
//!
//! Runs a job's work items concurrently through the circuit breaker and the
//! rate-limit handler. When a circuit opens, work already in flight finishes
//! normally while newly dispatched items are deferred into a retry queue. A
//! ticker re-offers deferred items once the breaker starts admitting again.
//!
//! # Item states
//! ```text
//! Pending ──admit──▶ InFlight ──▶ Terminal
//!    │                  │
//!    └─denied─▶ Deferred ◀─rate limited
//!                  │
//!                  └─tick/admit─▶ InFlight
//! ```
//!
//! Deferred items wait in one FIFO per endpoint group, so a group that is still
//! failing never holds back one that has recovered. The queues and per-item
//! state are owned by the scheduling loop alone. Workers only touch the
//! breaker, through `record_*`, after their call.

use forkwatch_core::{ApiFailure, Failure, FailureKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::ResilienceConfig;
use crate::observer::{DeferReason, JobObserver, TracingObserver};
use crate::resilience::{
    Admission, CircuitBreaker, EndpointGroup, Permit, RateLimitHandler, RetryQueue,
};

/// Marker message for items never completed before a job timed out.
pub const BREAKER_EXHAUSTED: &str = "breaker exhausted";

/// A re-invocable call producing one item's result.
pub type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ApiFailure>> + Send + Sync>;

/// One unit of work: an identifier plus the call that performs it.
pub struct WorkItem<T> {
    id: String,
    group: EndpointGroup,
    op: Operation<T>,
}

impl<T> WorkItem<T> {
    /// Create a work item in the default endpoint group.
    pub fn new<F, Fut>(id: impl Into<String>, op: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiFailure>> + Send + 'static,
    {
        Self {
            id: id.into(),
            group: EndpointGroup::default(),
            op: Arc::new(move || op().boxed()),
        }
    }

    /// Place the item in a specific endpoint group.
    pub fn in_group(mut self, group: impl Into<EndpointGroup>) -> Self {
        self.group = group.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &EndpointGroup {
        &self.group
    }
}

/// Terminal outcome of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),

    /// Not found, forbidden, exhausted retries, or skipped due to sustained
    /// failures (`message == BREAKER_EXHAUSTED`).
    PermanentFailure(Failure),

    /// The job was cancelled before the item ran.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Kind of a permanent failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::PermanentFailure(failure) => Some(failure.kind),
            _ => None,
        }
    }

    /// Whether the item was skipped because the breaker never readmitted it.
    pub fn is_breaker_exhausted(&self) -> bool {
        matches!(self, Outcome::PermanentFailure(f) if f.message == BREAKER_EXHAUSTED)
    }
}

/// Per-item result returned by [`GracefulDegradationController::run_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport<T> {
    pub id: String,
    pub outcome: Outcome<T>,

    /// Times the item was dispatched to the handler
    pub dispatches: u32,

    /// Times the item entered the retry queue
    pub deferrals: u32,
}

/// Cancels a running job.
#[derive(Debug)]
pub struct CancellationHandle {
    tx: watch::Sender<bool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observed by the controller; see [`cancellation`].
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. Pends forever if the handle was dropped.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancellation handle and signal.
pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancellationHandle { tx }, CancellationSignal { rx })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemState {
    Pending,
    InFlight,
    Deferred,
    Terminal,
}

struct Slot<T> {
    item: WorkItem<T>,
    state: ItemState,
    outcome: Option<Outcome<T>>,
    dispatches: u32,
    deferrals: u32,
    rate_limit_deferrals: u32,
}

/// Result sent back from a worker.
struct Completion<T> {
    index: usize,
    result: Result<T, Failure>,
}

/// Mutable state of one `run_all` call.
struct Job<T> {
    slots: Vec<Slot<T>>,
    pending: VecDeque<usize>,
    queues: BTreeMap<EndpointGroup, RetryQueue<usize>>,
    in_flight: JoinSet<Completion<T>>,
    remaining: usize,
}

impl<T> Job<T> {
    fn deferred(&self) -> usize {
        self.queues.values().map(RetryQueue::len).sum()
    }

    fn groups(&self) -> Vec<EndpointGroup> {
        self.queues
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(group, _)| group.clone())
            .collect()
    }
}

/// Orchestrates concurrent per-item calls through the breaker.
pub struct GracefulDegradationController {
    breaker: Arc<CircuitBreaker>,
    handler: RateLimitHandler,
    concurrency: usize,
    retry_tick: Duration,
    job_timeout: Duration,
    max_deferrals: u32,
    max_rate_limit_wait: Duration,
    observer: Arc<dyn JobObserver>,
}

impl GracefulDegradationController {
    /// Create a controller over `breaker` with settings from `config`.
    pub fn new(breaker: Arc<CircuitBreaker>, config: &ResilienceConfig) -> Self {
        Self {
            breaker,
            handler: RateLimitHandler::from_config(config),
            concurrency: config.concurrency.max(1),
            retry_tick: config.retry_tick,
            job_timeout: config.job_timeout,
            max_deferrals: config.max_deferrals,
            max_rate_limit_wait: config.rate_limit.max_delay,
            observer: Arc::new(TracingObserver),
        }
    }

    /// Report deferrals and retries to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run every item to a terminal outcome.
    ///
    /// Returns exactly one report per item, in submission order.
    pub async fn run_all<T>(
        &self,
        items: Vec<WorkItem<T>>,
        mut cancel: CancellationSignal,
    ) -> Vec<ItemReport<T>>
    where
        T: Send + 'static,
    {
        let total = items.len();
        let mut job = Job {
            slots: items
                .into_iter()
                .map(|item| Slot {
                    item,
                    state: ItemState::Pending,
                    outcome: None,
                    dispatches: 0,
                    deferrals: 0,
                    rate_limit_deferrals: 0,
                })
                .collect(),
            pending: (0..total).collect(),
            queues: BTreeMap::new(),
            in_flight: JoinSet::new(),
            remaining: total,
        };

        let deadline = tokio::time::sleep(self.job_timeout);
        tokio::pin!(deadline);
        let first_tick = Instant::now() + self.retry_tick;
        let mut ticker = tokio::time::interval_at(first_tick, self.retry_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cancelled = cancel.is_cancelled();
        let mut timed_out = false;

        tracing::info!(items = total, concurrency = self.concurrency, "Starting job");

        while job.remaining > 0 {
            if !cancelled {
                self.refill_while_closed(&mut job);
                self.dispatch_pending(&mut job);
            }
            if cancelled && job.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(joined) = job.in_flight.join_next(), if !job.in_flight.is_empty() => {
                    match joined {
                        Ok(completion) => self.complete(&mut job, completion, cancelled),
                        Err(e) => tracing::error!(error = %e, "Worker task failed to join"),
                    }
                }
                _ = ticker.tick(), if job.deferred() > 0 && !cancelled => {
                    self.drain_on_tick(&mut job);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    tracing::info!(
                        in_flight = job.in_flight.len(),
                        "Job cancelled, letting in-flight calls finish"
                    );
                    cancelled = true;
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        remaining = job.remaining,
                        deferred = job.deferred(),
                        timeout = ?self.job_timeout,
                        "Job timed out"
                    );
                    timed_out = true;
                    break;
                }
            }
        }

        job.in_flight.abort_all();
        self.finish(job, timed_out)
    }

    /// Re-admit deferred items of every group whose circuit is closed.
    fn refill_while_closed<T: Send + 'static>(&self, job: &mut Job<T>) {
        for group in job.groups() {
            if self.breaker.state(&group).is_closed() {
                self.drain_group(job, &group);
            }
        }
    }

    /// Ticker: re-offer each group's deferred items in FIFO order until one
    /// is denied or not yet due.
    fn drain_on_tick<T: Send + 'static>(&self, job: &mut Job<T>) {
        let before = job.deferred();
        for group in job.groups() {
            self.drain_group(job, &group);
        }
        let drained = before - job.deferred();
        tracing::debug!(drained, still_deferred = job.deferred(), "Retry tick");
    }

    fn drain_group<T: Send + 'static>(&self, job: &mut Job<T>, group: &EndpointGroup) {
        while job.in_flight.len() < self.concurrency {
            if !self.readmit_head(job, group) {
                break;
            }
        }
    }

    /// Offer the head of `group`'s queue to the breaker. Returns whether an
    /// item was dispatched.
    fn readmit_head<T: Send + 'static>(&self, job: &mut Job<T>, group: &EndpointGroup) -> bool {
        let Some(queue) = job.queues.get_mut(group) else {
            return false;
        };
        let Some(index) = queue.pop_ready(Instant::now()) else {
            return false;
        };
        match self.breaker.admit(group) {
            Admission::Admitted(permit) => {
                self.observer.on_item_retried(job.slots[index].item.id());
                self.spawn(job, index, permit);
                true
            }
            Admission::Denied { .. } => {
                queue.push_front(index);
                false
            }
        }
    }

    /// Admit never-dispatched items; denied ones go straight to the queue.
    fn dispatch_pending<T: Send + 'static>(&self, job: &mut Job<T>) {
        while job.in_flight.len() < self.concurrency {
            let Some(index) = job.pending.pop_front() else { break };
            match self.breaker.admit(job.slots[index].item.group()) {
                Admission::Admitted(permit) => self.spawn(job, index, permit),
                Admission::Denied { retry_in } => {
                    self.defer(job, index, DeferReason::CircuitOpen { retry_in }, None);
                }
            }
        }
    }

    fn spawn<T: Send + 'static>(&self, job: &mut Job<T>, index: usize, permit: Permit) {
        let slot = &mut job.slots[index];
        slot.state = ItemState::InFlight;
        slot.dispatches += 1;

        let op = slot.item.op.clone();
        let handler = self.handler.clone();
        let breaker = self.breaker.clone();

        job.in_flight.spawn(async move {
            let call = handler.execute(|| op());
            let result = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Failure::new(FailureKind::Unknown, "operation panicked")),
            };
            match &result {
                Ok(_) => breaker.record_success(&permit),
                Err(failure) => breaker.record_failure(&permit, failure.kind),
            }
            Completion { index, result }
        });
    }

    fn defer<T>(
        &self,
        job: &mut Job<T>,
        index: usize,
        reason: DeferReason,
        not_before: Option<Instant>,
    ) {
        let slot = &mut job.slots[index];
        slot.state = ItemState::Deferred;
        slot.deferrals += 1;
        self.observer.on_item_deferred(slot.item.id(), reason);

        let queue = job.queues.entry(slot.item.group().clone()).or_default();
        match not_before {
            Some(at) => queue.push_delayed(index, at),
            None => queue.push(index),
        }
    }

    fn complete<T>(&self, job: &mut Job<T>, completion: Completion<T>, cancelled: bool) {
        let Completion { index, result } = completion;
        match result {
            Ok(value) => self.terminate(job, index, Outcome::Success(value)),
            Err(failure)
                if failure.kind == FailureKind::RateLimited
                    && !cancelled
                    && job.slots[index].rate_limit_deferrals < self.max_deferrals =>
            {
                job.slots[index].rate_limit_deferrals += 1;
                let wait = failure
                    .retry_after
                    .unwrap_or(self.retry_tick)
                    .min(self.max_rate_limit_wait);
                self.defer(job, index, DeferReason::RateLimited, Some(Instant::now() + wait));
            }
            Err(failure) => {
                tracing::debug!(
                    id = job.slots[index].item.id(),
                    kind = %failure.kind,
                    "Item failed permanently"
                );
                self.terminate(job, index, Outcome::PermanentFailure(failure));
            }
        }
    }

    fn terminate<T>(&self, job: &mut Job<T>, index: usize, outcome: Outcome<T>) {
        let slot = &mut job.slots[index];
        slot.state = ItemState::Terminal;
        slot.outcome = Some(outcome);
        job.remaining -= 1;
    }

    fn finish<T>(&self, job: Job<T>, timed_out: bool) -> Vec<ItemReport<T>> {
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut skipped = 0usize;

        let reports: Vec<ItemReport<T>> = job
            .slots
            .into_iter()
            .map(|slot| {
                let outcome = match (slot.outcome, slot.state) {
                    (Some(outcome), _) => outcome,
                    (None, ItemState::Deferred | ItemState::Pending) if timed_out => {
                        let failure = Failure::new(FailureKind::Unknown, BREAKER_EXHAUSTED);
                        Outcome::PermanentFailure(failure)
                    }
                    (None, ItemState::InFlight) => Outcome::PermanentFailure(Failure::new(
                        FailureKind::Unknown,
                        "job timed out while call in flight",
                    )),
                    (None, _) => Outcome::Cancelled,
                };
                match &outcome {
                    Outcome::Success(_) => succeeded += 1,
                    Outcome::PermanentFailure(_) => failed += 1,
                    Outcome::Cancelled => skipped += 1,
                }
                ItemReport {
                    id: slot.item.id,
                    outcome,
                    dispatches: slot.dispatches,
                    deferrals: slot.deferrals,
                }
            })
            .collect();

        tracing::info!(succeeded, failed, cancelled = skipped, timed_out, "Job finished");
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::RecordingObserver;
    use crate::resilience::{StateKind, Transition};
    use forkwatch_core::{BreakerProfile, FailureWeights};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.concurrency = 10;
        config.transient.max_attempts = 1;
        config.rate_limit.max_retries = 0;
        config.job_timeout = Duration::from_secs(600);
        config
    }

    fn controller(
        profile: BreakerProfile,
        config: &ResilienceConfig,
    ) -> GracefulDegradationController {
        let breaker = CircuitBreaker::new(profile, FailureWeights::default());
        GracefulDegradationController::new(Arc::new(breaker), config)
    }

    fn latency() -> Duration {
        Duration::from_millis(50)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_items_succeed() {
        let controller = controller(BreakerProfile::smallest(), &config());
        let items: Vec<WorkItem<usize>> = (0..25)
            .map(|i| {
                WorkItem::new(format!("fork-{i}"), move || async move {
                    tokio::time::sleep(latency()).await;
                    Ok(i)
                })
            })
            .collect();

        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert_eq!(reports.len(), 25);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.id, format!("fork-{i}"));
            assert_eq!(report.outcome, Outcome::Success(i));
            assert_eq!(report.dispatches, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_terminal_and_weightless() {
        let controller = controller(BreakerProfile::smallest(), &config());
        let calls = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem<()>> = (0..50)
            .map(|i| {
                let calls = calls.clone();
                WorkItem::new(format!("deleted-{i}"), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ApiFailure::http(404, "Not Found")) }
                })
            })
            .collect();

        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert!(reports
            .iter()
            .all(|r| r.outcome.failure_kind() == Some(FailureKind::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 50);
        assert!(controller.breaker().state(&EndpointGroup::default()).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opening_defers_rest_and_reports_every_item() {
        let mut config = config();
        config.job_timeout = Duration::from_secs(300);
        let controller = controller(BreakerProfile::for_item_count(2000), &config);
        let calls = Arc::new(AtomicUsize::new(0));

        let items: Vec<WorkItem<usize>> = (0..2000)
            .map(|i| {
                let calls = calls.clone();
                WorkItem::new(format!("fork-{i}"), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        tokio::time::sleep(latency()).await;
                        if i < 400 {
                            Ok(i)
                        } else {
                            Err(ApiFailure::http(503, "Service Unavailable"))
                        }
                    }
                })
            })
            .collect();

        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert_eq!(reports.len(), 2000);

        let successes = reports.iter().filter(|r| r.outcome.is_success()).count();
        assert_eq!(successes, 400);

        // Threshold 30 at weight 1.5 opens on the 20th failure; at most a
        // concurrency's worth of stragglers plus half-open probes follow.
        let server_errors = reports
            .iter()
            .filter(|r| r.outcome.failure_kind() == Some(FailureKind::ServerError))
            .count();
        assert!(server_errors >= 20, "server errors: {server_errors}");
        assert!(server_errors < 20 + 10 + 50, "server errors: {server_errors}");

        let exhausted = reports.iter().filter(|r| r.outcome.is_breaker_exhausted()).count();
        assert_eq!(successes + server_errors + exhausted, 2000);
        assert_eq!(calls.load(Ordering::SeqCst), 400 + server_errors);
        assert!(controller.breaker().times_opened(&EndpointGroup::default()) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_items_recover_after_outage() {
        let mut config = config();
        config.job_timeout = Duration::from_secs(3600);
        let observer = Arc::new(RecordingObserver::default());
        let profile = BreakerProfile {
            open_threshold: 3.0,
            half_open_after: Duration::from_secs(30),
            half_open_probe_count: 2,
        };
        let breaker = Arc::new(
            CircuitBreaker::new(profile, FailureWeights::uniform()).with_listener({
                let observer = observer.clone();
                Arc::new(move |t: &Transition| observer.on_breaker_transition(t))
            }),
        );
        let controller =
            GracefulDegradationController::new(breaker, &config).with_observer(observer.clone());

        let start = Instant::now();
        let outage = Duration::from_secs(45);
        let items: Vec<WorkItem<usize>> = (0..200)
            .map(|i| {
                WorkItem::new(format!("fork-{i}"), move || async move {
                    tokio::time::sleep(latency()).await;
                    if i >= 20 && start.elapsed() < outage {
                        Err(ApiFailure::Connection("reset".into()))
                    } else {
                        Ok(i)
                    }
                })
            })
            .collect();

        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert_eq!(reports.len(), 200);

        let failed: Vec<_> = reports.iter().filter(|r| !r.outcome.is_success()).collect();
        // Only the calls that tripped the breaker (and in-flight stragglers)
        // fail; every deferred item eventually succeeds.
        assert!(failed.len() <= 10 + 2, "failed: {}", failed.len());
        assert!(failed
            .iter()
            .all(|r| r.outcome.failure_kind() == Some(FailureKind::Network)));
        assert!(reports.iter().any(|r| r.deferrals > 0 && r.outcome.is_success()));

        let transitions = observer.transitions.lock().clone();
        assert_eq!(transitions.first(), Some(&(StateKind::Closed, StateKind::Open)));
        assert_eq!(transitions.last(), Some(&(StateKind::HalfOpen, StateKind::Closed)));
        assert!(!observer.deferred.lock().is_empty());
        assert!(!observer.retried.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_item_is_deferred_then_succeeds() {
        let mut config = config();
        config.retry_tick = Duration::from_secs(5);
        let controller = controller(BreakerProfile::smallest(), &config);
        let calls = Arc::new(AtomicUsize::new(0));

        let item = {
            let calls = calls.clone();
            WorkItem::new("limited", move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ApiFailure::http(429, "").with_header("retry-after", "20"))
                    } else {
                        Ok("done")
                    }
                }
            })
        };

        let start = Instant::now();
        let reports = controller.run_all(vec![item], CancellationSignal::never()).await;
        assert_eq!(reports[0].outcome, Outcome::Success("done"));
        assert_eq!(reports[0].deferrals, 2);
        assert_eq!(reports[0].dispatches, 3);
        assert!(start.elapsed() >= Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_deferrals_are_bounded() {
        let mut config = config();
        config.max_deferrals = 2;
        config.retry_tick = Duration::from_secs(1);
        let controller = controller(BreakerProfile::smallest(), &config);

        let item = WorkItem::<()>::new("limited", || async {
            Err(ApiFailure::http(429, "").with_header("retry-after", "1"))
        });
        let reports = controller.run_all(vec![item], CancellationSignal::never()).await;
        assert_eq!(reports[0].outcome.failure_kind(), Some(FailureKind::RateLimited));
        assert_eq!(reports[0].dispatches, 3);
        assert!(controller.breaker().state(&EndpointGroup::default()).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_lets_in_flight_finish() {
        let mut config = config();
        config.concurrency = 2;
        let controller = controller(BreakerProfile::smallest(), &config);
        let (handle, signal) = cancellation();

        let items: Vec<WorkItem<usize>> = (0..10)
            .map(|i| {
                WorkItem::new(format!("fork-{i}"), move || async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(i)
                })
            })
            .collect();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            handle.cancel();
        });

        let reports = controller.run_all(items, signal).await;
        assert_eq!(reports.len(), 10);
        let outcomes: Vec<_> = reports.iter().map(|r| r.outcome.clone()).collect();
        assert_eq!(&outcomes[..4], &[0, 1, 2, 3].map(Outcome::Success));
        assert!(outcomes[4..].iter().all(|o| *o == Outcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_job_runs_nothing() {
        let controller = controller(BreakerProfile::smallest(), &config());
        let (handle, signal) = cancellation();
        handle.cancel();

        let calls = Arc::new(AtomicUsize::new(0));
        let items: Vec<WorkItem<()>> = (0..3)
            .map(|i| {
                let calls = calls.clone();
                WorkItem::new(format!("fork-{i}"), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })
            })
            .collect();

        let reports = controller.run_all(items, signal).await;
        assert!(reports.iter().all(|r| r.outcome == Outcome::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_in_flight_items() {
        let mut config = config();
        config.job_timeout = Duration::from_secs(10);
        let controller = controller(BreakerProfile::smallest(), &config);

        let items = vec![
            WorkItem::new("fast", || async { Ok(1) }),
            WorkItem::new("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(2)
            }),
        ];
        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert_eq!(reports[0].outcome, Outcome::Success(1));
        assert_eq!(reports[1].outcome.failure_kind(), Some(FailureKind::Unknown));
        assert!(!reports[1].outcome.is_breaker_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_degrade_independently() {
        let controller = controller(BreakerProfile::smallest(), &config());
        let mut items: Vec<WorkItem<&'static str>> = Vec::new();
        for i in 0..30 {
            items.push(
                WorkItem::new(format!("commits-{i}"), || async {
                    tokio::time::sleep(latency()).await;
                    Err(ApiFailure::http(500, ""))
                })
                .in_group("commits"),
            );
            items.push(
                WorkItem::new(format!("repos-{i}"), || async {
                    tokio::time::sleep(latency()).await;
                    Ok("meta")
                })
                .in_group("repos"),
            );
        }

        let mut config = config();
        config.job_timeout = Duration::from_secs(120);
        let controller = GracefulDegradationController::new(controller.breaker().clone(), &config);
        let reports = controller.run_all(items, CancellationSignal::never()).await;

        let repos_ok = reports
            .iter()
            .filter(|r| r.id.starts_with("repos-") && r.outcome.is_success())
            .count();
        assert_eq!(repos_ok, 30);
        assert!(controller
            .breaker()
            .state(&EndpointGroup::from("repos"))
            .is_closed());
        assert!(!controller
            .breaker()
            .state(&EndpointGroup::from("commits"))
            .is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_group_is_not_starved_by_failing_group() {
        let mut config = config();
        config.concurrency = 1;
        config.retry_tick = Duration::from_secs(5);
        config.job_timeout = Duration::from_secs(120);
        let profile = BreakerProfile {
            open_threshold: 2.0,
            half_open_after: Duration::from_secs(10),
            half_open_probe_count: 1,
        };
        let breaker = CircuitBreaker::new(profile, FailureWeights::uniform());
        let controller = GracefulDegradationController::new(Arc::new(breaker), &config);

        let start = Instant::now();
        let mut items: Vec<WorkItem<usize>> = (0..30)
            .map(|i| {
                WorkItem::new(format!("commits-{i}"), || async {
                    tokio::time::sleep(latency()).await;
                    Err(ApiFailure::http(500, ""))
                })
                .in_group("commits")
            })
            .collect();
        items.extend((0..10).map(|i| {
            WorkItem::new(format!("repos-{i}"), move || async move {
                tokio::time::sleep(latency()).await;
                if start.elapsed() < Duration::from_secs(1) {
                    Err(ApiFailure::Connection("reset".into()))
                } else {
                    Ok(i)
                }
            })
            .in_group("repos")
        }));

        let reports = controller.run_all(items, CancellationSignal::never()).await;
        assert_eq!(reports.len(), 40);

        let repos: Vec<_> = reports.iter().filter(|r| r.id.starts_with("repos-")).collect();
        assert!(repos.iter().all(|r| !r.outcome.is_breaker_exhausted()));
        assert!(repos[..2]
            .iter()
            .all(|r| r.outcome.failure_kind() == Some(FailureKind::Network)));
        for (i, report) in repos.iter().enumerate().skip(2) {
            assert_eq!(report.outcome, Outcome::Success(i));
        }
        assert!(controller
            .breaker()
            .state(&EndpointGroup::from("repos"))
            .is_closed());
        assert!(!controller
            .breaker()
            .state(&EndpointGroup::from("commits"))
            .is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_wait_is_capped() {
        let mut config = config();
        config.retry_tick = Duration::from_secs(5);
        config.rate_limit.max_delay = Duration::from_secs(30);
        let controller = controller(BreakerProfile::smallest(), &config);
        let calls = Arc::new(AtomicUsize::new(0));

        let item = {
            let calls = calls.clone();
            WorkItem::new("limited", move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ApiFailure::http(429, "").with_header("retry-after", "3600"))
                    } else {
                        Ok("done")
                    }
                }
            })
        };

        let start = Instant::now();
        let reports = controller.run_all(vec![item], CancellationSignal::never()).await;
        assert_eq!(reports[0].outcome, Outcome::Success("done"));
        assert_eq!(reports[0].deferrals, 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(30), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(60), "elapsed: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reports_deferred_items_as_cancelled() {
        let mut config = config();
        config.concurrency = 1;
        let profile = BreakerProfile {
            open_threshold: 2.0,
            half_open_after: Duration::from_secs(60),
            half_open_probe_count: 1,
        };
        let breaker = CircuitBreaker::new(profile, FailureWeights::uniform());
        let controller = GracefulDegradationController::new(Arc::new(breaker), &config);
        let (handle, signal) = cancellation();
        let calls = Arc::new(AtomicUsize::new(0));

        let items: Vec<WorkItem<()>> = (0..10)
            .map(|i| {
                let calls = calls.clone();
                WorkItem::new(format!("fork-{i}"), move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(latency()).await;
                        Err(ApiFailure::Connection("reset".into()))
                    }
                })
            })
            .collect();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.cancel();
        });

        let reports = controller.run_all(items, signal).await;
        assert_eq!(reports.len(), 10);
        assert!(reports[..2]
            .iter()
            .all(|r| r.outcome.failure_kind() == Some(FailureKind::Network)));
        for report in &reports[2..] {
            assert_eq!(report.outcome, Outcome::Cancelled);
            assert_eq!(report.deferrals, 1);
            assert_eq!(report.dispatches, 0);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_signal_never_is_not_cancelled() {
        assert!(!CancellationSignal::never().is_cancelled());
    }
}
