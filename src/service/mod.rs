//! Service facade and the shared pipeline core.
//!
//! The long-running tasks are split across submodules:
//!
//! - `dispatcher`: drains the main queue, stages slot/ticket acquisition,
//!   interprets attempt outcomes
//! - `drainer`: one loop per delay queue
//! - `status`: snapshot generation and caching

mod dispatcher;
mod drainer;
mod status;

pub use status::ServiceStatus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::delay_queue::DelayQueuePool;
use crate::entry::{AttemptError, Entry, Outcome};
use crate::events::{EventDispatcher, RetryEventListener};
use crate::log_listener::LoggingEventListener;
use crate::executor::{AttemptCompletion, AttemptExecutor, RequestProcessor};
use crate::future::RequestFuture;
use crate::policy::{DecisionPolicy, DefaultDecisionPolicy};
use crate::settings::{RetryConfig, SettingsError};
use crate::ticket_bucket::TicketBucket;

/// Why a submission was refused. Surfaced synchronously to the submitter;
/// refusals never produce a future.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("too many already-processing requests ({limit} pending)")]
    TooManyPending { limit: usize },
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("service is shutting down")]
    ShuttingDown,
}

/// State shared by the facade, the dispatcher, and the drainers.
pub(crate) struct Core<I, O> {
    pub config: RetryConfig,
    pub clock: Clock,
    pub events: EventDispatcher<I, O>,
    pub policy: Arc<dyn DecisionPolicy<I, O>>,
    pub delay_pool: Arc<DelayQueuePool<I, O>>,
    pub tickets: Arc<TicketBucket>,
    pub executor: Arc<AttemptExecutor<I, O>>,
    pub token: CancellationToken,
    pub shutting_down: AtomicBool,

    main_tx: mpsc::UnboundedSender<Arc<Entry<I, O>>>,
    pub main_depth: AtomicUsize,
    live: AtomicUsize,
    live_drained: Notify,
    registry: Mutex<HashMap<Uuid, Arc<Entry<I, O>>>>,
}

impl<I, O> Core<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn register(&self, entry: &Arc<Entry<I, O>>) {
        self.registry
            .lock()
            .unwrap()
            .insert(entry.id(), Arc::clone(entry));
    }

    /// Post-terminal cleanup: `request_removed`, registry removal, live
    /// count. Callers invoke this only after winning the terminal
    /// transition, so it runs exactly once per entry.
    fn remove_entry(&self, entry: &Arc<Entry<I, O>>) {
        self.events.emit(|l| l.request_removed(entry));
        self.registry.lock().unwrap().remove(&entry.id());
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.live_drained.notify_waiters();
        }
    }

    pub fn finish_success(
        &self,
        entry: &Arc<Entry<I, O>>,
        value: O,
        attempt: u32,
        duration_ms: i64,
    ) {
        if entry.complete(Outcome::Success(value.clone())) {
            self.events
                .emit(|l| l.request_success(entry, &value, attempt, duration_ms));
            self.remove_entry(entry);
        }
    }

    pub fn finish_failure(&self, entry: &Arc<Entry<I, O>>, cause: Option<AttemptError>) {
        if entry.complete(Outcome::Failure(cause.clone())) {
            self.events
                .emit(|l| l.request_final_failure(entry, cause.as_ref()));
            self.remove_entry(entry);
        }
    }

    pub fn finish_timeout(&self, entry: &Arc<Entry<I, O>>) {
        if entry.complete(Outcome::TimedOut) {
            let remaining = entry.remaining_validity_ms(self.now());
            self.events
                .emit(|l| l.request_final_timeout(entry, remaining));
            self.remove_entry(entry);
        }
    }

    pub fn finish_cancelled(&self, entry: &Arc<Entry<I, O>>) {
        if entry.complete(Outcome::Cancelled) {
            self.remove_entry(entry);
        }
    }

    /// Hand an entry to the dispatcher's FIFO.
    pub fn enqueue_main(&self, entry: Arc<Entry<I, O>>) {
        self.main_depth.fetch_add(1, Ordering::AcqRel);
        if let Err(rejected) = self.main_tx.send(entry) {
            // Dispatcher is gone; only happens once shutdown has begun.
            self.main_depth.fetch_sub(1, Ordering::AcqRel);
            self.finish_cancelled(&rejected.0);
        }
    }

    /// Route an entry to the main queue or a delay queue based on its
    /// `not_before` and the grace window.
    ///
    /// Admission through the grace window clamps `not_before` to now: the
    /// window means "counts as now", which keeps every attempt start at or
    /// after the entry's `not_before`.
    pub fn route(&self, entry: Arc<Entry<I, O>>, now_ms: i64) {
        let not_before = entry.not_before_ms();
        if not_before <= now_ms + self.config.early_processing_grace_ms {
            if not_before > now_ms {
                entry.set_not_before_ms(now_ms);
            }
            self.enqueue_main(entry);
        } else {
            self.delay_pool.push(entry, now_ms);
        }
    }
}

struct TaskHandles {
    dispatcher: Option<JoinHandle<()>>,
    drainers: Vec<JoinHandle<()>>,
    replenisher: Option<JoinHandle<()>>,
    status_refresher: Option<JoinHandle<()>>,
}

/// In-process retry-and-rate-limit scheduler.
///
/// Submit a request with a deadline and get a [`RequestFuture`]; the
/// service repeatedly attempts it until success, terminal failure,
/// deadline, or cancellation, subject to the worker-pool budget and the
/// ticket-bucket rate limiter.
pub struct RetryService<I, O> {
    core: Arc<Core<I, O>>,
    main_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Entry<I, O>>>>>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<AttemptCompletion<I, O>>>>,
    handles: Mutex<TaskHandles>,
    started: AtomicBool,
    status_cache: Mutex<Option<ServiceStatus>>,
}

impl<I, O> RetryService<I, O>
where
    I: Send + Sync + 'static,
    O: Clone + Send + 'static,
{
    /// Build a service with the default decision policy and a listener
    /// that forwards noteworthy events to `tracing`, throttled.
    pub fn new(
        config: RetryConfig,
        processor: Arc<dyn RequestProcessor<I, O>>,
    ) -> Result<Arc<Self>, SettingsError> {
        let policy = Arc::new(DefaultDecisionPolicy::new(&config));
        let listener = Arc::new(LoggingEventListener::with_defaults(Clock::new(
            config.time_factor,
        )));
        Self::with_hooks(config, processor, policy, listener)
    }

    /// Build a service with explicit decision policy and event listener.
    pub fn with_hooks(
        config: RetryConfig,
        processor: Arc<dyn RequestProcessor<I, O>>,
        policy: Arc<dyn DecisionPolicy<I, O>>,
        listener: Arc<dyn RetryEventListener<I, O>>,
    ) -> Result<Arc<Self>, SettingsError> {
        config.validate()?;
        let clock = Clock::new(config.time_factor);
        let token = CancellationToken::new();
        let events = EventDispatcher::new(listener);

        let (main_tx, main_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let tickets = TicketBucket::new(&config, clock, token.clone());
        let executor = AttemptExecutor::new(
            config.worker_count,
            processor,
            completion_tx,
            events.clone(),
            clock,
        );
        let delay_pool = DelayQueuePool::new(config.delay_queue_count);

        let core = Arc::new(Core {
            config,
            clock,
            events,
            policy,
            delay_pool,
            tickets,
            executor,
            token,
            shutting_down: AtomicBool::new(false),
            main_tx,
            main_depth: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            live_drained: Notify::new(),
            registry: Mutex::new(HashMap::new()),
        });

        Ok(Arc::new(Self {
            core,
            main_rx: Mutex::new(Some(main_rx)),
            completion_rx: Mutex::new(Some(completion_rx)),
            handles: Mutex::new(TaskHandles {
                dispatcher: None,
                drainers: Vec::new(),
                replenisher: None,
                status_refresher: None,
            }),
            started: AtomicBool::new(false),
            status_cache: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &RetryConfig {
        &self.core.config
    }

    /// Spawn the long-running tasks: dispatcher, delay-queue drainers, and
    /// the ticket replenisher. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let main_rx = self
            .main_rx
            .lock()
            .unwrap()
            .take()
            .expect("main queue receiver present before first start");
        let completion_rx = self
            .completion_rx
            .lock()
            .unwrap()
            .take()
            .expect("completion receiver present before first start");

        let mut handles = self.handles.lock().unwrap();
        handles.dispatcher = Some(tokio::spawn(dispatcher::run(
            Arc::clone(&self.core),
            main_rx,
            completion_rx,
        )));
        for idx in 0..self.core.delay_pool.queue_count() {
            handles
                .drainers
                .push(tokio::spawn(drainer::run(Arc::clone(&self.core), idx)));
        }
        handles.replenisher = Some(self.core.tickets.start_replenisher());
        if self.core.config.status_cache_time_ms > 0 {
            handles.status_refresher = Some(tokio::spawn(Self::run_status_refresher(Arc::clone(
                self,
            ))));
        }
        debug!(service = %self.core.config.service_name, "retry service started");
    }

    /// Background status refresher: regenerates the cached snapshot every
    /// `status_cache_time`, so callers that tolerate caching never read a
    /// snapshot older than that interval. Only spawned when the interval
    /// is non-zero.
    async fn run_status_refresher(service: Arc<Self>) {
        let interval = service
            .core
            .clock
            .real_duration_for_virtual(service.core.config.status_cache_time_ms);
        loop {
            tokio::select! {
                _ = service.core.token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let fresh = service.build_status(service.core.now());
            *service.status_cache.lock().unwrap() = Some(fresh);
        }
        debug!("status refresher stopped");
    }

    /// Stop the service: refuse new submissions, give live requests up to
    /// `graceful_ms` (virtual time) to finish, then cancel every wait and
    /// terminate whatever is left as Cancelled. Every outstanding future
    /// is signalled. Idempotent.
    pub async fn shutdown(&self, graceful_ms: i64) {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if graceful_ms > 0 && self.core.live_count() > 0 {
            let window = self.core.clock.real_duration_for_virtual(graceful_ms);
            let deadline = Instant::now() + window;
            while self.core.live_count() > 0 {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                let drained = self.core.live_drained.notified();
                if self.core.live_count() == 0 {
                    break;
                }
                let _ = tokio::time::timeout(left, drained).await;
            }
        }

        self.core.token.cancel();

        // Sweep everything still live; completion is first-writer-wins, so
        // entries that finished while we were cancelling are untouched.
        let leftover: Vec<_> = {
            let registry = self.core.registry.lock().unwrap();
            registry.values().cloned().collect()
        };
        let leftover_count = leftover.len();
        for entry in leftover {
            self.core.finish_cancelled(&entry);
        }
        if leftover_count > 0 {
            warn!(
                service = %self.core.config.service_name,
                cancelled = leftover_count,
                "shutdown cancelled live requests"
            );
        }

        let (dispatcher, drainers, replenisher, status_refresher) = {
            let mut handles = self.handles.lock().unwrap();
            (
                handles.dispatcher.take(),
                std::mem::take(&mut handles.drainers),
                handles.replenisher.take(),
                handles.status_refresher.take(),
            )
        };
        let join_window = Duration::from_millis(1_000);
        if let Some(h) = dispatcher {
            let _ = tokio::time::timeout(join_window, h).await;
        }
        for h in drainers {
            let _ = tokio::time::timeout(join_window, h).await;
        }
        if let Some(h) = replenisher {
            let _ = tokio::time::timeout(join_window, h).await;
        }
        if let Some(h) = status_refresher {
            let _ = tokio::time::timeout(join_window, h).await;
        }
        debug!(service = %self.core.config.service_name, "retry service stopped");
    }

    /// Submit a request valid until the given absolute instant (virtual
    /// epoch ms), first attempt eligible immediately.
    pub fn submit_until(
        &self,
        input: I,
        valid_until_ms: i64,
    ) -> Result<RequestFuture<I, O>, SubmitError> {
        let now = self.core.now();
        self.submit_inner(input, now, now, valid_until_ms)
    }

    /// Submit a request with a validity window of `timeout_ms` from now.
    pub fn submit_for(&self, input: I, timeout_ms: i64) -> Result<RequestFuture<I, O>, SubmitError> {
        let now = self.core.now();
        self.submit_inner(input, now, now, now + timeout_ms)
    }

    /// Submit with a validity window and an initial delay before the first
    /// attempt.
    pub fn submit_for_with_delay(
        &self,
        input: I,
        timeout_ms: i64,
        delay_ms: i64,
    ) -> Result<RequestFuture<I, O>, SubmitError> {
        let now = self.core.now();
        self.submit_inner(input, now, now + delay_ms.max(0), now + timeout_ms)
    }

    /// Submit with absolute deadline and absolute earliest-attempt instant.
    pub fn submit_until_with_delay_until(
        &self,
        input: I,
        valid_until_ms: i64,
        not_before_ms: i64,
    ) -> Result<RequestFuture<I, O>, SubmitError> {
        let now = self.core.now();
        self.submit_inner(input, now, not_before_ms.max(now), valid_until_ms)
    }

    fn submit_inner(
        &self,
        input: I,
        now_ms: i64,
        not_before_ms: i64,
        valid_until_ms: i64,
    ) -> Result<RequestFuture<I, O>, SubmitError> {
        let core = &self.core;
        let time_limit_ms = valid_until_ms - now_ms;
        let delay_ms = not_before_ms - now_ms;

        if core.shutting_down.load(Ordering::Acquire) || core.token.is_cancelled() {
            core.events.emit(|l| {
                l.error_request_rejected(&input, time_limit_ms, delay_ms, "service is shutting down")
            });
            return Err(SubmitError::ShuttingDown);
        }
        if valid_until_ms <= now_ms {
            let msg = format!("validity window is not positive ({time_limit_ms}ms)");
            core.events
                .emit(|l| l.error_request_rejected(&input, time_limit_ms, delay_ms, &msg));
            return Err(SubmitError::InvalidSchedule(msg));
        }
        if not_before_ms > valid_until_ms {
            let msg = format!(
                "first attempt delay ({delay_ms}ms) extends past the validity window ({time_limit_ms}ms)"
            );
            core.events
                .emit(|l| l.error_request_rejected(&input, time_limit_ms, delay_ms, &msg));
            return Err(SubmitError::InvalidSchedule(msg));
        }

        // Claim a live slot under the global ceiling.
        let limit = core.config.max_pending_requests;
        let claimed = core
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live >= limit {
                    None
                } else {
                    Some(live + 1)
                }
            })
            .is_ok();
        if !claimed {
            core.events.emit(|l| {
                l.error_request_rejected(
                    &input,
                    time_limit_ms,
                    delay_ms,
                    "too many already-processing requests",
                )
            });
            return Err(SubmitError::TooManyPending { limit });
        }

        let entry = Entry::new(input, now_ms, not_before_ms, valid_until_ms, &core.token);
        core.register(&entry);
        core.events.emit(|l| l.request_added(&entry));
        core.route(Arc::clone(&entry), now_ms);
        // A shutdown that raced past the flag check above has already swept
        // the registry; make sure this entry's future is settled too.
        if core.token.is_cancelled() {
            core.finish_cancelled(&entry);
        }
        Ok(RequestFuture::new(entry))
    }

    /// Status snapshot: the cached one while its age is at most
    /// `cache_ms`, a fresh one otherwise.
    pub fn status(&self, cache_ms: i64) -> ServiceStatus {
        let now = self.core.now();
        let mut cache = self.status_cache.lock().unwrap();
        if let Some(snapshot) = &*cache {
            if now - snapshot.status_created_at_ms <= cache_ms {
                return snapshot.clone();
            }
        }
        let fresh = self.build_status(now);
        *cache = Some(fresh.clone());
        fresh
    }

    fn build_status(&self, now_ms: i64) -> ServiceStatus {
        let handles = self.handles.lock().unwrap();
        let dispatcher_alive = handles
            .dispatcher
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        let delay_drainers_alive = !handles.drainers.is_empty()
            && handles.drainers.iter().all(|h| !h.is_finished());
        let replenisher_alive = handles
            .replenisher
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        let status_refresher_alive = if self.core.config.status_cache_time_ms > 0 {
            handles
                .status_refresher
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false)
        } else {
            // Refreshing disabled: the task is not supposed to exist.
            true
        };
        let executor_usable = !self.core.token.is_cancelled();
        ServiceStatus {
            status_created_at_ms: now_ms,
            main_queue_size: self.core.main_depth.load(Ordering::Acquire),
            live_requests: self.core.live_count(),
            active_workers: self.core.executor.active_workers(),
            delay_queue_depths: self.core.delay_pool.depths(),
            tickets_available: self.core.tickets.available(),
            dispatcher_alive,
            delay_drainers_alive,
            replenisher_alive,
            status_refresher_alive,
            executor_usable,
        }
    }
}
