/// Immutable point-in-time view of the service, cached by the facade for
/// a caller-specified validity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// Virtual instant this snapshot was generated.
    pub status_created_at_ms: i64,
    /// Entries currently queued for the dispatcher.
    pub main_queue_size: usize,
    /// Live (non-terminal) entries anywhere in the pipeline.
    pub live_requests: usize,
    /// Attempts currently holding a worker slot.
    pub active_workers: usize,
    /// Depth of each delay queue, by queue index.
    pub delay_queue_depths: Vec<usize>,
    /// Tickets currently available in the rate-limit bucket.
    pub tickets_available: u64,
    pub dispatcher_alive: bool,
    pub delay_drainers_alive: bool,
    pub replenisher_alive: bool,
    /// Whether the background status refresher is running. Vacuously true
    /// when refreshing is disabled (`status_cache_time` of zero).
    pub status_refresher_alive: bool,
    /// The executor accepts attempts until shutdown begins; unlike the
    /// task flags above this does not require `start()` to have run.
    pub executor_usable: bool,
}

impl ServiceStatus {
    /// True when every long-running task is alive and the executor is
    /// still accepting attempts.
    pub fn everything_alive(&self) -> bool {
        self.dispatcher_alive
            && self.delay_drainers_alive
            && self.replenisher_alive
            && self.status_refresher_alive
            && self.executor_usable
    }
}
