//! In-process retry-and-rate-limit scheduler.
//!
//! Callers submit opaque request payloads with a deadline and an optional
//! initial delay; the service repeatedly attempts each request until it
//! succeeds, exhausts its retries, hits its deadline, or is cancelled —
//! subject to an admission ceiling, a bounded worker pool, and a
//! ticket-bucket rate limiter. Each submission is represented by a
//! [`future::RequestFuture`] that resolves to the result or a typed
//! failure.
//!
//! The pipeline: submit → (delay queue if the first attempt is scheduled
//! beyond the grace window) → main queue → worker slot → ticket → attempt
//! → success / terminal failure / timeout, or a retry decision that loops
//! the entry back through a delay queue. A [`policy::DecisionPolicy`] is
//! consulted at every branch point and a
//! [`events::RetryEventListener`] is notified at every boundary.

pub mod backoff;
pub mod clock;
pub mod delay_queue;
pub mod entry;
pub mod events;
pub mod executor;
pub mod future;
pub mod log_listener;
pub mod policy;
pub mod service;
pub mod settings;
pub mod ticket_bucket;
pub mod trace;

pub use clock::Clock;
pub use entry::{AttemptError, CompletionState, Entry};
pub use events::{NoopEventListener, RetryEventListener};
pub use executor::RequestProcessor;
pub use future::{RequestFuture, RetryError};
pub use policy::{
    AfterAttemptDecision, DecisionPolicy, DefaultDecisionPolicy, DelayStepDecision,
    MainQueueDecision,
};
pub use service::{RetryService, ServiceStatus, SubmitError};
pub use settings::{RetryConfig, SettingsError};
pub use ticket_bucket::{TicketAcquireOutcome, TicketBucket};
