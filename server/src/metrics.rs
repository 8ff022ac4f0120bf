//! Call dispatch metrics.

use metriken::{Counter, Gauge, metric};

#[metric(name = "grpc_calls_started", description = "Calls routed to a method handler")]
pub static CALLS_STARTED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_completed",
    description = "Calls finished with status OK"
)]
pub static CALLS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_failed",
    description = "Calls finished with a non-OK status"
)]
pub static CALLS_FAILED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_deadline_exceeded",
    description = "Calls finalized because their deadline expired"
)]
pub static CALLS_DEADLINE_EXCEEDED: Counter = Counter::new();

#[metric(
    name = "grpc_calls_unimplemented",
    description = "Requests for an unknown service or method"
)]
pub static CALLS_UNIMPLEMENTED: Counter = Counter::new();

#[metric(name = "grpc_messages_received", description = "Request messages read")]
pub static MESSAGES_RECEIVED: Counter = Counter::new();

#[metric(name = "grpc_messages_sent", description = "Response messages written")]
pub static MESSAGES_SENT: Counter = Counter::new();

#[metric(name = "grpc_calls_active", description = "Calls currently in flight")]
pub static CALLS_ACTIVE: Gauge = Gauge::new();

/// Tracks one in-flight call on [`CALLS_ACTIVE`].
pub(crate) struct ActiveCall;

impl ActiveCall {
    pub(crate) fn start() -> Self {
        CALLS_STARTED.increment();
        CALLS_ACTIVE.increment();
        Self
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        CALLS_ACTIVE.decrement();
    }
}
