//! Audit trail for notification deliveries.
//!
//! Audit persistence never blocks or fails the delivery path: events are
//! enqueued without waiting and written in batches by a background task.

mod event;
mod pipeline;
mod store;

pub use event::{AuditEvent, EVENT_ATTEMPT, EVENT_CIRCUIT_OPEN, EVENT_COMPLETED};
pub use pipeline::{
    AuditConfig, AuditError, AuditHandle, AuditPipeline, AuditStatsSnapshot, DROP_BUFFER_FULL,
    DROP_CLOSED, DROP_DEAD_LETTER_FAILED,
};
pub use store::{
    AuditStore, DeadLetterQueue, FileDeadLetterQueue, HttpAuditStore, HttpAuditStoreConfig,
    InMemoryAuditStore,
};
