//! Pipeline orchestration for topicdigest.
//!
//! A run goes through three stages joined by bounded queues:
//!
//! 1. the retriever crawls outward from search hits through the fetch gate
//!    and pushes [`FetchResult`](topicdigest_shared::FetchResult)s,
//! 2. the entity pool batches pages into LLM extraction calls,
//! 3. the theme pool batches entity records into LLM synthesis calls.
//!
//! [`Pipeline`] owns the run state machine, cancellation, and the final
//! accounting check; [`write_digest`] persists what it produced.

mod entity;
pub mod frontier;
pub mod gate;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod queue;
mod retriever;
pub mod retry;
pub mod store;
mod theme;

pub use entity::{MISSING_FROM_RESPONSE, assemble_records};
pub use frontier::Frontier;
pub use gate::{Gate, GatePermit};
pub use output::{Digest, digest_path, read_digest, topic_slug, write_digest};
pub use pipeline::{Pipeline, RunOutcome, RunReport, RunState};
pub use progress::{Progress, ProgressSnapshot, QueueCounters, QueueSnapshot};
pub use queue::WorkQueue;
pub use retry::{Retried, RetryPolicy};
pub use store::{ResultStore, StoreSnapshot};
