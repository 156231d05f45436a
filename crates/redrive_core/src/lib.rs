//! Deadline-bounded pacing and fan-in primitives for redrive campaigns.
//!
//! A campaign pulls a high-throughput stream of work items from many
//! paginated upstream cursors at once and delivers each item through a
//! rate-limited downstream operation, finishing (or giving up) by an
//! absolute deadline shared by every component.
//!
//! The crate provides the pieces of that pipeline in data-flow order:
//!
//! - [`source`] wraps one paginated collaborator cursor so that no single
//!   page fetch can block past the campaign deadline.
//! - [`merge`] races any number of those cursors concurrently and exposes
//!   their union as one stream, interleaved by arrival.
//! - [`pacing`] wraps an arbitrary asynchronous operation in a self-clocked
//!   AIMD (additive increase/multiplicative decrease) controller that delays,
//!   retries and eventually gives up based on the remaining budget.
//! - [`campaign`] glues the three together: pull, optionally short-circuit,
//!   schedule through the controller, wait for everything to drain.
//!
//! Work items are opaque to every component here; acknowledgment and
//! delivery semantics belong to the collaborators supplied by the caller.

pub mod campaign;
pub mod merge;
pub mod pacing;
pub mod source;

#[macro_use]
extern crate tracing;

/// Boxed error type shared across collaborator seams.
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
