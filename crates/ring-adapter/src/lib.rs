//! Foreign-loop adapters: bind an external event loop's own blocking
//! wait to the ring's completion pump instead of the kernel's own
//! `poll(2)`/`epoll_wait(2)`.
//!
//! Two strategies, grounded on the two original adapters in this
//! workspace's lineage:
//!
//! - [`fiber`] (E1): runs the foreign loop on its own stack and
//!   replaces its poll-function hook with a stub that yields back to
//!   the caller. Needed when the loop's own run call has no
//!   non-blocking mode.
//! - [`backend`] (E2): arms a multi-shot poll on the loop's own backend
//!   descriptor and a synchronised timeout, running the loop's
//!   non-blocking iteration from a flusher. Needed when the loop
//!   already exposes one (its backend fd and a non-blocking run call).

pub mod backend;
pub mod error;
pub mod fiber;

pub use backend::{BackendAdapter, BackendLoop};
pub use error::{AdapterError, Result};
pub use fiber::{poll, FiberAdapter, PollRequest};
