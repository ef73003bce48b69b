//! The ring substrate (component A): owns the `io_uring` instance,
//! allocates and recycles submission descriptors, pumps completions,
//! and exposes the poll/timeout/registered-resource primitives every
//! other crate in this workspace is a client of.

pub mod descriptor;
pub mod flusher;
pub mod pending;
pub mod probe;
pub mod registered;
pub mod ring;

pub use descriptor::{Callback, Completion, Descriptor, Payload, Reason, State};
pub use ring::{Ring, RingConfig};
