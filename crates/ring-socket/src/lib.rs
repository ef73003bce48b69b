//! Socket and TLS-adapter BIO engine (component C): multi-shot
//! buffer-select recv, linked-chain send/send-zerocopy, and a
//! poll-driven connect/close state machine, plus the BIO-adapter
//! contract a cryptographic binding consumes it through.

pub mod bio;
pub mod socket;

pub use bio::{BioTransport, RingBio};
pub use socket::{Socket, SocketEvent, SocketMode, SocketState};
