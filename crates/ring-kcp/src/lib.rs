//! KCP-style reliable datagram conversation engine: congestion control,
//! MSS fragmentation/reassembly and a pluggable wire `Format` /
//! `Transmitter` pair, driven by a `Service` conversation table. Mirrors
//! `KCPService.{h,c}` from the original.

pub mod congestion;
pub mod conversation;
pub mod segment;
pub mod service;
pub mod wire;

#[cfg(feature = "udp")]
pub mod udp;

pub use congestion::Congestion;
pub use conversation::{Cause, Conversation, Event, Key, PeerAddr};
pub use service::{Handler, KcpError, Service, Transmitter};
pub use wire::{Control, Format, StandardFormat};
