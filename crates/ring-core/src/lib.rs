//! Shared foundation for the ring workspace: the cross-cutting error
//! enum, the descriptor identity-token bit layout, and the ABA-safe
//! lock-free stack primitive every free list / flusher list / buffer
//! heap in this workspace is built on.

pub mod aba;
pub mod error;
pub mod token;

pub use aba::{AbaLinked, AbaStack};
pub use error::{Result, RingError};
pub use token::{IdentityToken, DESCRIPTOR_ALIGNMENT, INTEGRITY_MASK, OPTION_IGNORE, OPTION_MASK, OPTION_USER1, OPTION_USER2};
