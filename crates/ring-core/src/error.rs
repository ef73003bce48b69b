//! Cross-cutting kernel/resource error taxonomy shared by every ring crate.

use std::fmt;

#[derive(Debug)]
pub enum RingError {
    /// `io_uring_setup` (or the `io-uring` crate's builder) failed.
    SetupFailed(i32),
    /// A required opcode is not supported by the running kernel.
    Unsupported(u8),
    /// `io_uring_enter` / submit returned a non-zero, non-retryable error.
    SubmitFailed(i32),
    /// Descriptor or buffer allocation returned null — caller must back off.
    ResourceExhausted,
    /// A completion's user_data did not match the descriptor's current
    /// identity; the completion was for a stale generation and was dropped.
    IntegrityMismatch,
    /// Registered-file or registered-buffer table operation failed.
    RegistrationFailed(i32),
    /// Caller is not the ring's owner thread.
    WrongThread,
    /// Generic OS error with errno.
    Os(i32),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupFailed(e) => write!(f, "ring setup failed: errno {}", e),
            Self::Unsupported(op) => write!(f, "opcode {} not supported by this kernel", op),
            Self::SubmitFailed(e) => write!(f, "submit failed: errno {}", e),
            Self::ResourceExhausted => write!(f, "descriptor or buffer pool exhausted"),
            Self::IntegrityMismatch => write!(f, "completion integrity tag mismatch"),
            Self::RegistrationFailed(e) => write!(f, "registration failed: errno {}", e),
            Self::WrongThread => write!(f, "called from a thread that does not own this ring"),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
        }
    }
}

impl std::error::Error for RingError {}

pub type Result<T> = std::result::Result<T, RingError>;
