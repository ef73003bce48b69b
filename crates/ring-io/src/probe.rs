//! Opcode probing, mirroring the teacher's `ProbeRouter` but actually
//! registering the probe with the kernel (`IORING_REGISTER_PROBE`)
//! instead of only consulting `Probe::new()`'s compiled-in defaults.

use io_uring::{opcode, IoUring, Probe};

use ring_core::error::{Result, RingError};

/// Opcodes this crate depends on being available before a ring is
/// handed back to a caller.
const REQUIRED: &[u8] = &[
    opcode::PollAdd::CODE,
    opcode::PollRemove::CODE,
    opcode::Timeout::CODE,
    opcode::TimeoutRemove::CODE,
    opcode::AsyncCancel::CODE,
    opcode::Nop::CODE,
];

pub fn probe_supported_opcodes(ring: &IoUring) -> Result<Probe> {
    let mut probe = Probe::new();
    ring.submitter()
        .register_probe(&mut probe)
        .map_err(|e| RingError::SetupFailed(e.raw_os_error().unwrap_or(-1)))?;
    Ok(probe)
}

pub fn require_opcodes(probe: &Probe) -> Result<()> {
    for &op in REQUIRED {
        if !probe.is_supported(op) {
            return Err(RingError::Unsupported(op));
        }
    }
    Ok(())
}
