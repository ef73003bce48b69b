//! TLS-adapter BIO contract (§4.3.1 design note): a thin trait standing
//! in for OpenSSL's `BIO_METHOD` vtable, so a real binding can implement
//! its read/write/ctrl callbacks against this engine without this crate
//! reproducing OpenSSL's FFI surface.

use std::cell::Cell;
use std::sync::Arc;

use io_uring::opcode;

use ring_core::error::Result;
use ring_io::{Reason, Ring};

use crate::socket::{Socket, SocketEvent};

pub trait BioTransport {
    /// Pull up to `out.len()` bytes from the inbound chain. Returns the
    /// number of bytes written; `Ok(0)` means nothing is buffered yet.
    fn bio_read(&self, out: &mut [u8]) -> Result<usize>;

    /// Append `data` to the outbound chain. Returns the number of bytes
    /// accepted (always `data.len()` here; the underlying socket queues
    /// rather than rejecting, relying on its own backpressure signal).
    fn bio_write(&self, data: &[u8]) -> Result<usize>;

    /// Post a NOP descriptor that, on completion, re-enters the engine
    /// — used to wake this BIO from outside the ring's active cycle.
    fn bio_ctrl_touch(&self) -> Result<()>;
}

/// Binds a [`Socket`] to the [`BioTransport`] contract. Holds a raw
/// pointer to the owning ring rather than a reference so it can be
/// stored alongside the socket without threading a lifetime through
/// whatever owns the OpenSSL binding.
pub struct RingBio {
    socket: Arc<Socket>,
    ring: *const Ring,
    read_pos: Cell<usize>,
}

// Safety: `ring` is a non-owning pointer the caller guarantees outlives
// this adapter (see `RingBio::new`); `socket` is already `Send + Sync`.
unsafe impl Send for RingBio {}
unsafe impl Sync for RingBio {}

impl RingBio {
    /// # Safety
    /// `ring` must outlive this adapter and must be the same ring
    /// `socket` was constructed on.
    pub unsafe fn new(socket: Arc<Socket>, ring: &Ring) -> Self {
        Self {
            socket,
            ring: ring as *const Ring,
            read_pos: Cell::new(0),
        }
    }

    fn ring(&self) -> &Ring {
        unsafe { &*self.ring }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }
}

impl BioTransport for RingBio {
    fn bio_read(&self, out: &mut [u8]) -> Result<usize> {
        let mut written = 0;
        while written < out.len() {
            let Some(buf) = self.socket.pop_inbound() else { break };
            let data = unsafe { (*buf).as_slice() };
            let pos = self.read_pos.get();
            let avail = &data[pos..];
            let take = avail.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&avail[..take]);
            written += take;

            if pos + take < data.len() {
                self.read_pos.set(pos + take);
                self.socket.push_inbound_front(buf);
                break;
            }
            self.read_pos.set(0);
            self.socket.release_inbound(buf);
        }
        Ok(written)
    }

    fn bio_write(&self, data: &[u8]) -> Result<usize> {
        self.socket.transmit(self.ring(), data)?;
        Ok(data.len())
    }

    fn bio_ctrl_touch(&self) -> Result<()> {
        let socket = Arc::clone(&self.socket);
        let d = self.ring().allocate_descriptor(Box::new(move |_desc, _completion, reason| {
            if reason != Reason::Released {
                socket.emit(SocketEvent::Touch);
            }
            0
        }))?;
        unsafe { (*d).set_sqe(opcode::Nop::new().build()) };
        self.ring().submit(d, 0)
    }
}
