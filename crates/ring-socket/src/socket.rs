//! Multi-shot socket engine (component C): inbound buffer-select recv,
//! outbound IOSQE_IO_LINK send batches with send-zerocopy, and a
//! one-shot poll that detects write-readiness and hangup/error.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use io_uring::{opcode, types};

use ring_buffer::provider::ProvidedBuffers;
use ring_buffer::{Buffer, BufferPool};
use ring_core::error::{Result, RingError};
use ring_io::{Completion, Payload, Reason, Ring};

/// Kernel poll bits this engine watches, matching `libc::POLL*`.
pub mod poll {
    pub const IN: u32 = libc::POLLIN as u32;
    pub const OUT: u32 = libc::POLLOUT as u32;
    pub const HUP: u32 = libc::POLLHUP as u32;
    pub const ERR: u32 = libc::POLLERR as u32;
}

/// Not exposed as a named constant by this workspace's `io-uring`
/// version; value is stable ABI per `io_uring.h`.
const CQE_F_NOTIF: u32 = 1 << 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Active,
    Closing,
    Freed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SocketMode {
    pub zerocopy: bool,
    pub auto_cork: bool,
    pub recvmsg: bool,
}

#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    Readable { total: usize },
    Writable,
    Error(i32),
    Closed,
    /// Raised by a BIO's `bio_ctrl_touch` NOP re-entering the engine.
    Touch,
}

pub type SocketCallback = dyn FnMut(&Socket, SocketEvent) + Send;

/// Inbound/outbound queue + poll-driven state machine bound to a single
/// file descriptor. Constructed once per connection; its `Arc` owner
/// count is the "refcount" the state-machine notes defer freeing to.
pub struct Socket {
    fd: RawFd,
    state: Cell<SocketState>,
    mode: SocketMode,
    buf_group: u16,
    provider: Arc<Mutex<dyn ProvidedBuffers>>,
    inbound_pool: Arc<BufferPool>,
    outbound_pool: Arc<BufferPool>,
    inbound: Mutex<VecDeque<*mut Buffer>>,
    inbound_len: AtomicUsize,
    outbound_inflight: AtomicUsize,
    outbound_limit: usize,
    backpressure: AtomicBool,
    recv_descriptor: Cell<*mut ring_io::Descriptor>,
    connect_descriptor: Cell<*mut ring_io::Descriptor>,
    /// Template header for `RecvMsgMulti` when `mode.recvmsg` is set;
    /// the kernel only reads `msg_namelen`/`msg_controllen` from it, the
    /// buffer itself still comes from the buffer-select group.
    recvmsg_template: Box<libc::msghdr>,
    callback: RefCell<Box<SocketCallback>>,
}

// Safety: the Cell/RefCell fields are only touched from descriptor
// callbacks, which this workspace's ring only ever invokes on its
// owner thread; the Mutex/Atomic fields are safe to share as-is.
unsafe impl Send for Socket {}
unsafe impl Sync for Socket {}

/// Context kept alive for one addressed send: the destination address,
/// iovec and msghdr the kernel reads while `SendMsg`/`SendMsgZc` is in
/// flight. Boxed so its address is stable; moved into the completion
/// closure so it stays alive until the CQE (and, for zerocopy, the
/// notification CQE) arrives.
struct SendMsgCtx {
    addr: libc::sockaddr_storage,
    iov: libc::iovec,
    msghdr: libc::msghdr,
}

fn sockaddr_from(peer: std::net::SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match peer {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        std::net::SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

impl Socket {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        ring: &Ring,
        fd: RawFd,
        mode: SocketMode,
        buf_group: u16,
        provider: Arc<Mutex<dyn ProvidedBuffers>>,
        inbound_pool: Arc<BufferPool>,
        outbound_pool: Arc<BufferPool>,
        outbound_limit: usize,
        callback: Box<SocketCallback>,
    ) -> Result<Arc<Self>> {
        Self::create_with_recvmsg_capacity(ring, fd, mode, buf_group, provider, inbound_pool, outbound_pool, outbound_limit, 0, 0, callback)
    }

    /// As [`Self::create`], but also sizes the `RecvMsgMulti` template's
    /// `msg_namelen`/`msg_controllen` capacities for `mode.recvmsg`
    /// sockets — an unconnected (e.g. UDP) socket needs `namelen` at
    /// least `size_of::<sockaddr_storage>()` to get the peer address
    /// back on every datagram.
    #[allow(clippy::too_many_arguments)]
    pub fn create_with_recvmsg_capacity(
        ring: &Ring,
        fd: RawFd,
        mode: SocketMode,
        buf_group: u16,
        provider: Arc<Mutex<dyn ProvidedBuffers>>,
        inbound_pool: Arc<BufferPool>,
        outbound_pool: Arc<BufferPool>,
        outbound_limit: usize,
        recvmsg_namelen: u32,
        recvmsg_controllen: u32,
        callback: Box<SocketCallback>,
    ) -> Result<Arc<Self>> {
        let mut recvmsg_template: libc::msghdr = unsafe { std::mem::zeroed() };
        if mode.recvmsg {
            recvmsg_template.msg_namelen = recvmsg_namelen;
            recvmsg_template.msg_controllen = recvmsg_controllen as _;
        }
        let socket = Arc::new(Self {
            fd,
            state: Cell::new(SocketState::Connecting),
            mode,
            buf_group,
            provider,
            inbound_pool,
            outbound_pool,
            inbound: Mutex::new(VecDeque::new()),
            inbound_len: AtomicUsize::new(0),
            outbound_inflight: AtomicUsize::new(0),
            outbound_limit,
            backpressure: AtomicBool::new(false),
            recv_descriptor: Cell::new(std::ptr::null_mut()),
            connect_descriptor: Cell::new(std::ptr::null_mut()),
            recvmsg_template: Box::new(recvmsg_template),
            callback: RefCell::new(callback),
        });
        socket.arm_connect_poll(ring)?;
        Ok(socket)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub(crate) fn emit(&self, event: SocketEvent) {
        (self.callback.borrow_mut())(self, event);
    }

    fn arm_connect_poll(self: &Arc<Self>, ring: &Ring) -> Result<()> {
        let me = Arc::clone(self);
        let d = ring.arm_poll(self.fd, poll::OUT | poll::HUP | poll::ERR, false, Box::new(move |_desc, completion, reason| {
            me.on_connect_complete(completion, reason);
            0
        }))?;
        self.connect_descriptor.set(d);
        Ok(())
    }

    fn on_connect_complete(&self, completion: Option<Completion>, reason: Reason) {
        if reason == Reason::Released {
            return;
        }
        let Some(completion) = completion else { return };
        if completion.result < 0 {
            self.state.set(SocketState::Closing);
            self.emit(SocketEvent::Error(-completion.result));
            return;
        }
        let revents = completion.result as u32;
        if revents & (poll::HUP | poll::ERR) != 0 {
            self.state.set(SocketState::Closing);
            self.emit(SocketEvent::Error(0));
            return;
        }
        self.state.set(SocketState::Active);
        self.emit(SocketEvent::Connected);
    }

    /// Arm the multi-shot BUFFER_SELECT recv. Call once the socket is
    /// Active (after the connect poll resolves, or immediately for an
    /// already-connected fd such as an accepted stream).
    pub fn arm_recv(self: &Arc<Self>, ring: &Ring) -> Result<()> {
        let me = Arc::clone(self);
        let d = ring.allocate_descriptor(Box::new(move |_desc, completion, reason| me.on_recv_complete(completion, reason)))?;
        unsafe {
            (*d).set_payload(Payload::Recv { buf_group: self.buf_group });
            let sqe = if self.mode.recvmsg {
                opcode::RecvMsgMulti::new(types::Fd(self.fd), self.recvmsg_template.as_ref() as *const _, self.buf_group).build()
            } else {
                opcode::RecvMulti::new(types::Fd(self.fd), self.buf_group).build()
            };
            (*d).set_sqe(sqe);
        }
        ring.submit(d, 0)?;
        self.recv_descriptor.set(d);
        Ok(())
    }

    fn on_recv_complete(&self, completion: Option<Completion>, reason: Reason) -> u8 {
        if reason == Reason::Released {
            return 0;
        }
        let Some(completion) = completion else { return 0 };
        let more = io_uring::cqueue::more(completion.flags);

        if completion.result < 0 {
            let errno = -completion.result;
            if errno == libc::ENOBUFS {
                return if more { 1 } else { 0 };
            }
            self.emit(SocketEvent::Error(errno));
            return if more { 1 } else { 0 };
        }

        if completion.result == 0 {
            self.state.set(SocketState::Closing);
            self.emit(SocketEvent::Closed);
            return 0;
        }

        let bid = io_uring::cqueue::buffer_select(completion.flags).expect("BUFFER_SELECT recv always carries a buffer id");
        self.consume_provided_buffer(bid, completion.result as usize);

        if more {
            1
        } else {
            self.state.set(SocketState::Closing);
            self.emit(SocketEvent::Closed);
            0
        }
    }

    fn consume_provided_buffer(&self, bid: u16, len: usize) {
        let boxed = {
            let mut provider = self.provider.lock().unwrap();
            // Safety: `bid` came straight from this completion's
            // BUFFER_SELECT result and has not been taken elsewhere.
            let boxed = unsafe { provider.take(bid) };
            provider.advance(bid);
            boxed
        };

        let out = self.inbound_pool.acquire(len, false);
        unsafe {
            (*out).as_mut_slice()[..len].copy_from_slice(&boxed[..len]);
            (*out).set_len(len);
        }
        let total = {
            let mut inbound = self.inbound.lock().unwrap();
            inbound.push_back(out);
            self.inbound_len.fetch_add(len, Ordering::AcqRel) + len
        };
        self.emit(SocketEvent::Readable { total });
    }

    /// Pop the oldest received buffer, or `None` if empty. The caller
    /// becomes the sole owner and must eventually call
    /// [`Self::release_inbound`].
    pub fn pop_inbound(&self) -> Option<*mut Buffer> {
        let mut inbound = self.inbound.lock().unwrap();
        let buf = inbound.pop_front()?;
        self.inbound_len.fetch_sub(unsafe { (*buf).len() }, Ordering::AcqRel);
        Some(buf)
    }

    /// Push a partially-consumed buffer back to the front of the queue.
    pub fn push_inbound_front(&self, buf: *mut Buffer) {
        self.inbound_len.fetch_add(unsafe { (*buf).len() }, Ordering::AcqRel);
        self.inbound.lock().unwrap().push_front(buf);
    }

    pub fn release_inbound(&self, buf: *mut Buffer) {
        self.inbound_pool.release(buf);
    }

    pub fn inbound_len(&self) -> usize {
        self.inbound_len.load(Ordering::Acquire)
    }

    /// Copy `data` into a fresh outbound buffer and submit a send (or
    /// send-zerocopy, per this socket's mode). A single descriptor per
    /// call; batching multiple calls into one IOSQE_IO_LINK chain is
    /// the caller's responsibility (see §4.3's auto-cork flush handler,
    /// not reproduced at this layer).
    pub fn transmit(self: &Arc<Self>, ring: &Ring, data: &[u8]) -> Result<()> {
        if self.state.get() != SocketState::Active {
            return Err(RingError::SubmitFailed(libc::ENOTCONN));
        }

        let buf = self.outbound_pool.acquire(data.len(), false);
        unsafe {
            (*buf).as_mut_slice()[..data.len()].copy_from_slice(data);
            (*buf).set_len(data.len());
        }

        let me = Arc::clone(self);
        let outbound_pool = Arc::clone(&self.outbound_pool);
        let sqe = unsafe {
            if self.mode.zerocopy {
                opcode::SendZc::new(types::Fd(self.fd), (*buf).as_ptr(), data.len() as u32).build()
            } else {
                opcode::Send::new(types::Fd(self.fd), (*buf).as_ptr(), data.len() as u32).build()
            }
        };

        let d = ring.allocate_descriptor(Box::new(move |_desc, completion, reason| {
            me.on_send_complete(&outbound_pool, buf, completion, reason)
        }))?;
        unsafe {
            (*d).set_payload(Payload::Send);
            (*d).set_sqe(sqe);
        }

        let inflight = self.outbound_inflight.fetch_add(1, Ordering::AcqRel) + 1;
        if inflight >= self.outbound_limit {
            self.backpressure.store(true, Ordering::Release);
        }
        ring.submit(d, 0)?;
        Ok(())
    }

    /// Copy `data` into a fresh outbound buffer and submit an addressed
    /// `SendMsg`/`SendMsgZc` to `peer` — the sendto-style path a single
    /// bound (unconnected) socket needs to serve many peers. See
    /// [`Self::transmit`] for the connected-fd equivalent.
    pub fn transmit_to(self: &Arc<Self>, ring: &Ring, peer: std::net::SocketAddr, data: &[u8]) -> Result<()> {
        if matches!(self.state.get(), SocketState::Closing | SocketState::Freed) {
            return Err(RingError::SubmitFailed(libc::ENOTCONN));
        }

        let buf = self.outbound_pool.acquire(data.len(), false);
        unsafe {
            (*buf).as_mut_slice()[..data.len()].copy_from_slice(data);
            (*buf).set_len(data.len());
        }

        let (addr, addr_len) = sockaddr_from(peer);
        let mut ctx = Box::new(SendMsgCtx {
            addr,
            iov: libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 },
            msghdr: unsafe { std::mem::zeroed() },
        });
        unsafe {
            ctx.iov.iov_base = (*buf).as_ptr() as *mut _;
            ctx.iov.iov_len = data.len();
            ctx.msghdr.msg_name = &mut ctx.addr as *mut _ as *mut libc::c_void;
            ctx.msghdr.msg_namelen = addr_len;
            ctx.msghdr.msg_iov = &mut ctx.iov;
            ctx.msghdr.msg_iovlen = 1;
        }

        let msghdr_ptr = &ctx.msghdr as *const libc::msghdr;
        let sqe = unsafe {
            if self.mode.zerocopy {
                opcode::SendMsgZc::new(types::Fd(self.fd), msghdr_ptr).build()
            } else {
                opcode::SendMsg::new(types::Fd(self.fd), msghdr_ptr).build()
            }
        };

        let me = Arc::clone(self);
        let outbound_pool = Arc::clone(&self.outbound_pool);
        let d = ring.allocate_descriptor(Box::new(move |_desc, completion, reason| {
            let _ctx = &ctx;
            me.on_send_complete(&outbound_pool, buf, completion, reason)
        }))?;
        unsafe {
            (*d).set_payload(Payload::Send);
            (*d).set_sqe(sqe);
        }

        let inflight = self.outbound_inflight.fetch_add(1, Ordering::AcqRel) + 1;
        if inflight >= self.outbound_limit {
            self.backpressure.store(true, Ordering::Release);
        }
        ring.submit(d, 0)?;
        Ok(())
    }

    fn on_send_complete(&self, outbound_pool: &BufferPool, buf: *mut Buffer, completion: Option<Completion>, reason: Reason) -> u8 {
        if reason == Reason::Released {
            outbound_pool.release(buf);
            return 0;
        }
        let Some(completion) = completion else {
            outbound_pool.release(buf);
            return 0;
        };

        let is_notif = completion.flags & CQE_F_NOTIF != 0;
        if self.mode.zerocopy && !is_notif {
            // Provisional completion: the kernel has read from `buf` but
            // doesn't release ownership until the notification CQE.
            if completion.result < 0 {
                self.emit(SocketEvent::Error(-completion.result));
            }
            return 1;
        }

        outbound_pool.release(buf);
        let remaining = self.outbound_inflight.fetch_sub(1, Ordering::AcqRel) - 1;
        if completion.result < 0 && !is_notif {
            self.emit(SocketEvent::Error(-completion.result));
        }
        if remaining < self.outbound_limit && self.backpressure.swap(false, Ordering::AcqRel) {
            self.emit(SocketEvent::Writable);
        }
        0
    }

    /// Active → Closing: cancel the inbound recv (NOP-rewrite if still
    /// Pending, async cancel otherwise) and let outstanding sends drain
    /// naturally. Actual teardown happens when the last `Arc` drops.
    pub fn close(&self, ring: &Ring) -> Result<()> {
        if self.state.get() == SocketState::Freed {
            return Ok(());
        }
        self.state.set(SocketState::Closing);
        let recv_d = self.recv_descriptor.get();
        if !recv_d.is_null() {
            ring.cancel(recv_d)?;
        }
        let connect_d = self.connect_descriptor.get();
        if !connect_d.is_null() {
            ring.cancel(connect_d)?;
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.state.set(SocketState::Freed);
        let mut inbound = self.inbound.lock().unwrap();
        while let Some(buf) = inbound.pop_front() {
            self.inbound_pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_mode_defaults_are_all_off() {
        let mode = SocketMode::default();
        assert!(!mode.zerocopy);
        assert!(!mode.auto_cork);
        assert!(!mode.recvmsg);
    }

    #[test]
    fn poll_bits_match_libc_and_are_distinct() {
        assert_eq!(poll::IN, libc::POLLIN as u32);
        assert_eq!(poll::OUT, libc::POLLOUT as u32);
        let bits = [poll::IN, poll::OUT, poll::HUP, poll::ERR];
        for (i, a) in bits.iter().enumerate() {
            for (j, b) in bits.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b);
                }
            }
        }
    }

    #[test]
    fn notif_flag_does_not_overlap_buffer_select_or_more() {
        // IORING_CQE_F_BUFFER = 1<<0, IORING_CQE_F_MORE = 1<<1.
        assert_eq!(CQE_F_NOTIF & 0b11, 0);
    }
}
