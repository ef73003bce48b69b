//! A single KCP conversation: reassembly, ACK processing and the
//! egress flush loop. Mirrors `KCPConversation`/`HandleIncomingKCPSegment`
//! /`FlushKCPConversation` from the original.

use std::net::{SocketAddrV4, SocketAddrV6};
use std::sync::Arc;

use crate::congestion::Congestion;
use crate::segment::{Segment, SegmentQueue, ANCHOR, NUMBERED, SENT};
use crate::wire::{Control, Format, CMD_ACK, CMD_PUSH, CMD_WASK, CMD_WINS};
use crate::{KcpError, Transmitter};

pub const DETACHED: u32 = 1 << 0;
pub const SILENT: u32 = 1 << 1;
pub const GUARD: u32 = 1 << 2;
pub const DEAD: u32 = 1 << 3;

pub const DEFAULT_TIMEOUT_MS: u32 = 90_000;
pub const DEFAULT_TRIES: u32 = 8;

const BUFFER_ALIGNMENT: usize = 1024;

/// Peer endpoint; hashable so it can sit in a `Key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

/// Identifies a conversation: application id, conversation id and the
/// peer's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub application: u64,
    pub conversation: u64,
    pub peer: PeerAddr,
}

/// Why a conversation transitioned to `Dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    Timeout,
    Reset,
}

/// Lifecycle/application events a [`crate::Service`] surfaces through
/// its handler callback.
#[derive(Debug)]
pub enum Event<'a> {
    Create,
    Remove,
    Receive(&'a [u8]),
}

/// Outcome of dispatching one incoming segment, used internally by
/// `Service` to decide what (if anything) needs transmitting or
/// surfacing to the handler.
pub(crate) enum Dispatch {
    None,
    Messages(Vec<Vec<u8>>),
    WindowAsk(u16),
}

/// One reliable datagram conversation: inbound/outbound segment
/// queues, congestion state and the reassembly scratch buffer.
pub struct Conversation {
    pub key: Key,
    pub(crate) format: Arc<dyn Format>,
    pub(crate) state: u32,
    pub timeout_ms: u32,
    pub tries_limit: u32,
    last_active_ms: u32,
    pub cause: Option<Cause>,
    inbound: SegmentQueue,
    outbound: SegmentQueue,
    congestion: Congestion,
    scratch: Vec<u8>,
    /// Free-form user data, the Rust equivalent of the original's
    /// per-conversation `void* closure`.
    pub closure: Option<Box<dyn std::any::Any + Send>>,
}

impl Conversation {
    pub(crate) fn new(key: Key, format: Arc<dyn Format>, now_ms: u32) -> Self {
        Self {
            key,
            format,
            state: 0,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tries_limit: DEFAULT_TRIES,
            last_active_ms: now_ms,
            cause: None,
            inbound: SegmentQueue::new(),
            outbound: SegmentQueue::new(),
            congestion: Congestion::new(),
            scratch: Vec::new(),
            closure: None,
        }
    }

    /// Segments currently queued outbound (sent-and-unacked plus not
    /// yet sent). Diagnostic only.
    pub fn outbound_len(&self) -> u32 {
        self.outbound.len()
    }

    pub fn is_dead(&self) -> bool {
        self.state & DEAD != 0
    }

    pub fn is_detached(&self) -> bool {
        self.state & DETACHED != 0
    }

    pub(crate) fn touch(&mut self, now_ms: u32) {
        self.last_active_ms = now_ms;
    }

    fn mark_dead(&mut self, cause: Cause) {
        self.state |= DEAD;
        self.cause = Some(cause);
    }

    pub(crate) fn format(&self) -> &Arc<dyn Format> {
        &self.format
    }

    /// Apply the peer's advertised window, unconditionally — applied
    /// before dispatching on `cmd`, matching the original's ordering.
    pub(crate) fn apply_remote_window(&mut self, wnd: u16) {
        self.congestion.set_remote_window(wnd as u32);
    }

    pub(crate) fn dispatch(&mut self, now_ms: u32, control: Control, payload: Vec<u8>) -> Result<Dispatch, KcpError> {
        match control.cmd {
            CMD_PUSH => self.handle_push(now_ms, control, payload),
            CMD_ACK => Ok(self.handle_ack(now_ms, control)),
            CMD_WASK => Ok(Dispatch::WindowAsk(self.congestion.window_size(self.inbound.len()))),
            CMD_WINS => Ok(Dispatch::None),
            _ => Err(KcpError::UnknownCommand(control.cmd)),
        }
    }

    fn handle_push(&mut self, now_ms: u32, control: Control, payload: Vec<u8>) -> Result<Dispatch, KcpError> {
        let window = self.congestion.local_wnd;
        let segment = Segment::new(control, payload);

        if let Err(_old_or_dup) = self.inbound.put(segment, window, self.congestion.rcv_nxt) {
            // Too old or a duplicate: the peer will be re-acked below
            // without advancing rcvNxt, same as the original.
            self.congestion.ack.cmd = CMD_PUSH;
            self.congestion.ack.ts = control.ts;
            self.congestion.ack.sn = control.sn;
            self.congestion.ack_due = now_ms;
            return Ok(Dispatch::None);
        }

        let mut messages = Vec::new();
        let mut newest: Option<Control> = None;
        let mut pos = self.inbound.head();
        let mut run_len = 0usize;

        while pos != self.inbound.tail() {
            let Some(seg) = self.inbound.get(pos) else { break };
            if seg.state & ANCHOR == 0 {
                let ctl = seg.control;
                run_len += seg.data.len();
                if ctl.frg == 0 {
                    messages.push(self.reassemble(pos, run_len));
                    run_len = 0;
                }
                newest = Some(ctl);
            }
            pos = pos.wrapping_add(1);
        }

        if let Some(ctl) = newest {
            let next_expected = ctl.sn.wrapping_add(1);
            if next_expected != self.congestion.rcv_nxt {
                self.congestion.rcv_nxt = next_expected;
                self.congestion.ack.ts = ctl.ts;
                self.congestion.ack.sn = ctl.sn;

                if (self.inbound.len() as i32) >= self.congestion.ack_thresh as i32 {
                    self.congestion.ack.cmd = CMD_PUSH;
                    self.congestion.ack_due = now_ms;
                } else if self.congestion.ack.cmd == 0 {
                    self.congestion.ack.cmd = CMD_ACK;
                    self.congestion.ack_due = now_ms.wrapping_add(self.congestion.interval);
                }
            }
        }

        Ok(Dispatch::Messages(messages))
    }

    /// Concatenate the contiguous run of `count` segments ending at
    /// (and including) the frg=0 segment at `last_pos`, anchoring the
    /// last fragment as a placeholder for window accounting and
    /// releasing the rest. Returns the reassembled message bytes.
    fn reassemble(&mut self, last_pos: u32, byte_len: usize) -> Vec<u8> {
        if self.scratch.len() < byte_len {
            let size = (byte_len + BUFFER_ALIGNMENT - 1) & !(BUFFER_ALIGNMENT - 1);
            self.scratch.resize(size, 0);
        }

        // A previous message's last fragment is left anchored at head as
        // a window-accounting placeholder; release it lazily now that a
        // new message is ready, before walking forward to this one.
        let head = self.inbound.head();
        if self.inbound.get(head).is_some_and(|s| s.state & ANCHOR != 0) {
            self.inbound.take(head);
            self.inbound.advance_head_to(head);
        }

        // Walk forward from the current head, releasing every fragment
        // up to (but not including) the anchor, then anchor the last.
        let mut offset = 0;
        loop {
            let pos = self.inbound.head();
            if pos == last_pos {
                break;
            }
            if let Some(seg) = self.inbound.take(pos) {
                self.scratch[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
                offset += seg.data.len();
            }
            self.inbound.advance_head_to(pos);
        }

        if let Some(seg) = self.inbound.get_mut(last_pos) {
            self.scratch[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
            offset += seg.data.len();
            seg.state |= ANCHOR;
        }

        self.scratch[..offset].to_vec()
    }

    fn handle_ack(&mut self, now_ms: u32, control: Control) -> Dispatch {
        let una = control.una;
        let explicit_sn = control.sn;
        let mut fast_guard = false;

        if (una.wrapping_sub(self.congestion.snd_una) as i32) >= 0 {
            while !self.outbound.is_empty() {
                let pos = self.outbound.head();
                let sn = self.outbound.get(pos).unwrap().control.sn;
                if sn == una {
                    break;
                }
                fast_guard |= sn == explicit_sn;
                let ts = self.outbound.get(pos).unwrap().control.ts;
                self.congestion.on_rtt_sample(now_ms.wrapping_sub(ts));
                self.outbound.take(pos);
                self.outbound.advance_head_to(pos);
            }
            self.congestion.on_progress(self.congestion.snd_una, una);
        }

        if !fast_guard && self.congestion.fastresend != 0 {
            let before_sn = (explicit_sn.wrapping_sub(self.congestion.next_sn) as i32) < 0;
            let after_una = (explicit_sn.wrapping_sub(self.congestion.snd_una) as i32) >= 0;
            if before_sn && after_una {
                let mut pos = self.outbound.head();
                while pos != self.outbound.tail() {
                    if self.outbound.get(pos).unwrap().control.sn == explicit_sn {
                        break;
                    }
                    // Only accumulate here; `flush`'s `fast_due` check is
                    // the sole place that retransmits and collapses cwnd,
                    // once `track` crosses the threshold.
                    self.outbound.get_mut(pos).unwrap().track += 1;
                    pos = pos.wrapping_add(1);
                }
            }
        }

        Dispatch::None
    }

    /// Split `data` into MSS-sized fragments (last fragment `frg=0`)
    /// and append them, unsent, to the outbound queue.
    pub fn submit(&mut self, data: &[u8]) -> Result<(), KcpError> {
        if self.state & DETACHED != 0 {
            return Err(KcpError::Detached);
        }
        if self.state & DEAD != 0 {
            return Err(KcpError::Reset);
        }

        let mss = self.congestion.mss as usize;
        let count = if data.is_empty() { 1 } else { data.len().div_ceil(mss) };

        for i in 0..count {
            let start = i * mss;
            let end = (start + mss).min(data.len());
            let frg = (count - 1 - i) as u8;
            let control = Control { cmd: CMD_PUSH, frg, wnd: 0, ts: 0, sn: 0, una: 0 };
            self.outbound.push(Segment::new(control, data[start..end].to_vec()));
        }
        Ok(())
    }

    fn transmit_control(&self, transmitter: &mut dyn Transmitter, cmd: u8, wnd: u16, ts: u32, sn: u32, una: u32) -> std::io::Result<()> {
        let header_len = self.format.header_len();
        let mut buffer = transmitter.allocate(header_len);
        self.format.prepare_header(&mut buffer, self.key.conversation as u32, 0);
        self.format.compose(&mut buffer, &Control { cmd, frg: 0, wnd, ts, sn, una });
        transmitter.transmit(&self.key.peer, &buffer)
    }

    /// Immediate `WINS` reply to a peer's zero-window probe, sent as
    /// soon as it's dispatched rather than waiting for the next flush.
    pub(crate) fn respond_window_ask(&mut self, now_ms: u32, wnd: u16, transmitter: &mut dyn Transmitter) -> std::io::Result<()> {
        self.transmit_control(transmitter, CMD_WINS, wnd, now_ms, 0, self.congestion.rcv_nxt)
    }

    /// Request teardown from within this conversation's own event
    /// callback. Actual removal is deferred by the guard bit `Service`
    /// sets around the callback until it returns.
    pub fn request_close(&mut self, silent: bool) {
        if silent {
            self.state |= SILENT;
        }
        self.state |= DEAD;
    }

    /// `FlushKCPConversation` equivalent: timeout check, pending ACK,
    /// zero-window probe, then send as much of the outbound queue as
    /// the congestion window currently allows.
    pub(crate) fn flush(&mut self, now_ms: u32, transmitter: &mut dyn Transmitter) -> Result<(), KcpError> {
        if self.state & DETACHED != 0 {
            return Err(KcpError::Detached);
        }
        if self.state & GUARD != 0 {
            return Err(KcpError::Busy);
        }
        if self.state & DEAD != 0 {
            return Err(KcpError::Reset);
        }

        if self.timeout_ms > 0 && (now_ms.wrapping_sub(self.last_active_ms) as i32) >= self.timeout_ms as i32 {
            self.mark_dead(Cause::Timeout);
            return Err(KcpError::Reset);
        }

        if (self.congestion.ack.cmd == CMD_PUSH || self.congestion.ack.cmd == CMD_ACK)
            && (now_ms.wrapping_sub(self.congestion.ack_due) as i32) >= 0
        {
            let size = self.congestion.window_size(self.inbound.len());
            let result = self.transmit_control(transmitter, CMD_ACK, size, self.congestion.ack.ts, self.congestion.ack.sn, self.congestion.rcv_nxt);
            if result.is_ok() {
                self.congestion.ack.cmd = 0;
            }
        }

        if self.outbound.is_empty() {
            return Ok(());
        }

        if self.congestion.zero_window_probe_due(now_ms) {
            let size = self.congestion.window_size(self.inbound.len());
            let _ = self.transmit_control(transmitter, CMD_WASK, size, now_ms, 0, self.congestion.rcv_nxt);
        }

        let mut quota = self.congestion.send_quota(self.outbound.len());
        let mut pos = self.outbound.head();

        while pos != self.outbound.tail() {
            let sn = self.outbound.get(pos).unwrap().control.sn;
            let tries = self.outbound.get(pos).unwrap().tries;
            if tries >= self.tries_limit {
                self.mark_dead(Cause::Reset);
                return Err(KcpError::Reset);
            }

            let sent = self.outbound.get(pos).unwrap().state & SENT != 0;
            if sent {
                let ts = self.outbound.get(pos).unwrap().control.ts;
                let track = self.outbound.get(pos).unwrap().track;
                let rto_due = (now_ms.wrapping_sub(ts) as i32) >= self.congestion.rto as i32;
                let fast_due = self.congestion.fastresend != 0 && track >= self.congestion.fastresend && tries > 0;
                if rto_due {
                    self.congestion.on_timeout();
                    let seg = self.outbound.get_mut(pos).unwrap();
                    seg.state &= !SENT;
                    seg.track = 0;
                    quota += 1;
                } else if fast_due {
                    self.congestion.on_fast_resend();
                    let seg = self.outbound.get_mut(pos).unwrap();
                    seg.state &= !SENT;
                    seg.track = 0;
                    quota += 1;
                }
            }

            let still_unsent = self.outbound.get(pos).unwrap().state & SENT == 0;
            if quota != 0 && still_unsent {
                let numbered = self.outbound.get(pos).unwrap().state & NUMBERED != 0;
                let sn_to_use = if numbered {
                    sn
                } else {
                    let next = self.congestion.next_sn;
                    self.congestion.next_sn = self.congestion.next_sn.wrapping_add(1);
                    next
                };

                let wnd = self.congestion.window_size(self.inbound.len());
                let una = self.congestion.rcv_nxt;
                let payload_len;
                let control;
                {
                    let seg = self.outbound.get_mut(pos).unwrap();
                    seg.control.ts = now_ms;
                    seg.control.wnd = wnd;
                    seg.control.una = una;
                    if !numbered {
                        seg.control.sn = sn_to_use;
                        seg.state |= NUMBERED;
                    }
                    payload_len = seg.data.len();
                    control = seg.control;
                }

                let header_len = self.format.header_len();
                let mut buffer = transmitter.allocate(header_len + payload_len);
                self.format.prepare_header(&mut buffer, self.key.conversation as u32, payload_len);
                self.format.compose(&mut buffer, &control);
                buffer[header_len..].copy_from_slice(&self.outbound.get(pos).unwrap().data);

                let result = transmitter.transmit(&self.key.peer, &buffer);
                let seg = self.outbound.get_mut(pos).unwrap();
                if result.is_ok() {
                    seg.state |= SENT;
                }
                seg.tries += 1;
                quota -= 1;
            } else if quota == 0 && still_unsent {
                // Remainder of the queue is, by invariant, strictly
                // not-yet-sent; scanning further is pointless.
                break;
            }

            pos = pos.wrapping_add(1);
        }

        Ok(())
    }
}
