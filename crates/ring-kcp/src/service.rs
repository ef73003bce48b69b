//! The conversation table and ingress/egress entry points. Mirrors
//! `KCPService`/`HandleKCPPacket`/`FlushKCPConversation`'s driving loop
//! from the original, minus the manual refcount: a `Conversation`'s
//! lifetime is just its presence in `conversations`, guarded against
//! reentrant teardown by the `GUARD` state bit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::conversation::{Conversation, Dispatch, Event, Key, PeerAddr, GUARD, SILENT};
use crate::wire::Format;

#[derive(Debug)]
pub enum KcpError {
    /// A segment's `cmd` byte matched none of PUSH/ACK/WASK/WINS.
    UnknownCommand(u8),
    /// The conversation has been `DETACHED` and now rejects new work.
    Detached,
    /// The conversation has been reset (timed out or exhausted retries).
    Reset,
    /// The conversation is guarded by an in-progress handler callback.
    Busy,
    /// No conversation exists for the given key.
    NotFound,
}

impl fmt::Display for KcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCommand(cmd) => write!(f, "unknown KCP command byte 0x{cmd:02x}"),
            Self::Detached => write!(f, "conversation is detached"),
            Self::Reset => write!(f, "conversation has been reset"),
            Self::Busy => write!(f, "conversation is guarded by an in-progress handler call"),
            Self::NotFound => write!(f, "no conversation for this key"),
        }
    }
}

impl std::error::Error for KcpError {}

/// Hands composed wire buffers to the network. `allocate` returns a
/// zero-filled buffer of exactly `size` bytes for the `Format` to write
/// into; `transmit` hands the finished packet to `peer`.
pub trait Transmitter {
    fn allocate(&mut self, size: usize) -> Vec<u8>;
    fn transmit(&mut self, peer: &PeerAddr, packet: &[u8]) -> std::io::Result<()>;
}

/// The user-facing event sink: `Create`/`Remove` lifecycle notices and
/// `Receive` for each fully reassembled message.
pub type Handler = dyn FnMut(&mut Conversation, Event<'_>) + Send;

/// Owns every live conversation for one wire format / transmitter pair
/// and drives ingress dispatch and the periodic egress flush.
pub struct Service<T: Transmitter> {
    transmitter: T,
    format: Arc<dyn Format>,
    handler: Box<Handler>,
    conversations: HashMap<Key, Conversation>,
}

impl<T: Transmitter> Service<T> {
    pub fn new(format: Arc<dyn Format>, transmitter: T, handler: Box<Handler>) -> Self {
        Self { transmitter, format, handler, conversations: HashMap::new() }
    }

    /// The underlying transport, for embedding glue that needs to pump
    /// its own inbound side (e.g. [`crate::udp::UdpTransmitter::poll_inbound`])
    /// alongside this table.
    pub fn transmitter(&self) -> &T {
        &self.transmitter
    }

    pub fn get(&self, key: &Key) -> Option<&Conversation> {
        self.conversations.get(key)
    }

    pub fn get_mut(&mut self, key: &Key) -> Option<&mut Conversation> {
        self.conversations.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Explicitly open a conversation (for the side that initiates
    /// rather than receives first), firing `Create`. A no-op if one
    /// already exists for `key`.
    pub fn open(&mut self, key: Key, now_ms: u32) {
        if self.conversations.contains_key(&key) {
            return;
        }
        self.conversations.insert(key, Conversation::new(key, Arc::clone(&self.format), now_ms));
        self.invoke(key, Event::Create);
    }

    /// Queue `data` for delivery on an existing conversation.
    pub fn send(&mut self, key: Key, data: &[u8]) -> Result<(), KcpError> {
        self.conversations.get_mut(&key).ok_or(KcpError::NotFound)?.submit(data)
    }

    /// Forcibly tear down a conversation from outside any callback.
    /// `silent` suppresses the `Remove` event.
    pub fn close_conversation(&mut self, key: Key, silent: bool) {
        let Some(conv) = self.conversations.get_mut(&key) else { return };
        conv.request_close(silent);
        if conv.state & GUARD == 0 {
            self.finish_removal(key);
        }
    }

    /// Parse and dispatch every segment in one physical packet arriving
    /// from `peer` on behalf of `application` (the caller's namespace
    /// for multiplexing several local consumers over one adapter).
    pub fn handle_packet(&mut self, now_ms: u32, application: u64, peer: PeerAddr, packet: &[u8]) {
        let mut remaining = packet;
        while !remaining.is_empty() {
            if !self.format.verify(remaining) {
                return;
            }
            let Some((parsed, consumed)) = self.format.parse(remaining) else { return };
            remaining = &remaining[consumed..];

            let key = Key { application, conversation: parsed.conv as u64, peer };
            if !self.conversations.contains_key(&key) {
                self.open(key, now_ms);
            }

            let Some(conv) = self.conversations.get_mut(&key) else { continue };
            if conv.is_dead() {
                continue;
            }
            conv.touch(now_ms);
            conv.apply_remote_window(parsed.control.wnd);

            match conv.dispatch(now_ms, parsed.control, parsed.payload) {
                Ok(Dispatch::None) => {}
                Ok(Dispatch::Messages(messages)) => {
                    for message in messages {
                        self.invoke(key, Event::Receive(&message));
                    }
                }
                Ok(Dispatch::WindowAsk(wnd)) => {
                    if let Some(conv) = self.conversations.get_mut(&key) {
                        let _ = conv.respond_window_ask(now_ms, wnd, &mut self.transmitter);
                    }
                }
                // Malformed or unsupported command: drop this segment,
                // the rest of the packet (and conversation) are fine.
                Err(_unknown_cmd) => {}
            }
        }
    }

    /// Drive every conversation's flush (timeout check, pending ACK,
    /// probe, retransmit/send). With `cleanup`, conversations that went
    /// `Dead` this round (or a previous one) are torn down afterwards.
    pub fn flush(&mut self, now_ms: u32, cleanup: bool) {
        let keys: Vec<Key> = self.conversations.keys().copied().collect();
        for key in keys {
            let Some(conv) = self.conversations.get_mut(&key) else { continue };
            if !conv.is_dead() {
                let _ = conv.flush(now_ms, &mut self.transmitter);
            }
            let dead = conv.is_dead();
            if dead && cleanup {
                self.finish_removal(key);
            }
        }
    }

    /// Run `event` through the handler with the guard bit set, then
    /// perform the teardown the callback requested (if any) now that
    /// it's safe to drop the conversation out from under itself.
    fn invoke(&mut self, key: Key, event: Event<'_>) {
        let Some(conv) = self.conversations.get_mut(&key) else { return };
        conv.state |= GUARD;
        (self.handler)(conv, event);
        conv.state &= !GUARD;
        let dead = conv.is_dead();
        if dead {
            self.finish_removal(key);
        }
    }

    fn finish_removal(&mut self, key: Key) {
        let Some(mut conv) = self.conversations.remove(&key) else { return };
        if conv.state & SILENT == 0 {
            (self.handler)(&mut conv, Event::Remove);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Control, StandardFormat, CMD_ACK, CMD_PUSH};
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[derive(Default)]
    struct RecordingTransmitter {
        sent: Vec<(PeerAddr, Vec<u8>)>,
    }

    impl Transmitter for RecordingTransmitter {
        fn allocate(&mut self, size: usize) -> Vec<u8> {
            vec![0u8; size]
        }
        fn transmit(&mut self, peer: &PeerAddr, packet: &[u8]) -> std::io::Result<()> {
            self.sent.push((*peer, packet.to_vec()));
            Ok(())
        }
    }

    fn peer() -> PeerAddr {
        PeerAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000))
    }

    fn build_push(conv: u32, sn: u32, payload: &[u8]) -> Vec<u8> {
        let format = StandardFormat;
        let mut buf = vec![0u8; format.header_len() + payload.len()];
        format.prepare_header(&mut buf, conv, payload.len());
        format.compose(&mut buf, &Control { cmd: CMD_PUSH, frg: 0, wnd: 128, ts: 0, sn, una: 0 });
        buf[format.header_len()..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn inbound_push_fires_create_then_receive() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let mut service = Service::new(
            Arc::new(StandardFormat),
            RecordingTransmitter::default(),
            Box::new(move |_conv, event| {
                log.lock().unwrap().push(format!("{event:?}"));
            }),
        );

        let packet = build_push(42, 0, b"hello world");
        service.handle_packet(0, 1, peer(), &packet);

        let log = events.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], "Create");
        assert!(log[1].contains("hello world"));
        assert_eq!(service.len(), 1);
    }

    #[test]
    fn unknown_command_is_dropped_without_poisoning_the_conversation() {
        let mut service = Service::new(Arc::new(StandardFormat), RecordingTransmitter::default(), Box::new(|_, _| {}));
        let mut packet = build_push(7, 0, b"x");
        packet[4] = 0xff;
        service.handle_packet(0, 1, peer(), &packet);
        assert!(service.is_empty());
    }

    #[test]
    fn ack_retires_the_outbound_segment() {
        let mut service = Service::new(Arc::new(StandardFormat), RecordingTransmitter::default(), Box::new(|_, _| {}));
        let key = Key { application: 1, conversation: 42, peer: peer() };
        service.open(key, 0);
        service.send(key, b"payload").unwrap();
        service.flush(0, false);
        assert_eq!(service.get(&key).unwrap().outbound_len(), 1);
        assert_eq!(service.transmitter.sent.len(), 1);

        let format = StandardFormat;
        let mut ack = vec![0u8; format.header_len()];
        format.prepare_header(&mut ack, 42, 0);
        format.compose(&mut ack, &Control { cmd: CMD_ACK, frg: 0, wnd: 128, ts: 0, sn: 0, una: 1 });
        service.handle_packet(10, 1, peer(), &ack);

        assert_eq!(service.get(&key).unwrap().outbound_len(), 0);
    }

    #[test]
    fn close_conversation_fires_remove_unless_silent() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&events);
        let mut service = Service::new(
            Arc::new(StandardFormat),
            RecordingTransmitter::default(),
            Box::new(move |_conv, event| log.lock().unwrap().push(format!("{event:?}"))),
        );
        let key = Key { application: 1, conversation: 1, peer: peer() };
        service.open(key, 0);
        service.close_conversation(key, false);

        assert!(service.is_empty());
        assert_eq!(&events.lock().unwrap()[..], &["Create".to_string(), "Remove".to_string()]);
    }
}
