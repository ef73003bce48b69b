//! Wire format: a pluggable `Format` trait plus the standard envelope
//! (4-byte conversation id, 16-byte control block, 4-byte LE length,
//! payload), mirroring the original's `KCPFormat` vtable.

pub const CMD_PUSH: u8 = 0x51;
pub const CMD_ACK: u8 = 0x52;
pub const CMD_WASK: u8 = 0x53;
pub const CMD_WINS: u8 = 0x54;

/// Per-segment control header: `{cmd, frg, wnd, ts, sn, una}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Control {
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
}

/// One segment parsed off the wire: its control header and owned
/// payload bytes, plus how many bytes of the input it consumed.
pub struct ParsedSegment {
    pub conv: u32,
    pub control: Control,
    pub payload: Vec<u8>,
}

/// Describes one on-the-wire envelope. `verify`/`parse` read,
/// `prepare_header`/`compose` write; a Transmitter hands the composed
/// buffer to the network.
pub trait Format: Send + Sync {
    /// Cheap structural check before `parse` does any allocation.
    fn verify(&self, packet: &[u8]) -> bool;

    /// Parse one segment from the front of `packet`. Returns the
    /// segment and the number of bytes consumed, or `None` if
    /// malformed.
    fn parse(&self, packet: &[u8]) -> Option<(ParsedSegment, usize)>;

    /// Fixed header size for this format (payload length is carried in
    /// the header, not folded into this value).
    fn header_len(&self) -> usize;

    /// Write the conversation id and payload length into a freshly
    /// allocated wire buffer; `buffer.len()` is `header_len() + payload_len`.
    fn prepare_header(&self, buffer: &mut [u8], conv: u32, payload_len: usize);

    /// Write the control fields into a buffer previously initialised by
    /// `prepare_header`, called again on every (re)transmission since
    /// `ts`/`sn`/`wnd`/`una` are only known at send time.
    fn compose(&self, buffer: &mut [u8], control: &Control);
}

const HEADER_LEN: usize = 4 + 16 + 4;

/// `StandardKCPFormat` equivalent: conv in native byte order, control
/// fields little-endian, length little-endian.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardFormat;

impl Format for StandardFormat {
    fn verify(&self, packet: &[u8]) -> bool {
        if packet.len() < HEADER_LEN {
            return false;
        }
        let cmd = packet[4];
        let len = u32::from_le_bytes(packet[20..24].try_into().unwrap()) as usize;
        match cmd {
            CMD_PUSH => packet.len() - HEADER_LEN >= len,
            CMD_ACK | CMD_WASK | CMD_WINS => len == 0,
            _ => false,
        }
    }

    fn parse(&self, packet: &[u8]) -> Option<(ParsedSegment, usize)> {
        if !self.verify(packet) {
            return None;
        }
        let conv = u32::from_ne_bytes(packet[0..4].try_into().unwrap());
        let control = Control {
            cmd: packet[4],
            frg: packet[5],
            wnd: u16::from_le_bytes(packet[6..8].try_into().unwrap()),
            ts: u32::from_le_bytes(packet[8..12].try_into().unwrap()),
            sn: u32::from_le_bytes(packet[12..16].try_into().unwrap()),
            una: u32::from_le_bytes(packet[16..20].try_into().unwrap()),
        };
        let len = u32::from_le_bytes(packet[20..24].try_into().unwrap()) as usize;
        let payload = packet[HEADER_LEN..HEADER_LEN + len].to_vec();
        Some((ParsedSegment { conv, control, payload }, HEADER_LEN + len))
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn prepare_header(&self, buffer: &mut [u8], conv: u32, payload_len: usize) {
        buffer[0..4].copy_from_slice(&conv.to_ne_bytes());
        buffer[20..24].copy_from_slice(&(payload_len as u32).to_le_bytes());
    }

    fn compose(&self, buffer: &mut [u8], control: &Control) {
        buffer[4] = control.cmd;
        buffer[5] = control.frg;
        buffer[6..8].copy_from_slice(&control.wnd.to_le_bytes());
        buffer[8..12].copy_from_slice(&control.ts.to_le_bytes());
        buffer[12..16].copy_from_slice(&control.sn.to_le_bytes());
        buffer[16..20].copy_from_slice(&control.una.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(cmd: u8, frg: u8, wnd: u16, ts: u32, sn: u32, una: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + payload.len()];
        StandardFormat.prepare_header(&mut buf, 0xdead_beef, payload.len());
        StandardFormat.compose(&mut buf, &Control { cmd, frg, wnd, ts, sn, una });
        buf[HEADER_LEN..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn round_trips_a_push_segment_with_payload() {
        let packet = build(CMD_PUSH, 0, 128, 42, 7, 3, b"hello");
        assert!(StandardFormat.verify(&packet));
        let (seg, consumed) = StandardFormat.parse(&packet).unwrap();
        assert_eq!(consumed, packet.len());
        assert_eq!(seg.conv, 0xdead_beef);
        assert_eq!(seg.control, Control { cmd: CMD_PUSH, frg: 0, wnd: 128, ts: 42, sn: 7, una: 3 });
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn round_trips_a_zero_length_ack() {
        let packet = build(CMD_ACK, 0, 64, 1, 2, 2, &[]);
        let (seg, consumed) = StandardFormat.parse(&packet).unwrap();
        assert_eq!(consumed, HEADER_LEN);
        assert!(seg.payload.is_empty());
    }

    #[test]
    fn rejects_truncated_and_unknown_packets() {
        assert!(!StandardFormat.verify(&[0u8; HEADER_LEN - 1]));
        let mut bad_cmd = build(CMD_PUSH, 0, 0, 0, 0, 0, b"x");
        bad_cmd[4] = 0x99;
        assert!(!StandardFormat.verify(&bad_cmd));
    }
}
