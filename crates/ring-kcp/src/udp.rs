//! UDP transport adapter: binds a `ring_socket::Socket` as the
//! `Transmitter` for a [`crate::Service`] and pulls peer addresses out
//! of its `RecvMsgMulti` buffers. Mirrors `KCPAdapter`'s role of
//! wiring a `FastSocket` into the conversation engine.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use ring_buffer::provider::ProvidedBuffers;
use ring_buffer::BufferPool;
use ring_core::error::{Result, RingError};
use ring_io::Ring;
use ring_socket::{Socket, SocketEvent, SocketMode};

use crate::conversation::PeerAddr;
use crate::service::{Service, Transmitter};

const RECVMSG_OUT_HEADER_LEN: usize = 16;
const SOCKADDR_STORAGE_LEN: u32 = std::mem::size_of::<libc::sockaddr_storage>() as u32;

/// Binds one unconnected UDP socket's multishot recv/send to a KCP
/// [`Service`]'s [`Transmitter`] seam, serving many peers over a
/// single file descriptor.
pub struct UdpTransmitter {
    ring: Arc<Ring>,
    socket: Arc<Socket>,
}

impl UdpTransmitter {
    /// `fd` must already be `bind`-ed (and for IPv4/IPv6 dual behavior,
    /// configured by the caller); this only arms the io_uring side.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        ring: Arc<Ring>,
        fd: RawFd,
        buf_group: u16,
        provider: Arc<Mutex<dyn ProvidedBuffers>>,
        inbound_pool: Arc<BufferPool>,
        outbound_pool: Arc<BufferPool>,
        outbound_limit: usize,
    ) -> Result<Self> {
        let mode = SocketMode { zerocopy: false, auto_cork: false, recvmsg: true };
        let socket = Socket::create_with_recvmsg_capacity(
            &ring,
            fd,
            mode,
            buf_group,
            provider,
            inbound_pool,
            outbound_pool,
            outbound_limit,
            SOCKADDR_STORAGE_LEN,
            0,
            Box::new(|_socket, _event: SocketEvent| {}),
        )?;
        socket.arm_recv(&ring)?;
        Ok(Self { ring, socket })
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Drain every datagram buffered since the last call, parse its
    /// peer address out of the `RecvMsgMulti` header, and dispatch the
    /// payload into `service` on behalf of `application`.
    pub fn poll_inbound<T: Transmitter>(&self, service: &mut Service<T>, application: u64, now_ms: u32) {
        while let Some(buf) = self.socket.pop_inbound() {
            let datagram = unsafe { (*buf).as_slice() };
            if let Some((peer, payload)) = parse_recvmsg_datagram(datagram) {
                service.handle_packet(now_ms, application, peer, payload);
            }
            self.socket.release_inbound(buf);
        }
    }

    /// As [`Self::poll_inbound`], but returns the parsed datagrams
    /// instead of dispatching them directly, for callers that hold
    /// `self` through a borrow of the `Service` it's installed in
    /// (where `poll_inbound`'s simultaneous `&self`/`&mut Service`
    /// borrow wouldn't type-check).
    pub fn drain_inbound(&self) -> Vec<(PeerAddr, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some(buf) = self.socket.pop_inbound() {
            let datagram = unsafe { (*buf).as_slice() };
            if let Some((peer, payload)) = parse_recvmsg_datagram(datagram) {
                out.push((peer, payload.to_vec()));
            }
            self.socket.release_inbound(buf);
        }
        out
    }
}

impl Transmitter for UdpTransmitter {
    fn allocate(&mut self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    fn transmit(&mut self, peer: &PeerAddr, packet: &[u8]) -> std::io::Result<()> {
        let addr: SocketAddr = match *peer {
            PeerAddr::V4(v4) => SocketAddr::V4(v4),
            PeerAddr::V6(v6) => SocketAddr::V6(v6),
        };
        self.socket.transmit_to(&self.ring, addr, packet).map_err(ring_error_to_io)
    }
}

fn ring_error_to_io(err: RingError) -> std::io::Error {
    match err {
        RingError::Os(errno) | RingError::SubmitFailed(errno) | RingError::RegistrationFailed(errno) => std::io::Error::from_raw_os_error(errno),
        _ => std::io::Error::from_raw_os_error(libc::EIO),
    }
}

/// One `RecvMsgMulti` buffer: a 16-byte `io_uring_recvmsg_out` header
/// (namelen, controllen, payloadlen, flags), the peer's `sockaddr`
/// padded to `sockaddr_storage`, no control data (we never request
/// any), then the payload.
fn parse_recvmsg_datagram(buf: &[u8]) -> Option<(PeerAddr, &[u8])> {
    if buf.len() < RECVMSG_OUT_HEADER_LEN {
        return None;
    }
    let namelen = u32::from_ne_bytes(buf[0..4].try_into().ok()?) as usize;
    let payloadlen = u32::from_ne_bytes(buf[8..12].try_into().ok()?) as usize;

    let name_pos = RECVMSG_OUT_HEADER_LEN;
    let payload_pos = name_pos + SOCKADDR_STORAGE_LEN as usize;
    if buf.len() < payload_pos + payloadlen || namelen < std::mem::size_of::<libc::sockaddr_in>() {
        return None;
    }

    let family = u16::from_ne_bytes(buf[name_pos..name_pos + 2].try_into().ok()?) as i32;
    let peer = match family {
        libc::AF_INET => {
            let sin: libc::sockaddr_in = unsafe { std::ptr::read(buf[name_pos..].as_ptr() as *const _) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            PeerAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6: libc::sockaddr_in6 = unsafe { std::ptr::read(buf[name_pos..].as_ptr() as *const _) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            PeerAddr::V6(SocketAddrV6::new(ip, u16::from_be(sin6.sin6_port), sin6.sin6_flowinfo, sin6.sin6_scope_id))
        }
        _ => return None,
    };

    Some((peer, &buf[payload_pos..payload_pos + payloadlen]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_recvmsg_buffer(family: i32, port: u16, ip: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let name_pos = RECVMSG_OUT_HEADER_LEN;
        let payload_pos = name_pos + SOCKADDR_STORAGE_LEN as usize;
        let mut buf = vec![0u8; payload_pos + payload.len()];

        let namelen = std::mem::size_of::<libc::sockaddr_in>() as u32;
        buf[0..4].copy_from_slice(&namelen.to_ne_bytes());
        buf[4..8].copy_from_slice(&0u32.to_ne_bytes());
        buf[8..12].copy_from_slice(&(payload.len() as u32).to_ne_bytes());

        let sin = libc::sockaddr_in {
            sin_family: family as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: u32::from_be_bytes(ip) },
            sin_zero: [0; 8],
        };
        unsafe { std::ptr::write(buf[name_pos..].as_mut_ptr() as *mut libc::sockaddr_in, sin) };

        buf[payload_pos..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn parses_peer_address_and_payload_out_of_a_v4_datagram() {
        let buf = build_recvmsg_buffer(libc::AF_INET, 9001, [127, 0, 0, 1], b"kcp segment");
        let (peer, payload) = parse_recvmsg_datagram(&buf).unwrap();
        assert_eq!(peer, PeerAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9001)));
        assert_eq!(payload, b"kcp segment");
    }

    #[test]
    fn rejects_a_truncated_header() {
        assert!(parse_recvmsg_datagram(&[0u8; 4]).is_none());
    }
}
