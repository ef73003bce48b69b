//! KCP-over-UDP echo server, driven entirely by the ring substrate.
//!
//! A single UDP socket serves every peer: inbound datagrams are pulled
//! off the ring's buffer-select recv, handed to the KCP conversation
//! table, and whatever comes out the `Receive` side of the handler is
//! queued straight back onto its own conversation.
//!
//! Usage:
//!     cargo run -p udp-kcp-echo -- [port]

use std::net::UdpSocket;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use ring_buffer::provider::BufferRingProvider;
use ring_buffer::BufferPool;
use ring_io::{Ring, RingConfig};
use ring_kcp::udp::UdpTransmitter;
use ring_kcp::{Event, Service, StandardFormat};

const APPLICATION_ID: u64 = 1;
const BUFFER_GROUP: u16 = 1;
const BUFFER_COUNT: u16 = 64;
const BUFFER_LEN: usize = 2048;
const OUTBOUND_INFLIGHT_LIMIT: usize = 64;
const TICK_MS: u64 = 20;

fn main() {
    let port: u16 = std::env::args().nth(1).and_then(|s| s.parse().ok()).unwrap_or(9000);

    let std_socket = UdpSocket::bind(("0.0.0.0", port)).expect("bind UDP socket");
    std_socket.set_nonblocking(true).expect("set nonblocking");
    let fd = std::os::unix::io::AsRawFd::as_raw_fd(&std_socket);
    // The ring takes over this fd's I/O from here; keep the OS-level
    // binding alive for the process's lifetime without a second owner
    // closing it on drop.
    std::mem::forget(std_socket);

    let ring = Arc::new(Ring::create(RingConfig::default()).expect("create ring"));

    let provider = BufferRingProvider::create(ring.io_uring(), BUFFER_GROUP, BUFFER_COUNT, BUFFER_LEN, |len| vec![0u8; len].into_boxed_slice())
        .expect("register buffer ring");
    let provider: Arc<Mutex<dyn ring_buffer::provider::ProvidedBuffers>> = Arc::new(Mutex::new(provider));

    let inbound_pool = Arc::new(BufferPool::new(BUFFER_LEN));
    let outbound_pool = Arc::new(BufferPool::new(BUFFER_LEN));

    let transmitter =
        UdpTransmitter::bind(Arc::clone(&ring), fd, BUFFER_GROUP, provider, inbound_pool, outbound_pool, OUTBOUND_INFLIGHT_LIMIT).expect("bind KCP transport");

    let mut service = Service::new(
        Arc::new(StandardFormat),
        transmitter,
        Box::new(|conversation, event| {
            if let Event::Receive(payload) = event {
                eprintln!("udp-kcp-echo: echoing {} bytes", payload.len());
                let _ = conversation.submit(payload);
            }
        }),
    );

    eprintln!("udp-kcp-echo: listening on UDP :{port}");

    let start = Instant::now();
    loop {
        let now_ms = start.elapsed().as_millis() as u32;

        for (peer, payload) in service.transmitter().drain_inbound() {
            service.handle_packet(now_ms, APPLICATION_ID, peer, &payload);
        }

        ring.wait(TICK_MS).expect("ring wait");

        service.flush(now_ms, false);
    }
}
