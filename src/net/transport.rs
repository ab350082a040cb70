//! Duplex transport loops
//!
//! Two long-lived worker threads per session, started and stopped together:
//!
//! - The send loop ticks at the configured interval, drains every full
//!   frame the capture ring has accumulated past its cursor, encodes each
//!   and writes it to the connection. Draining everything per tick keeps
//!   the backlog bounded when the tick period is coarser than the capture
//!   rate.
//! - The receive loop polls the connection, reassembles/decodes incoming
//!   bytes and pushes the blocks into the bounded playback queue.
//!
//! Neither loop lets a fault escape: I/O errors clear the running flag and
//! surface as a session event; decode failures on single packets are
//! logged and dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::audio::capture::CaptureRing;
use crate::audio::queue::{BoundedAudioQueue, SampleBlock};
use crate::codec::{FramingMode, PacketFramer};
use crate::constants::RECV_BUFFER_SIZE;
use crate::error::NetworkError;
use crate::net::connection::Connection;
use crate::session::SessionEvent;

/// A running transport loop: its thread plus the channel it signals on exit
pub struct TransportHandle {
    pub handle: JoinHandle<()>,
    pub done: Receiver<()>,
}

/// Shared transport counters
#[derive(Default)]
pub struct TransportStats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_failures: AtomicU64,
}

/// Point-in-time copy of the transport counters
#[derive(Debug, Clone, Copy)]
pub struct TransportStatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub decode_failures: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Reassembles fixed-size raw frames out of an unaligned TCP byte stream
pub(crate) struct FrameAssembler {
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl FrameAssembler {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_bytes * 2),
            frame_bytes,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < self.frame_bytes {
            return None;
        }
        Some(self.pending.drain(..self.frame_bytes).collect())
    }
}

/// Spawn the send loop thread.
///
/// The capture cursor is created here and owned by the loop for its entire
/// life; it starts at the ring's current write position so only audio
/// captured after the session began is sent.
pub fn spawn_send_loop(
    conn: Arc<Connection>,
    ring: Arc<CaptureRing>,
    framer: Arc<PacketFramer>,
    stats: Arc<TransportStats>,
    running: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    channels: u16,
    samples_per_frame: usize,
    interval: Duration,
) -> std::io::Result<TransportHandle> {
    let (done_tx, done_rx) = bounded(1);

    // The cursor must be anchored before spawn returns: anything the
    // capture device writes while the thread is still starting belongs to
    // the session and may not be skipped.
    let capacity = ring.capacity();
    let mut cursor = ring.write_position();

    let handle = thread::Builder::new()
        .name("net-send".to_string())
        .spawn(move || {
            let mut frame = vec![0.0f32; samples_per_frame];

            'outer: while running.load(Ordering::Relaxed) {
                // Drain every full frame accumulated since the last tick
                loop {
                    let write = ring.write_position();
                    let available = (write + capacity - cursor) % capacity;
                    if available < samples_per_frame {
                        break;
                    }

                    ring.read_at(&mut frame, cursor);
                    cursor = (cursor + samples_per_frame) % capacity;

                    let block = SampleBlock::new(frame.clone(), channels);
                    match framer.encode(&block) {
                        Ok(bytes) => {
                            if let Err(e) = conn.write(&bytes) {
                                report_fault("send", &e, &running, &events);
                                break 'outer;
                            }
                            stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                            stats
                                .bytes_sent
                                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            // Local encode failure: skip this frame
                            tracing::warn!("Frame encode failed: {}", e);
                        }
                    }
                }

                sleep_while_running(&running, interval);
            }

            let _ = done_tx.send(());
            tracing::debug!("Send loop exited");
        })?;

    Ok(TransportHandle {
        handle,
        done: done_rx,
    })
}

/// Spawn the receive loop thread.
pub fn spawn_recv_loop(
    conn: Arc<Connection>,
    framer: Arc<PacketFramer>,
    queue: Arc<BoundedAudioQueue>,
    stats: Arc<TransportStats>,
    running: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    frame_bytes: usize,
) -> std::io::Result<TransportHandle> {
    let (done_tx, done_rx) = bounded(1);

    let handle = thread::Builder::new()
        .name("net-recv".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            let mut assembler = FrameAssembler::new(frame_bytes);

            while running.load(Ordering::Relaxed) {
                // Blocks for at most the poll interval
                match conn.read_available(&mut buf) {
                    Ok(0) => continue,
                    Ok(n) => {
                        stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
                        match framer.mode() {
                            FramingMode::Raw => {
                                assembler.push(&buf[..n]);
                                while let Some(raw) = assembler.next_frame() {
                                    deliver(&framer, &queue, &stats, &raw);
                                }
                            }
                            FramingMode::Framed => {
                                deliver_framed(&framer, &queue, &stats, &buf[..n])
                            }
                        }
                    }
                    Err(e) => {
                        if running.load(Ordering::Relaxed) {
                            report_fault("receive", &e, &running, &events);
                        }
                        break;
                    }
                }
            }

            let _ = done_tx.send(());
            tracing::debug!("Receive loop exited");
        })?;

    Ok(TransportHandle {
        handle,
        done: done_rx,
    })
}

/// Decode every framed packet a single read produced. Packets coalesce
/// under load; each one's end is found from its compressed stream. A bad
/// packet has no boundary to resync on, so it is dropped and logged along
/// with whatever follows it in the read.
fn deliver_framed(
    framer: &PacketFramer,
    queue: &BoundedAudioQueue,
    stats: &TransportStats,
    mut bytes: &[u8],
) {
    while !bytes.is_empty() {
        match framer.decode_first(bytes) {
            Ok((block, used)) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                if queue.push(block).is_some() {
                    tracing::debug!("Playback queue full, dropped oldest block");
                }
                bytes = &bytes[used..];
            }
            Err(e) => {
                stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping {} undecodable bytes: {}", bytes.len(), e);
                break;
            }
        }
    }
}

/// Decode one wire unit and hand it to the playback queue. A bad packet is
/// dropped and logged; it never ends the session.
fn deliver(
    framer: &PacketFramer,
    queue: &BoundedAudioQueue,
    stats: &TransportStats,
    bytes: &[u8],
) {
    match framer.decode(bytes) {
        Ok(block) => {
            stats.frames_received.fetch_add(1, Ordering::Relaxed);
            if queue.push(block).is_some() {
                tracing::debug!("Playback queue full, dropped oldest block");
            }
        }
        Err(e) => {
            stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Dropping undecodable packet: {}", e);
        }
    }
}

fn report_fault(
    loop_name: &str,
    error: &NetworkError,
    running: &AtomicBool,
    events: &Sender<SessionEvent>,
) {
    tracing::error!("Transport fault in {} loop: {}", loop_name, error);
    running.store(false, Ordering::SeqCst);
    let _ = events.send(SessionEvent::Fault(error.to_string()));
}

/// Sleep for `interval`, waking early if the running flag clears
fn sleep_while_running(running: &AtomicBool, interval: Duration) {
    const STEP: Duration = Duration::from_millis(50);
    let mut remaining = interval;
    while !remaining.is_zero() && running.load(Ordering::Relaxed) {
        let step = remaining.min(STEP);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::framer::samples_to_bytes;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Instant;

    fn loopback() -> (Arc<Connection>, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn =
            Connection::connect(&addr.to_string(), Duration::from_secs(1)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (Arc::new(conn), peer)
    }

    #[test]
    fn assembler_splits_unaligned_stream() {
        let mut assembler = FrameAssembler::new(8);
        assembler.push(&[1, 2, 3, 4, 5]);
        assert!(assembler.next_frame().is_none());

        assembler.push(&[6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(assembler.next_frame().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(assembler.next_frame().is_none());

        assembler.push(&[13, 14, 15, 16]);
        assert_eq!(
            assembler.next_frame().unwrap(),
            vec![9, 10, 11, 12, 13, 14, 15, 16]
        );
    }

    #[test]
    fn send_loop_drains_all_full_frames_per_tick() {
        let (conn, mut peer) = loopback();
        let ring = Arc::new(CaptureRing::new(1024));
        let framer = Arc::new(PacketFramer::new(FramingMode::Raw, 1));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, _events_rx) = bounded(16);

        let samples_per_frame = 64;
        let transport = spawn_send_loop(
            conn,
            ring.clone(),
            framer,
            stats.clone(),
            running.clone(),
            events_tx,
            1,
            samples_per_frame,
            Duration::from_millis(5),
        )
        .unwrap();

        // Three full frames plus a partial one; the partial must stay behind
        let fed: Vec<f32> = (0..samples_per_frame * 3 + 10).map(|i| i as f32).collect();
        ring.write(&fed);

        let expected_bytes = samples_per_frame * 4 * 3;
        let mut wire = vec![0u8; expected_bytes];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        peer.read_exact(&mut wire).unwrap();

        assert_eq!(wire, samples_to_bytes(&fed[..samples_per_frame * 3]));

        running.store(false, Ordering::SeqCst);
        assert!(transport.done.recv_timeout(Duration::from_secs(2)).is_ok());
        transport.handle.join().unwrap();
        assert_eq!(stats.snapshot().frames_sent, 3);
    }

    #[test]
    fn send_loop_does_not_skip_frames_written_during_spawn() {
        // The write races the thread start; the cursor is anchored before
        // spawn returns, so the frame must arrive regardless of who wins.
        let (conn, mut peer) = loopback();
        let ring = Arc::new(CaptureRing::new(1024));
        let framer = Arc::new(PacketFramer::new(FramingMode::Raw, 1));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, _events_rx) = bounded(16);

        let samples_per_frame = 64;
        let transport = spawn_send_loop(
            conn,
            ring.clone(),
            framer,
            stats,
            running.clone(),
            events_tx,
            1,
            samples_per_frame,
            Duration::from_millis(5),
        )
        .unwrap();

        let fed: Vec<f32> = (0..samples_per_frame).map(|i| i as f32).collect();
        ring.write(&fed);

        let mut wire = vec![0u8; samples_per_frame * 4];
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        peer.read_exact(&mut wire).unwrap();
        assert_eq!(wire, samples_to_bytes(&fed));

        running.store(false, Ordering::SeqCst);
        transport.handle.join().unwrap();
    }

    #[test]
    fn send_loop_cadence_one_frame_per_interval() {
        // Capture feeding exactly one frame per tick produces exactly one
        // encoded frame per tick, each decodable to the fed samples
        let (conn, mut peer) = loopback();
        let ring = Arc::new(CaptureRing::new(4096));
        let framer = Arc::new(PacketFramer::new(FramingMode::Framed, 1));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, _events_rx) = bounded(16);

        let samples_per_frame = 512;
        let transport = spawn_send_loop(
            conn,
            ring.clone(),
            framer.clone(),
            stats.clone(),
            running.clone(),
            events_tx,
            1,
            samples_per_frame,
            Duration::from_millis(10),
        )
        .unwrap();

        peer.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut chunk = vec![0u8; 16 * 1024];

        // Lock-step: feed one frame per tick, then collect the one packet
        // it produced before feeding the next. Keeps packets from
        // coalescing on the loopback stream.
        for tick in 0..4u32 {
            let frame: Vec<f32> = (0..samples_per_frame)
                .map(|i| (tick * 1000 + i as u32) as f32)
                .collect();
            ring.write(&frame);

            let deadline = Instant::now() + Duration::from_secs(2);
            let mut got = 0;
            while got == 0 && Instant::now() < deadline {
                got = peer.read(&mut chunk).unwrap_or(0);
            }
            assert!(got > 0, "no packet for tick {}", tick);

            let decoded = framer.decode(&chunk[..got]).unwrap();
            assert_eq!(decoded.samples.len(), samples_per_frame);
            assert_eq!(decoded.samples[0], (tick * 1000) as f32);
        }

        running.store(false, Ordering::SeqCst);
        transport.handle.join().unwrap();
        assert_eq!(stats.snapshot().frames_sent, 4);
    }

    #[test]
    fn recv_loop_feeds_queue_in_order() {
        let (conn, mut peer) = loopback();
        let framer = Arc::new(PacketFramer::new(FramingMode::Raw, 1));
        let queue = Arc::new(BoundedAudioQueue::new(16));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, _events_rx) = bounded(16);

        let frame_bytes = 16 * 4;
        let transport = spawn_recv_loop(
            conn,
            framer,
            queue.clone(),
            stats.clone(),
            running.clone(),
            events_tx,
            frame_bytes,
        )
        .unwrap();

        let first = samples_to_bytes(&vec![1.0f32; 16]);
        let second = samples_to_bytes(&vec![2.0f32; 16]);
        peer.write_all(&first).unwrap();
        peer.write_all(&second).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().samples[0], 1.0);
        assert_eq!(queue.try_pop().unwrap().samples[0], 2.0);

        running.store(false, Ordering::SeqCst);
        transport.handle.join().unwrap();
    }

    #[test]
    fn recv_loop_delivers_coalesced_framed_packets() {
        let (conn, mut peer) = loopback();
        let framer = Arc::new(PacketFramer::new(FramingMode::Framed, 1));
        let queue = Arc::new(BoundedAudioQueue::new(16));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, _events_rx) = bounded(16);

        let transport = spawn_recv_loop(
            conn,
            framer.clone(),
            queue.clone(),
            stats.clone(),
            running.clone(),
            events_tx,
            64,
        )
        .unwrap();

        // Both packets land in a single write, and so in a single read
        let mut wire = framer
            .encode(&SampleBlock::new(vec![0.25f32; 32], 1))
            .unwrap()
            .to_vec();
        wire.extend_from_slice(&framer.encode(&SampleBlock::new(vec![0.75f32; 32], 1)).unwrap());
        peer.write_all(&wire).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop().unwrap().samples[0], 0.25);
        assert_eq!(queue.try_pop().unwrap().samples[0], 0.75);
        assert_eq!(stats.snapshot().frames_received, 2);
        assert_eq!(stats.snapshot().decode_failures, 0);

        running.store(false, Ordering::SeqCst);
        transport.handle.join().unwrap();
    }

    #[test]
    fn recv_loop_survives_bad_packet() {
        let (conn, mut peer) = loopback();
        let framer = Arc::new(PacketFramer::new(FramingMode::Framed, 1));
        let queue = Arc::new(BoundedAudioQueue::new(16));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = bounded(16);

        let transport = spawn_recv_loop(
            conn,
            framer.clone(),
            queue.clone(),
            stats.clone(),
            running.clone(),
            events_tx,
            64,
        )
        .unwrap();

        // Garbage first, then a valid packet
        peer.write_all(&[0xAA; 32]).unwrap();
        thread::sleep(Duration::from_millis(50));
        let good = framer
            .encode(&SampleBlock::new(vec![0.5f32; 16], 1))
            .unwrap();
        peer.write_all(&good).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        // The bad packet was dropped, not fatal
        assert!(events_rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(stats.snapshot().decode_failures, 1);

        running.store(false, Ordering::SeqCst);
        transport.handle.join().unwrap();
    }

    #[test]
    fn recv_loop_reports_peer_disconnect() {
        let (conn, peer) = loopback();
        let framer = Arc::new(PacketFramer::new(FramingMode::Raw, 1));
        let queue = Arc::new(BoundedAudioQueue::new(16));
        let stats = Arc::new(TransportStats::default());
        let running = Arc::new(AtomicBool::new(true));
        let (events_tx, events_rx) = bounded(16);

        let transport = spawn_recv_loop(
            conn,
            framer,
            queue,
            stats,
            running.clone(),
            events_tx,
            64,
        )
        .unwrap();

        drop(peer);

        let event = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, SessionEvent::Fault(_)));
        assert!(!running.load(Ordering::SeqCst));
        transport.handle.join().unwrap();
    }
}
