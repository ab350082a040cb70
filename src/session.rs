//! Streaming session lifecycle
//!
//! Owns every piece of per-session state: the capture source, the playback
//! sink with its crossfader, the bounded queue, the connection and both
//! transport loops. Enforces the state machine
//! `Idle → Connecting → Streaming → Stopping → Idle` and the
//! exactly-once teardown contract: stop may be triggered by an explicit
//! request, a transport fault or drop, and whichever arrives first runs the
//! full teardown; the rest are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::capture::{CaptureSource, OnError};
use crate::audio::crossfade::PlaybackCrossfader;
use crate::audio::playback::PlaybackSink;
use crate::audio::queue::BoundedAudioQueue;
use crate::codec::PacketFramer;
use crate::config::StreamConfig;
use crate::constants::TEARDOWN_GRACE_SECS;
use crate::error::{Result, SessionError};
use crate::net::connection::Connection;
use crate::net::transport::{
    spawn_recv_loop, spawn_send_loop, TransportHandle, TransportStats, TransportStatsSnapshot,
};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Stopping,
}

/// Notifications delivered to whoever owns presentation
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Fault(String),
    Stopped,
}

pub struct StreamingSession {
    config: StreamConfig,
    capture: Box<dyn CaptureSource>,
    playback: Box<dyn PlaybackSink>,
    queue: Arc<BoundedAudioQueue>,
    stats: Arc<TransportStats>,
    state: Arc<Mutex<SessionState>>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    conn: Option<Arc<Connection>>,
    send_loop: Option<TransportHandle>,
    recv_loop: Option<TransportHandle>,
    events_tx: Sender<SessionEvent>,
}

impl StreamingSession {
    /// Build a session around validated configuration and the two device
    /// adapters. Returns the session and the event channel for it.
    pub fn new(
        config: StreamConfig,
        capture: Box<dyn CaptureSource>,
        playback: Box<dyn PlaybackSink>,
    ) -> Result<(Self, Receiver<SessionEvent>)> {
        config.validate()?;
        let (events_tx, events_rx) = unbounded();

        let session = Self {
            queue: Arc::new(BoundedAudioQueue::new(config.queue_capacity)),
            stats: Arc::new(TransportStats::default()),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            conn: None,
            send_loop: None,
            recv_loop: None,
            events_tx,
            config,
            capture,
            playback,
        };
        Ok((session, events_rx))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue(&self) -> Arc<BoundedAudioQueue> {
        self.queue.clone()
    }

    /// Connect to a peer and start streaming.
    ///
    /// Fails back to `Idle` with a user-facing reason when no capture
    /// device is present or the connect times out or is refused.
    pub fn connect(&mut self, addr: &str) -> Result<()> {
        self.enter_connecting()?;

        let conn = match Connection::connect(addr, self.config.connect_timeout()) {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.lock() = SessionState::Idle;
                return Err(e.into());
            }
        };

        self.start_streaming(conn)
    }

    /// Start streaming over an already-established connection (the
    /// accepting peer).
    pub fn attach(&mut self, conn: Connection) -> Result<()> {
        self.enter_connecting()?;
        self.start_streaming(conn)
    }

    fn enter_connecting(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != SessionState::Idle {
            return Err(SessionError::NotIdle(*state).into());
        }
        *state = SessionState::Connecting;
        drop(state);

        if !self.capture.is_available() {
            *self.state.lock() = SessionState::Idle;
            return Err(SessionError::NoCaptureDevice.into());
        }
        Ok(())
    }

    /// Handler the device adapters invoke on asynchronous stream errors.
    /// Same shape as a transport fault: clear the running flag and surface
    /// the reason; teardown stays with whoever reacts to the event.
    fn device_fault_handler(&self) -> OnError {
        let running = self.running.clone();
        let events = self.events_tx.clone();
        Box::new(move |e| {
            tracing::error!("Audio device fault: {}", e);
            running.store(false, Ordering::SeqCst);
            let _ = events.send(SessionEvent::Fault(e.to_string()));
        })
    }

    fn start_streaming(&mut self, conn: Connection) -> Result<()> {
        // Running is raised before the devices start so a fault handler
        // firing mid-startup is not overwritten
        self.running.store(true, Ordering::SeqCst);
        self.stopped.store(false, Ordering::SeqCst);

        if let Err(e) = self.capture.start(self.device_fault_handler()) {
            self.running.store(false, Ordering::SeqCst);
            *self.state.lock() = SessionState::Idle;
            return Err(e.into());
        }

        let crossfader = Arc::new(PlaybackCrossfader::new(
            self.queue.clone(),
            self.config.fade_samples(),
        ));
        if let Err(e) = self.playback.start(
            Box::new(move |data| crossfader.render(data)),
            self.device_fault_handler(),
        ) {
            self.running.store(false, Ordering::SeqCst);
            self.capture.stop();
            *self.state.lock() = SessionState::Idle;
            return Err(e.into());
        }

        let conn = Arc::new(conn);
        let framer = Arc::new(PacketFramer::new(self.config.framing, self.config.channels));

        let spawn = || -> std::io::Result<(TransportHandle, TransportHandle)> {
            let send = spawn_send_loop(
                conn.clone(),
                self.capture.ring(),
                framer.clone(),
                self.stats.clone(),
                self.running.clone(),
                self.events_tx.clone(),
                self.config.channels,
                self.config.samples_per_frame,
                self.config.send_interval(),
            )?;
            let recv = spawn_recv_loop(
                conn.clone(),
                framer,
                self.queue.clone(),
                self.stats.clone(),
                self.running.clone(),
                self.events_tx.clone(),
                self.config.frame_bytes(),
            )?;
            Ok((send, recv))
        };

        match spawn() {
            Ok((send, recv)) => {
                self.send_loop = Some(send);
                self.recv_loop = Some(recv);
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.capture.stop();
                self.playback.stop();
                conn.close();
                *self.state.lock() = SessionState::Idle;
                return Err(crate::error::AudioError::StreamError(e.to_string()).into());
            }
        }

        tracing::info!("Streaming to {}", conn.peer());
        self.conn = Some(conn);
        *self.state.lock() = SessionState::Streaming;
        let _ = self.events_tx.send(SessionEvent::Connected);
        Ok(())
    }

    /// Tear the session down. Idempotent: exactly one invocation runs the
    /// teardown sequence, repeats and races are no-ops.
    pub fn stop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if *self.state.lock() == SessionState::Idle {
            return;
        }
        *self.state.lock() = SessionState::Stopping;
        tracing::info!("Stopping session");

        // 1. Cancellation signal for both loops
        self.running.store(false, Ordering::SeqCst);

        // 2. Device handles
        self.capture.stop();
        self.playback.stop();

        // 3. Transport loops, each with a bounded grace period
        let grace = Duration::from_secs(TEARDOWN_GRACE_SECS);
        for (name, transport) in [
            ("send", self.send_loop.take()),
            ("receive", self.recv_loop.take()),
        ] {
            if let Some(transport) = transport {
                match transport.done.recv_timeout(grace) {
                    Ok(()) => {
                        let _ = transport.handle.join();
                    }
                    Err(_) => {
                        tracing::warn!("{} loop unresponsive after {:?}, detaching", name, grace);
                    }
                }
            }
        }

        // 4. Connection: flush best-effort, then close; failures are logged
        //    inside close without aborting the sequence
        if let Some(conn) = self.conn.take() {
            conn.close();
        }

        // 5. Drain queued audio
        self.queue.clear();

        *self.state.lock() = SessionState::Idle;
        let _ = self.events_tx.send(SessionEvent::Stopped);
        tracing::info!("Session stopped");
    }
}

impl Drop for StreamingSession {
    fn drop(&mut self) {
        self.stop();
    }
}
