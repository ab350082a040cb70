//! TCP connection wrapper
//!
//! One connected byte stream shared by the send loop (writes) and the
//! receive loop (reads). `std::net::TcpStream` supports concurrent reads
//! and writes through `&TcpStream`, so both loops hold the same `Arc`.
//! Reads carry a short timeout equal to the receive poll interval, which
//! gives the receive loop its idle cadence without non-blocking juggling.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::constants::RECV_POLL_MS;
use crate::error::NetworkError;

pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    connected: AtomicBool,
}

impl Connection {
    /// Connect to a peer with a bounded timeout
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let sockaddr = addr
            .to_socket_addrs()
            .map_err(|_| NetworkError::InvalidAddress(addr.to_string()))?
            .next()
            .ok_or_else(|| NetworkError::InvalidAddress(addr.to_string()))?;

        let stream =
            TcpStream::connect_timeout(&sockaddr, timeout).map_err(map_connect_error)?;
        Self::from_stream(stream)
    }

    /// Accept a single inbound connection on `port` (blocking)
    pub fn listen(port: u16) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let (stream, _) = listener
            .accept()
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self, NetworkError> {
        let peer = stream
            .peer_addr()
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(RECV_POLL_MS)))
            .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;

        Ok(Self {
            stream,
            peer,
            connected: AtomicBool::new(true),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Write all bytes to the peer. May block briefly on OS send-buffer
    /// backpressure; never called from the real-time audio threads.
    pub fn write(&self, bytes: &[u8]) -> Result<(), NetworkError> {
        (&self.stream).write_all(bytes).map_err(|e| {
            self.connected.store(false, Ordering::Relaxed);
            NetworkError::SendFailed(e.to_string())
        })
    }

    /// Read whatever the peer has sent, waiting at most the poll interval.
    /// `Ok(0)` means nothing arrived within the interval.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        match (&self.stream).read(buf) {
            Ok(0) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(NetworkError::Closed)
            }
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                Err(NetworkError::ReceiveFailed(e.to_string()))
            }
        }
    }

    /// Best-effort flush then shutdown. Each failure is logged on its own;
    /// neither aborts the close.
    pub fn close(&self) {
        if let Err(e) = (&self.stream).flush() {
            tracing::warn!("Flush before close failed: {}", e);
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                tracing::warn!("Socket shutdown failed: {}", e);
            }
        }
        self.connected.store(false, Ordering::Relaxed);
    }
}

fn map_connect_error(e: std::io::Error) -> NetworkError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => NetworkError::ConnectTimeout,
        ErrorKind::ConnectionRefused => NetworkError::ConnectRefused,
        _ => NetworkError::ConnectFailed(e.to_string()),
    }
}
