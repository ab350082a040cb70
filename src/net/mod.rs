//! Network subsystem: TCP connection plus the duplex transport loops

pub mod connection;
pub mod transport;

pub use connection::Connection;
pub use transport::{
    spawn_recv_loop, spawn_send_loop, TransportHandle, TransportStats, TransportStatsSnapshot,
};
