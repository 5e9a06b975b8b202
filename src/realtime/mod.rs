//! Realtime duplex channel for call sessions.
//!
//! One WebSocket connection per call session carries the full protocol
//! from [`crate::protocol`]: audio in, transcription/response/heartbeat
//! events out.

mod ws_server;

pub use ws_server::RealtimeServer;
