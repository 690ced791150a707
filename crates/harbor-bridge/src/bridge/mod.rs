//! Host side of the worker protocol.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (HostFrame, WorkerFrame, RawMessage)
//! - **codec**: Newline-delimited JSON codec for AsyncRead/AsyncWrite
//! - **session_loop**: The init → read → proxy → done state machine

pub mod codec;
pub mod protocol;
pub mod session_loop;

pub use session_loop::{BridgeLoop, BridgeState};
