//! Streaming control plane and media fan-out library.
//!
//! The binary entry point (`main.rs`) wires these modules into a running
//! server; `tests/integration_test.rs` drives the same library in-process
//! over a real TCP socket rather than spawning a separate process, since
//! there is no GStreamer/WebRTC signaling surface left to exercise over
//! HTTP/WebSocket.

pub mod command_bus;
pub mod config;
pub mod controllers;
pub mod encoder;
pub mod error;
pub mod frame_bus;
pub mod protocol;
pub mod recording;
pub mod server;
pub mod session;

#[cfg(any(test, feature = "test-mode"))]
pub mod testutil;
