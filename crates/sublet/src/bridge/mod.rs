//! IPC bridge between the parent and its worker subprocess.
//!
//! - **protocol**: the `Message` sum type and the inner configuration
//! - **codec**: length-prefixed JSON framing for AsyncRead/AsyncWrite
//! - **transport**: side-aware outbound handle and the frame pump

pub mod codec;
pub mod protocol;
pub mod transport;
