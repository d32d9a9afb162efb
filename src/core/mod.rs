//! Core session components.
//!
//! This module contains everything below the user interface:
//!
//! - **framebuffer**: Shared remote pixel storage with a generation counter
//! - **geometry**: Zoom, pan and pointer math (the viewport)
//! - **protocol**: Interface the session expects from a wire protocol
//! - **rfb**: Minimal RFB transport implementing that interface over TCP
//! - **session**: Liveness flag and the protocol I/O thread
//!
//! # Architecture
//!
//! ```text
//! Connection
//! ├── SessionState (connected / cancelled flags)
//! ├── SharedFramebuffer (written by the I/O thread)
//! └── I/O thread
//!     └── MessageSource (poll + dispatch server messages)
//! ```

pub mod framebuffer;
pub mod geometry;
pub mod protocol;
pub mod rfb;
pub mod session;
