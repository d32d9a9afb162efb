//! Protocol collaborator interface
//!
//! The session never talks to the wire directly. A connected protocol is
//! split in two halves:
//!
//! - a [`MessageSource`], moved onto the I/O thread, which waits for server
//!   messages and applies them to the framebuffer;
//! - an [`InputSink`], kept on the UI thread, which sends key and pointer
//!   events.

use std::io;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use super::framebuffer::{FramebufferError, SharedFramebuffer};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Server closed the connection")]
    Closed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("No supported security type offered (server offered {0:?})")]
    UnsupportedSecurity(Vec<u8>),

    #[error("Server refused the connection: {0}")]
    Refused(String),

    #[error("Unsupported message type {0}")]
    UnsupportedMessage(u8),

    #[error("Unsupported rectangle encoding {0}")]
    UnsupportedEncoding(i32),

    #[error("Framebuffer update rejected: {0}")]
    Framebuffer(#[from] FramebufferError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

bitflags! {
    /// Pointer buttons held down
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ButtonMask: u8 {
        const LEFT   = 0b0001;
        const MIDDLE = 0b0010;
        const RIGHT  = 0b0100;
    }
}

/// What the server told us about the session at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub host: String,
    pub port: u16,
    pub width: u16,
    pub height: u16,
    pub desktop_name: String,
}

/// Hook that unblocks a source stuck in a read, used during teardown
pub type Interrupter = Box<dyn FnOnce() + Send>;

/// Reader half of a protocol session
pub trait MessageSource: Send + 'static {
    type Message: Send;

    /// Wait up to `timeout` for the next message. `Ok(None)` means nothing
    /// arrived in time.
    fn poll_message(&mut self, timeout: Duration) -> Result<Option<Self::Message>>;

    /// Handle a message, updating the framebuffer in place
    fn dispatch(&mut self, message: Self::Message, framebuffer: &SharedFramebuffer) -> Result<()>;

    /// Optional hook that makes a blocked `poll_message`/`dispatch` return
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Writer half of a protocol session
pub trait InputSink {
    /// Press (`down`) or release a key identified by its keysym
    fn send_key(&mut self, keysym: u32, down: bool) -> Result<()>;

    /// Report the pointer position and held buttons
    fn send_pointer(&mut self, x: u16, y: u16, buttons: ButtonMask) -> Result<()>;
}
