//! Thin RFB transport
//!
//! The narrowest wire adapter that gives the session a [`MessageSource`] and
//! an [`InputSink`] over TCP. It negotiates protocol 3.3/3.7/3.8 with the
//! "None" security type, asks for 32-bit true colour and understands Raw and
//! CopyRect rectangles. Anything beyond that is reported as an error rather
//! than guessed at.
//!
//! The DesktopSize pseudo-encoding is never advertised: the framebuffer keeps
//! the size announced at connect time.

use std::io::{self, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info};

use super::framebuffer::{SharedFramebuffer, BYTES_PER_PIXEL};
use super::protocol::{
    ButtonMask, InputSink, Interrupter, MessageSource, ProtocolError, Result, SessionInfo,
};

const SECURITY_INVALID: u8 = 0;
const SECURITY_NONE: u8 = 1;

const ENCODING_RAW: i32 = 0;
const ENCODING_COPY_RECT: i32 = 1;

// Client to server message types
const MSG_SET_PIXEL_FORMAT: u8 = 0;
const MSG_SET_ENCODINGS: u8 = 2;
const MSG_UPDATE_REQUEST: u8 = 3;
const MSG_KEY_EVENT: u8 = 4;
const MSG_POINTER_EVENT: u8 = 5;

/// Longest desktop name or failure reason we are willing to read
const MAX_STRING_LEN: u32 = 1 << 16;

/// 32 bpp, depth 24, little-endian true colour, red/green/blue at bits 0/8/16
const PIXEL_FORMAT: [u8; 16] = [
    32, 24, 0, 1, // bpp, depth, big-endian, true-colour
    0, 255, 0, 255, 0, 255, // red/green/blue max
    0, 8, 16, // red/green/blue shift
    0, 0, 0, // padding
];

/// Server to client messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    FramebufferUpdate,
    SetColourMapEntries,
    Bell,
    ServerCutText,
}

impl ServerMessage {
    fn from_type(ty: u8) -> Result<Self> {
        match ty {
            0 => Ok(Self::FramebufferUpdate),
            1 => Ok(Self::SetColourMapEntries),
            2 => Ok(Self::Bell),
            3 => Ok(Self::ServerCutText),
            other => Err(ProtocolError::UnsupportedMessage(other)),
        }
    }
}

/// Result of ServerInit
#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerInit {
    width: u16,
    height: u16,
    name: String,
}

/// Both halves of a connected session plus what the server announced
pub struct RfbSession {
    pub info: SessionInfo,
    pub reader: RfbReader,
    pub writer: RfbWriter,
}

impl RfbSession {
    /// Connect to `host:port` and complete the handshake.
    pub fn connect(host: &str, port: u16, shared: bool) -> Result<Self> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, host, port, shared)
    }

    /// Complete the handshake on an already connected stream.
    pub fn from_stream(mut stream: TcpStream, host: &str, port: u16, shared: bool) -> Result<Self> {
        let init = handshake(&mut stream, shared)?;
        info!(
            "Connected to {}:{} \"{}\" ({}x{})",
            host, port, init.name, init.width, init.height
        );

        let writer = RfbWriter {
            stream: Arc::new(Mutex::new(stream.try_clone()?)),
        };
        writer.send(&set_pixel_format())?;
        writer.send(&set_encodings(&[ENCODING_COPY_RECT, ENCODING_RAW]))?;
        writer.send(&update_request(false, init.width, init.height))?;

        let reader = RfbReader {
            reader: BufReader::new(stream),
            writer: writer.clone(),
            width: init.width,
            height: init.height,
            scratch: Vec::new(),
        };
        let info = SessionInfo {
            host: host.to_string(),
            port,
            width: init.width,
            height: init.height,
            desktop_name: init.name,
        };
        Ok(Self { info, reader, writer })
    }
}

/// Reader half, runs on the I/O thread
pub struct RfbReader {
    reader: BufReader<TcpStream>,
    writer: RfbWriter,
    width: u16,
    height: u16,
    scratch: Vec<u8>,
}

impl RfbReader {
    fn read_framebuffer_update(&mut self, framebuffer: &SharedFramebuffer) -> Result<()> {
        skip(&mut self.reader, 1)?;
        let rects = read_u16(&mut self.reader)?;
        for _ in 0..rects {
            let x = read_u16(&mut self.reader)?;
            let y = read_u16(&mut self.reader)?;
            let w = read_u16(&mut self.reader)?;
            let h = read_u16(&mut self.reader)?;
            match read_i32(&mut self.reader)? {
                ENCODING_RAW => {
                    // The header alone decides the payload size
                    framebuffer.check_rect(x, y, w, h)?;
                    let len = w as usize * h as usize * BYTES_PER_PIXEL;
                    self.scratch.resize(len, 0);
                    self.reader.read_exact(&mut self.scratch)?;
                    let data = &self.scratch;
                    framebuffer.update(|fb| fb.put_rect(x, y, w, h, data))?;
                }
                ENCODING_COPY_RECT => {
                    let src_x = read_u16(&mut self.reader)?;
                    let src_y = read_u16(&mut self.reader)?;
                    framebuffer.update(|fb| fb.copy_rect(src_x, src_y, x, y, w, h))?;
                }
                other => return Err(ProtocolError::UnsupportedEncoding(other)),
            }
        }
        // Keep updates flowing
        self.writer
            .send(&update_request(true, self.width, self.height))?;
        Ok(())
    }
}

impl MessageSource for RfbReader {
    type Message = ServerMessage;

    fn poll_message(&mut self, timeout: Duration) -> Result<Option<ServerMessage>> {
        let mut ty = [0u8; 1];
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let read = self.reader.read(&mut ty);
        self.reader.get_ref().set_read_timeout(None)?;
        match read {
            Ok(0) => Err(ProtocolError::Closed),
            Ok(_) => ServerMessage::from_type(ty[0]).map(Some),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dispatch(&mut self, message: ServerMessage, framebuffer: &SharedFramebuffer) -> Result<()> {
        match message {
            ServerMessage::FramebufferUpdate => self.read_framebuffer_update(framebuffer)?,
            ServerMessage::SetColourMapEntries => {
                // True colour only; the palette is irrelevant
                skip(&mut self.reader, 1)?;
                let _first = read_u16(&mut self.reader)?;
                let count = read_u16(&mut self.reader)?;
                skip(&mut self.reader, count as u64 * 6)?;
            }
            ServerMessage::Bell => debug!("Bell"),
            ServerMessage::ServerCutText => {
                skip(&mut self.reader, 3)?;
                let len = read_u32(&mut self.reader)?;
                skip(&mut self.reader, len as u64)?;
                debug!("Ignored {} bytes of server cut text", len);
            }
        }
        Ok(())
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let stream = self.reader.get_ref().try_clone().ok()?;
        Some(Box::new(move || {
            let _ = stream.shutdown(Shutdown::Both);
        }))
    }
}

/// Writer half, used from the UI thread (and by the reader for update
/// requests)
#[derive(Clone)]
pub struct RfbWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl RfbWriter {
    fn send(&self, message: &[u8]) -> io::Result<()> {
        let mut stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(message)
    }
}

impl InputSink for RfbWriter {
    fn send_key(&mut self, keysym: u32, down: bool) -> Result<()> {
        Ok(self.send(&key_event(keysym, down))?)
    }

    fn send_pointer(&mut self, x: u16, y: u16, buttons: ButtonMask) -> Result<()> {
        Ok(self.send(&pointer_event(x, y, buttons))?)
    }
}

/// Version, security and init exchange
fn handshake<S: Read + Write>(stream: &mut S, shared: bool) -> Result<ServerInit> {
    let mut version = [0u8; 12];
    stream.read_exact(&mut version)?;
    let minor = negotiate_version(&version)?;
    stream.write_all(format!("RFB 003.{:03}\n", minor).as_bytes())?;

    if minor == 3 {
        // 3.3: the server picks the security type
        let ty = read_u32(stream)?;
        match u8::try_from(ty) {
            Ok(SECURITY_NONE) => {}
            Ok(SECURITY_INVALID) => return Err(ProtocolError::Refused(read_string(stream)?)),
            _ => return Err(ProtocolError::UnsupportedSecurity(ty.to_be_bytes().to_vec())),
        }
    } else {
        let count = read_u8(stream)?;
        if count == 0 {
            return Err(ProtocolError::Refused(read_string(stream)?));
        }
        let mut types = vec![0u8; count as usize];
        stream.read_exact(&mut types)?;
        if !types.contains(&SECURITY_NONE) {
            return Err(ProtocolError::UnsupportedSecurity(types));
        }
        stream.write_all(&[SECURITY_NONE])?;
        // 3.7 skips the security result for "None"
        if minor >= 8 && read_u32(stream)? != 0 {
            return Err(ProtocolError::Refused(read_string(stream)?));
        }
    }

    // ClientInit
    stream.write_all(&[shared as u8])?;

    // ServerInit
    let width = read_u16(stream)?;
    let height = read_u16(stream)?;
    let mut _format = [0u8; 16];
    stream.read_exact(&mut _format)?;
    let name = read_string(stream)?;
    Ok(ServerInit { width, height, name })
}

/// Parse "RFB xxx.yyy\n" and pick the minor version we will speak
fn negotiate_version(version: &[u8; 12]) -> Result<u32> {
    let text = String::from_utf8_lossy(version);
    let bad = || ProtocolError::UnsupportedVersion(text.trim_end().to_string());
    if !version.is_ascii() || !text.starts_with("RFB ") || version[7] != b'.' || version[11] != b'\n' {
        return Err(bad());
    }
    let major: u32 = text[4..7].parse().map_err(|_| bad())?;
    let minor: u32 = text[8..11].parse().map_err(|_| bad())?;
    match (major, minor) {
        (3, m) if m >= 8 => Ok(8),
        (3, 7) => Ok(7),
        (3, _) => Ok(3),
        (m, _) if m > 3 => Ok(8),
        _ => Err(bad()),
    }
}

fn set_pixel_format() -> Vec<u8> {
    let mut msg = vec![MSG_SET_PIXEL_FORMAT, 0, 0, 0];
    msg.extend_from_slice(&PIXEL_FORMAT);
    msg
}

fn set_encodings(encodings: &[i32]) -> Vec<u8> {
    let mut msg = vec![MSG_SET_ENCODINGS, 0];
    msg.extend_from_slice(&(encodings.len() as u16).to_be_bytes());
    for encoding in encodings {
        msg.extend_from_slice(&encoding.to_be_bytes());
    }
    msg
}

fn update_request(incremental: bool, width: u16, height: u16) -> Vec<u8> {
    let mut msg = vec![MSG_UPDATE_REQUEST, incremental as u8, 0, 0, 0, 0];
    msg.extend_from_slice(&width.to_be_bytes());
    msg.extend_from_slice(&height.to_be_bytes());
    msg
}

fn key_event(keysym: u32, down: bool) -> Vec<u8> {
    let mut msg = vec![MSG_KEY_EVENT, down as u8, 0, 0];
    msg.extend_from_slice(&keysym.to_be_bytes());
    msg
}

fn pointer_event(x: u16, y: u16, buttons: ButtonMask) -> Vec<u8> {
    let mut msg = vec![MSG_POINTER_EVENT, buttons.bits()];
    msg.extend_from_slice(&x.to_be_bytes());
    msg.extend_from_slice(&y.to_be_bytes());
    msg
}

fn read_u8<R: Read + ?Sized>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read + ?Sized>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read + ?Sized>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i32<R: Read + ?Sized>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

/// Length-prefixed string (desktop name, failure reason)
fn read_string<R: Read + ?Sized>(r: &mut R) -> Result<String> {
    let len = read_u32(r)?;
    if len > MAX_STRING_LEN {
        return Err(ProtocolError::Handshake(format!("string of {} bytes is too long", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn skip<R: Read + ?Sized>(r: &mut R, len: u64) -> io::Result<()> {
    let copied = io::copy(&mut r.take(len), &mut io::sink())?;
    if copied < len {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "message truncated"));
    }
    Ok(())
}
