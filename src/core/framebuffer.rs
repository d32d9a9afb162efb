//! Remote framebuffer storage
//!
//! The framebuffer is the one resource both threads touch: the protocol I/O
//! thread writes rectangles into it as updates arrive and the UI thread reads
//! the whole image on every redraw.
//!
//! Access goes through [`SharedFramebuffer`], a mutex-guarded buffer plus a
//! generation counter. The writer holds the lock for one rectangle at a time.
//! The reader copies the pixels into a private snapshot under the lock, once
//! per redraw and only if the generation moved. A redraw can therefore show
//! the first rectangles of a multi-rectangle update without the rest, but
//! never a half-written rectangle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Bytes per pixel of the session pixel format (32-bit true colour)
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FramebufferError {
    #[error("Rectangle {w}x{h}+{x}+{y} lies outside the {width}x{height} framebuffer")]
    OutOfBounds {
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        width: u16,
        height: u16,
    },

    #[error("Rectangle needs {expected} bytes of pixel data, got {actual}")]
    ShortData { expected: usize, actual: usize },
}

/// Pixel storage, row-major, [`BYTES_PER_PIXEL`] bytes per pixel
#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Bytes per row
    pub fn pitch(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn check_rect(&self, x: u16, y: u16, w: u16, h: u16) -> Result<(), FramebufferError> {
        check_rect(self.width, self.height, x, y, w, h)
    }

    /// Copy a rectangle of raw pixels into place
    pub fn put_rect(&mut self, x: u16, y: u16, w: u16, h: u16, data: &[u8]) -> Result<(), FramebufferError> {
        self.check_rect(x, y, w, h)?;
        let row_len = w as usize * BYTES_PER_PIXEL;
        let expected = row_len * h as usize;
        if data.len() < expected {
            return Err(FramebufferError::ShortData {
                expected,
                actual: data.len(),
            });
        }
        let pitch = self.pitch();
        for (row, src) in data[..expected].chunks_exact(row_len.max(1)).enumerate() {
            let start = (y as usize + row) * pitch + x as usize * BYTES_PER_PIXEL;
            self.pixels[start..start + row_len].copy_from_slice(&src[..row_len]);
        }
        Ok(())
    }

    /// Copy a rectangle from one place in the framebuffer to another.
    ///
    /// Source and destination may overlap.
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, x: u16, y: u16, w: u16, h: u16) -> Result<(), FramebufferError> {
        self.check_rect(src_x, src_y, w, h)?;
        self.check_rect(x, y, w, h)?;
        let pitch = self.pitch();
        let row_len = w as usize * BYTES_PER_PIXEL;
        let copy_row = |pixels: &mut Vec<u8>, row: usize| {
            let src = (src_y as usize + row) * pitch + src_x as usize * BYTES_PER_PIXEL;
            let dst = (y as usize + row) * pitch + x as usize * BYTES_PER_PIXEL;
            pixels.copy_within(src..src + row_len, dst);
        };
        // Walk rows away from the overlap
        if y > src_y {
            for row in (0..h as usize).rev() {
                copy_row(&mut self.pixels, row);
            }
        } else {
            for row in 0..h as usize {
                copy_row(&mut self.pixels, row);
            }
        }
        Ok(())
    }
}

fn check_rect(width: u16, height: u16, x: u16, y: u16, w: u16, h: u16) -> Result<(), FramebufferError> {
    let fits_x = x as u32 + w as u32 <= width as u32;
    let fits_y = y as u32 + h as u32 <= height as u32;
    if fits_x && fits_y {
        Ok(())
    } else {
        Err(FramebufferError::OutOfBounds {
            x,
            y,
            w,
            h,
            width,
            height,
        })
    }
}

/// Framebuffer handle shared by the I/O thread (writer) and the UI (reader)
#[derive(Debug, Clone)]
pub struct SharedFramebuffer {
    inner: Arc<Mutex<Framebuffer>>,
    generation: Arc<AtomicU64>,
    width: u16,
    height: u16,
}

impl SharedFramebuffer {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Framebuffer::new(width, height))),
            generation: Arc::new(AtomicU64::new(0)),
            width,
            height,
        }
    }

    /// Width in pixels. The size is fixed for the whole session.
    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Counter bumped after every completed write
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Check a rectangle against the framebuffer size without locking, so
    /// that a bad header is rejected before its payload is read
    pub fn check_rect(&self, x: u16, y: u16, w: u16, h: u16) -> Result<(), FramebufferError> {
        check_rect(self.width, self.height, x, y, w, h)
    }

    fn lock(&self) -> MutexGuard<'_, Framebuffer> {
        // A panicking writer cannot leave a rectangle half-validated, so the
        // pixels are still usable after poisoning.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a write under the lock and publish it. A failed write is not
    /// published.
    pub fn update<T>(
        &self,
        f: impl FnOnce(&mut Framebuffer) -> Result<T, FramebufferError>,
    ) -> Result<T, FramebufferError> {
        let result = {
            let mut fb = self.lock();
            f(&mut fb)
        };
        if result.is_ok() {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    /// Copy the pixels into `out` if they changed since `seen`.
    ///
    /// Returns true when `out` was refreshed; `seen` is advanced to the
    /// generation that was copied.
    pub fn snapshot_into(&self, out: &mut Vec<u8>, seen: &mut Option<u64>) -> bool {
        let current = self.generation();
        if *seen == Some(current) && !out.is_empty() {
            return false;
        }
        let fb = self.lock();
        // Re-read under the lock: writers bump the counter after releasing it
        let copied = self.generation();
        out.clear();
        out.extend_from_slice(fb.pixels());
        *seen = Some(copied);
        true
    }
}
