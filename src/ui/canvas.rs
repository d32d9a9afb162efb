//! Drawing surface
//!
//! The viewer draws into a [`Canvas`]: a grid of character cells that can
//! take text, filled rectangles and a bitmap scaled into a cell rectangle.
//! Drawing happens on an in-memory [`CellGrid`]; `present` pushes it to the
//! real display. [`TermCanvas`] is the crossterm implementation, which shows
//! bitmaps with upper-half-block characters (two pixels per cell, one in the
//! foreground colour and one in the background colour).

use std::collections::VecDeque;
use std::io::{self, BufWriter, Write};
use std::time::{Duration, Instant};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyEventKind},
    execute, queue,
    style::{Print, ResetColor, SetBackgroundColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen, SetTitle},
};
use thiserror::Error;
use tracing::debug;
use unicode_width::UnicodeWidthChar;

use super::keys::{raw_keys, RawKey};
use crate::config::Color;
use crate::core::geometry::DitherRegion;

/// Pixel size assumed for a cell when the terminal does not report one
const FALLBACK_CELL_PX: (u32, u32) = (8, 16);

/// Marks the right half of a double-width character
const CONTINUATION: char = '\0';

const HALF_BLOCK: char = '▀';

#[derive(Error, Debug)]
pub enum CanvasError {
    #[error("Terminal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Unsupported bitmap depth: {0} bits per pixel")]
    UnsupportedDepth(u32),
}

/// Next thing that happened on the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasEvent {
    Key(RawKey),
    Resize,
    /// The display went away
    Quit,
    /// Nothing happened before the timeout
    Timeout,
}

/// Text colours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Style {
    pub fg: Color,
    pub bg: Color,
}

impl Style {
    pub const fn new(fg: Color, bg: Color) -> Self {
        Self { fg, bg }
    }
}

impl Default for Style {
    fn default() -> Self {
        Self::new(Color::new(255, 255, 255), Color::new(0, 0, 0))
    }
}

/// Layout of the pixels handed to [`Canvas::draw_bitmap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dither {
    bpp: u32,
    width: u32,
    height: u32,
    pitch: usize,
    masks: [u32; 4],
}

impl Dither {
    /// Describe a bitmap. Only 32 bits per pixel are supported; masks are
    /// red, green, blue, alpha.
    pub fn new(bpp: u32, width: u32, height: u32, pitch: usize, masks: [u32; 4]) -> Result<Self, CanvasError> {
        if bpp != 32 {
            return Err(CanvasError::UnsupportedDepth(bpp));
        }
        Ok(Self {
            bpp,
            width,
            height,
            pitch,
            masks,
        })
    }

    /// Colour of the pixel at (x, y), black if out of range
    fn sample(&self, pixels: &[u8], x: u32, y: u32) -> Color {
        let bytes = (self.bpp / 8) as usize;
        let offset = y as usize * self.pitch + x as usize * bytes;
        let Some(raw) = pixels.get(offset..offset + bytes) else {
            return Color::new(0, 0, 0);
        };
        let value = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let channel = |mask: u32| -> u8 {
            if mask == 0 {
                return 0;
            }
            ((value & mask) >> mask.trailing_zeros()) as u8
        };
        Color::new(channel(self.masks[0]), channel(self.masks[1]), channel(self.masks[2]))
    }
}

/// One character cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub style: Style,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            style: Style::default(),
        }
    }
}

/// In-memory cell buffer shared by all canvas implementations
#[derive(Debug, Clone)]
pub struct CellGrid {
    width: u16,
    height: u16,
    cells: Vec<Cell>,
}

impl CellGrid {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            cells: vec![Cell::default(); width as usize * height as usize],
        }
    }

    pub fn size(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn resize(&mut self, width: u16, height: u16) {
        if (width, height) != (self.width, self.height) {
            *self = Self::new(width, height);
        }
    }

    pub fn cell(&self, x: u16, y: u16) -> Option<&Cell> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.cells.get(y as usize * self.width as usize + x as usize)
    }

    fn cell_mut(&mut self, x: i32, y: i32) -> Option<&mut Cell> {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return None;
        }
        self.cells.get_mut(y as usize * self.width as usize + x as usize)
    }

    /// Text of one row, with continuation cells dropped
    pub fn row_text(&self, y: u16) -> String {
        (0..self.width)
            .filter_map(|x| self.cell(x, y))
            .map(|c| c.ch)
            .filter(|ch| *ch != CONTINUATION)
            .collect()
    }

    pub fn clear(&mut self) {
        self.cells.fill(Cell::default());
    }

    /// Write text starting at (x, y). Text running off the right edge is cut.
    pub fn put_str(&mut self, x: i32, y: i32, text: &str, style: Style) {
        let mut col = x;
        for ch in text.chars() {
            let width = UnicodeWidthChar::width(ch).unwrap_or(0) as i32;
            if width == 0 {
                continue;
            }
            if col + width > self.width as i32 {
                break;
            }
            if let Some(cell) = self.cell_mut(col, y) {
                *cell = Cell { ch, style };
            }
            if width == 2 {
                if let Some(cell) = self.cell_mut(col + 1, y) {
                    *cell = Cell {
                        ch: CONTINUATION,
                        style,
                    };
                }
            }
            col += width;
        }
    }

    /// Fill a rectangle with one character
    pub fn fill(&mut self, x: i32, y: i32, width: i32, height: i32, ch: char, style: Style) {
        for cy in y..y + height {
            for cx in x..x + width {
                if let Some(cell) = self.cell_mut(cx, cy) {
                    *cell = Cell { ch, style };
                }
            }
        }
    }

    /// Scale a bitmap into `region`, clipped to the grid. Each cell shows two
    /// vertically stacked samples.
    pub fn draw_bitmap(&mut self, region: &DitherRegion, dither: &Dither, pixels: &[u8]) {
        if region.width <= 0 || region.height <= 0 || dither.width == 0 || dither.height == 0 {
            return;
        }
        let x_start = region.x.max(0);
        let x_end = (region.x + region.width).min(self.width as i32);
        let y_start = region.y.max(0);
        let y_end = (region.y + region.height).min(self.height as i32);

        let source = |pos: f32, origin: i32, span: i32, limit: u32| -> u32 {
            let frac = (pos - origin as f32) / span as f32;
            ((frac * limit as f32) as u32).min(limit - 1)
        };

        for cy in y_start..y_end {
            let top = source(cy as f32 + 0.25, region.y, region.height, dither.height);
            let bottom = source(cy as f32 + 0.75, region.y, region.height, dither.height);
            for cx in x_start..x_end {
                let sx = source(cx as f32 + 0.5, region.x, region.width, dither.width);
                let style = Style::new(dither.sample(pixels, sx, top), dither.sample(pixels, sx, bottom));
                if let Some(cell) = self.cell_mut(cx, cy) {
                    *cell = Cell { ch: HALF_BLOCK, style };
                }
            }
        }
    }
}

/// Display collaborator used by the viewer
pub trait Canvas {
    fn grid(&self) -> &CellGrid;

    fn grid_mut(&mut self) -> &mut CellGrid;

    /// Display size in pixels
    fn display_size(&self) -> (u32, u32);

    /// Push the grid to the display
    fn present(&mut self) -> Result<(), CanvasError>;

    /// Wait up to `timeout` for the next event
    fn wait_event(&mut self, timeout: Duration) -> Result<CanvasEvent, CanvasError>;

    /// Name the display window, where the display has one
    fn set_title(&mut self, _title: &str) {}

    /// Canvas size in cells
    fn size(&self) -> (u16, u16) {
        self.grid().size()
    }

    fn clear(&mut self) {
        self.grid_mut().clear();
    }

    fn put_str(&mut self, x: i32, y: i32, text: &str, style: Style) {
        self.grid_mut().put_str(x, y, text, style);
    }

    fn fill(&mut self, x: i32, y: i32, width: i32, height: i32, ch: char, style: Style) {
        self.grid_mut().fill(x, y, width, height, ch, style);
    }

    fn draw_bitmap(&mut self, region: &DitherRegion, dither: &Dither, pixels: &[u8]) {
        self.grid_mut().draw_bitmap(region, dither, pixels);
    }
}

/// Begin a render frame (synchronized update, disable autowrap)
fn begin_frame<W: Write>(out: &mut W) -> io::Result<()> {
    write!(out, "\x1b[?2026h")?;
    write!(out, "\x1b[?7l")?;
    Ok(())
}

/// End a render frame (enable autowrap, end synchronized update, flush)
fn end_frame<W: Write>(out: &mut W) -> io::Result<()> {
    write!(out, "\x1b[?7h")?;
    write!(out, "\x1b[?2026l")?;
    out.flush()
}

/// Execute a render operation with frame guards, ensuring cleanup on error
fn with_frame<W: Write, F, R>(out: &mut W, f: F) -> io::Result<R>
where
    F: FnOnce(&mut W) -> io::Result<R>,
{
    begin_frame(out)?;
    let result = f(out);
    // Always end frame, even on error
    let _ = end_frame(out);
    result
}

/// Canvas on the controlling terminal
pub struct TermCanvas {
    grid: CellGrid,
    display: (u32, u32),
    /// Codes still owed from a multi-code key event
    pending: VecDeque<RawKey>,
    initialized: bool,
}

impl TermCanvas {
    /// Take over the terminal: raw mode, alternate screen, hidden cursor
    pub fn new() -> Result<Self, CanvasError> {
        let mut canvas = Self {
            grid: CellGrid::new(0, 0),
            display: (0, 0),
            pending: VecDeque::new(),
            initialized: false,
        };
        canvas.init()?;
        canvas.refresh_size()?;
        Ok(canvas)
    }

    fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, Hide, Clear(ClearType::All))?;
        self.initialized = true;
        Ok(())
    }

    /// Give the terminal back
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        // Restore terminal state (in case of abnormal exit)
        write!(stdout, "\x1b[?7h")?;
        write!(stdout, "\x1b[?2026l")?;
        execute!(stdout, ResetColor, Show, LeaveAlternateScreen)?;
        terminal::disable_raw_mode()
    }

    fn refresh_size(&mut self) -> io::Result<()> {
        let (cols, rows) = terminal::size()?;
        self.grid.resize(cols, rows);
        self.display = match terminal::window_size() {
            Ok(size) if size.width > 0 && size.height > 0 => (u32::from(size.width), u32::from(size.height)),
            _ => (
                u32::from(cols) * FALLBACK_CELL_PX.0,
                u32::from(rows) * FALLBACK_CELL_PX.1,
            ),
        };
        debug!(
            "Canvas is {}x{} cells, {}x{} px",
            cols, rows, self.display.0, self.display.1
        );
        Ok(())
    }

    fn write_grid<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let (width, height) = self.grid.size();
        let mut last: Option<Style> = None;
        for y in 0..height {
            queue!(out, MoveTo(0, y))?;
            for x in 0..width {
                let Some(cell) = self.grid.cell(x, y) else {
                    continue;
                };
                if cell.ch == CONTINUATION {
                    continue;
                }
                if last != Some(cell.style) {
                    queue!(
                        out,
                        SetForegroundColor(cell.style.fg.to_crossterm()),
                        SetBackgroundColor(cell.style.bg.to_crossterm())
                    )?;
                    last = Some(cell.style);
                }
                queue!(out, Print(cell.ch))?;
            }
        }
        queue!(out, ResetColor)?;
        Ok(())
    }
}

impl Canvas for TermCanvas {
    fn grid(&self) -> &CellGrid {
        &self.grid
    }

    fn grid_mut(&mut self) -> &mut CellGrid {
        &mut self.grid
    }

    fn display_size(&self) -> (u32, u32) {
        self.display
    }

    fn set_title(&mut self, title: &str) {
        if let Err(e) = execute!(io::stdout(), SetTitle(title)) {
            debug!("Failed to set terminal title: {}", e);
        }
    }

    fn present(&mut self) -> Result<(), CanvasError> {
        let stdout = io::stdout();
        let mut out = BufWriter::with_capacity(1 << 16, stdout.lock());
        with_frame(&mut out, |out| self.write_grid(out))?;
        Ok(())
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<CanvasEvent, CanvasError> {
        if let Some(key) = self.pending.pop_front() {
            return Ok(CanvasEvent::Key(key));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !event::poll(remaining)? {
                return Ok(CanvasEvent::Timeout);
            }
            match event::read()? {
                Event::Key(key_event) if key_event.kind != KeyEventKind::Release => {
                    let mut keys = raw_keys(&key_event).into_iter();
                    if let Some(first) = keys.next() {
                        self.pending.extend(keys);
                        return Ok(CanvasEvent::Key(first));
                    }
                }
                Event::Resize(..) => {
                    self.refresh_size()?;
                    return Ok(CanvasEvent::Resize);
                }
                _ => {}
            }
        }
    }
}

impl Drop for TermCanvas {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
