//! Viewport geometry
//!
//! Maps between the three coordinate spaces of a session: physical display
//! pixels, terminal character cells and remote framebuffer pixels. All of the
//! zoom, pan and pointer math lives here; nothing in this module touches the
//! terminal or the network.

use crate::config::GeometryConfig;

/// Span of remote pixels used to judge whether the pointer is visible
pub const CURSOR_PROBE_SPAN: f32 = 12.0;
/// The probe span must cover at least this many cells to be visible
pub const CURSOR_MIN_CELLS: f32 = 5.0;

/// Coordinate axis
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
}

/// Sizes the viewport depends on, sampled fresh for every operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GeometryFacts {
    /// Physical display size in pixels
    pub disp_width: u32,
    pub disp_height: u32,
    /// Terminal size in character cells
    pub term_width: u32,
    pub term_height: u32,
    /// Remote framebuffer size in pixels
    pub remote_width: u32,
    pub remote_height: u32,
}

impl GeometryFacts {
    /// Build a snapshot from `(width, height)` pairs. Zero sizes are raised
    /// to one so that no ratio below divides by zero.
    pub fn new(display: (u32, u32), term: (u32, u32), remote: (u32, u32)) -> Self {
        Self {
            disp_width: display.0.max(1),
            disp_height: display.1.max(1),
            term_width: term.0.max(1),
            term_height: term.1.max(1),
            remote_width: remote.0.max(1),
            remote_height: remote.1.max(1),
        }
    }

    /// Terminal size in cells along an axis
    pub fn term(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.term_width as f32,
            Axis::Y => self.term_height as f32,
        }
    }

    /// Remote framebuffer size in pixels along an axis
    pub fn remote(&self, axis: Axis) -> u32 {
        match axis {
            Axis::X => self.remote_width,
            Axis::Y => self.remote_height,
        }
    }
}

/// Fill the zoom table: level 0 is 1.0x, each level multiplies by `step`.
pub fn zoom_table(max_level: usize, step: f32) -> Vec<f32> {
    let mut levels = Vec::with_capacity(max_level + 1);
    levels.push(1.0f32);
    for i in 0..max_level {
        levels.push(levels[i] * step);
    }
    levels
}

/// Mouse speed is the inverse of zoom.
///
/// At maximum zoom the pointer moves 1px per step; each level below that
/// adds 2px per step.
pub fn mouse_speed_table(max_level: usize) -> Vec<i32> {
    (0..=max_level)
        .map(|i| 1 + (max_level - i) as i32 * 2)
        .collect()
}

/// Destination rectangle of the framebuffer, in terminal cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DitherRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl DitherRegion {
    fn offset(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.x as f32,
            Axis::Y => self.y as f32,
        }
    }

    fn size(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.width as f32,
            Axis::Y => self.height as f32,
        }
    }

    /// Map a remote pixel coordinate to the terminal cell it lands in
    pub fn to_cell(&self, facts: &GeometryFacts, axis: Axis, remote_px: i32) -> i32 {
        let ratio = remote_px as f32 / facts.remote(axis) as f32;
        (ratio * self.size(axis) + self.offset(axis)) as i32
    }

    /// Number of cells a span of remote pixels occupies on screen
    pub fn span_cells(&self, facts: &GeometryFacts, axis: Axis, span_px: f32) -> f32 {
        span_px / facts.remote(axis) as f32 * self.size(axis)
    }

    /// Whether a pointer drawn by the remote is too small to notice
    pub fn cursor_hard_to_see(&self, facts: &GeometryFacts) -> bool {
        self.span_cells(facts, Axis::X, CURSOR_PROBE_SPAN) < CURSOR_MIN_CELLS
    }
}

/// Zoom, pan and pointer state of one session
#[derive(Clone, Debug)]
pub struct Viewport {
    level: usize,
    zoom_levels: Vec<f32>,
    mouse_speed: Vec<i32>,
    pan_step: f32,
    /// Fractional view centre, each within [0, 1]
    view_x: f32,
    view_y: f32,
    /// Effective per-axis zoom derived from `level`
    zoom_x: f32,
    zoom_y: f32,
    /// Pointer position in remote pixels
    mouse_x: i32,
    mouse_y: i32,
}

impl Viewport {
    /// Start with the whole image centred and the pointer in the middle.
    pub fn new(config: &GeometryConfig, facts: &GeometryFacts) -> Self {
        let mut viewport = Self {
            level: 0,
            zoom_levels: zoom_table(config.max_zoom, config.zoom_step),
            mouse_speed: mouse_speed_table(config.max_zoom),
            pan_step: config.pan_step,
            view_x: 0.5,
            view_y: 0.5,
            zoom_x: 1.0,
            zoom_y: 1.0,
            mouse_x: (facts.remote_width / 2) as i32,
            mouse_y: (facts.remote_height / 2) as i32,
        };
        viewport.set_zoom(facts, 0);
        viewport
    }

    pub fn max_level(&self) -> usize {
        self.zoom_levels.len() - 1
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Level used by [`Viewport::zoom_to_cursor`], two thirds of the maximum
    pub fn cursor_level(&self) -> usize {
        self.max_level() * 2 / 3
    }

    pub fn zoom(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.zoom_x,
            Axis::Y => self.zoom_y,
        }
    }

    pub fn view(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => self.view_x,
            Axis::Y => self.view_y,
        }
    }

    /// Pointer position in remote pixels
    pub fn mouse(&self) -> (i32, i32) {
        (self.mouse_x, self.mouse_y)
    }

    /// Pointer movement per step at the current level
    pub fn mouse_speed(&self) -> i32 {
        self.mouse_speed[self.level]
    }

    /// Zoom in (+) or out (-) by `delta` levels and recompute per-axis zoom.
    pub fn set_zoom(&mut self, facts: &GeometryFacts, delta: i32) {
        let level = self.level as i64 + delta as i64;
        self.level = level.clamp(0, self.max_level() as i64) as usize;

        self.zoom_x = self.zoom_levels[self.level];
        // Composed of cell grid aspect, remote aspect and display aspect. The
        // cell grid enters once in each direction and cancels, leaving the
        // remote image at its true aspect on the physical display.
        let remote_aspect = facts.remote_height as f32 / facts.remote_width as f32;
        let display_aspect = facts.disp_width as f32 / facts.disp_height as f32;
        self.zoom_y = self.zoom_x * remote_aspect * display_aspect;

        // Vertical would over-zoom: keep it at the requested zoom and shrink
        // the horizontal axis proportionally instead of clipping.
        if self.zoom_y > self.zoom_x {
            let zx = self.zoom_x;
            self.zoom_x = zx * zx / self.zoom_y;
            self.zoom_y = zx;
        }
    }

    /// Pan the view several steps left (-x), right (+x), up (-y) or down (+y).
    ///
    /// An axis that already fits on screen does not move.
    pub fn pan(&mut self, dx: i32, dy: i32) {
        if dx != 0 {
            if self.zoom_x > 1.0 {
                self.view_x += dx as f32 * (self.pan_step / self.zoom_x);
            }
            self.view_x = self.view_x.clamp(0.0, 1.0);
        }
        if dy != 0 {
            if self.zoom_y > 1.0 {
                self.view_y += dy as f32 * (self.pan_step / self.zoom_y);
            }
            self.view_y = self.view_y.clamp(0.0, 1.0);
        }
    }

    /// Move the pointer several steps, scaled by the current mouse speed.
    pub fn move_mouse(&mut self, facts: &GeometryFacts, dx: i32, dy: i32) {
        let speed = self.mouse_speed();
        self.mouse_x = (self.mouse_x + dx * speed).clamp(0, facts.remote_width as i32 - 1);
        self.mouse_y = (self.mouse_y + dy * speed).clamp(0, facts.remote_height as i32 - 1);
    }

    /// Zoom in to the cursor level and centre the view on the pointer.
    pub fn zoom_to_cursor(&mut self, facts: &GeometryFacts) {
        let delta = self.cursor_level() as i32 - self.level as i32;
        self.set_zoom(facts, delta);
        self.view_x = self.mouse_x as f32 / facts.remote_width as f32;
        self.view_y = self.mouse_y as f32 / facts.remote_height as f32;
    }

    /// Rectangle of terminal cells the framebuffer is drawn into.
    pub fn dither_region(&self, facts: &GeometryFacts) -> DitherRegion {
        let delta_x = if self.zoom_x > 1.0 { self.view_x } else { 0.5 };
        let delta_y = if self.zoom_y > 1.0 { self.view_y } else { 0.5 };
        let term_w = facts.term(Axis::X);
        let term_h = facts.term(Axis::Y);
        DitherRegion {
            x: (term_w * (1.0 - self.zoom_x) * delta_x) as i32,
            y: (term_h * (1.0 - self.zoom_y) * delta_y) as i32,
            // +1 so rounding never leaves an uncovered column or row
            width: (term_w * self.zoom_x + 1.0) as i32,
            height: (term_h * self.zoom_y + 1.0) as i32,
        }
    }
}
