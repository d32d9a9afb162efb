//! Viewer poll loop
//!
//! Runs on the UI thread. Each iteration waits at most one frame interval
//! for a key, resize or quit. Keys go through the [`InputMachine`] and the
//! resulting actions are carried out against the viewport and the remote
//! session. A timeout (or resize) resolves pending Escapes and redraws, which
//! keeps the picture moving at a steady rate without any input.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use unicode_width::UnicodeWidthChar;

use super::canvas::{Canvas, CanvasError, CanvasEvent, Dither, Style};
use super::input::{Action, Command, HeldKeys, InputMachine, Route};
use super::keys::{xk, RawKey};
use crate::config::{Color, Config, ThemeConfig};
use crate::core::framebuffer::{SharedFramebuffer, BYTES_PER_PIXEL};
use crate::core::geometry::{Axis, DitherRegion, GeometryFacts, Viewport};
use crate::core::protocol::{ButtonMask, InputSink, SessionInfo};
use crate::core::session::SessionState;

/// Channel masks of the session pixel format: red, green, blue, alpha
const PIXEL_MASKS: [u32; 4] = [0x0000_00ff, 0x0000_ff00, 0x00ff_0000, 0];

const ROUTING_KEY: RawKey = '`' as RawKey;

const HELP: &[&str] = &[
    "============ LEFT HAND ============",
    "Esc   Disconnect and quit          ",
    "`     Toggle input to viewer/remote",
    "~     Click back-tick on remote    ",
    "wasd  Pan viewer                   ",
    "q/e   Zoom out/in                  ",
    "h     Toggle this help             ",
    "t     Toggle pointer marker        ",
    "============ RIGHT HAND ===========",
    "ijkl  Move mouse pointer           ",
    "u/o   Click L/R mouse button       ",
    "789   Toggle hold L/M/R button     ",
    "0     Click middle mouse button    ",
    "p     Zoom to mouse pointer        ",
    "=========== TOGGLE KEYS ===========",
    "z/m   Toggle hold L/R Control      ",
    "x/n   Toggle hold L/R Shift        ",
    "c/b   Toggle hold L/R Alt          ",
    "v     Toggle hold L Super          ",
];

const BUTTONS: [(ButtonMask, &str); 3] = [
    (ButtonMask::LEFT, "LMouse"),
    (ButtonMask::MIDDLE, "MMouse"),
    (ButtonMask::RIGHT, "RMouse"),
];

const MODIFIERS: [(HeldKeys, u32, &str); 7] = [
    (HeldKeys::CONTROL_L, xk::CONTROL_L, "LCtrl"),
    (HeldKeys::SHIFT_L, xk::SHIFT_L, "LShift"),
    (HeldKeys::ALT_L, xk::ALT_L, "LAlt"),
    (HeldKeys::SUPER_L, xk::SUPER_L, "LSuper"),
    (HeldKeys::ALT_R, xk::ALT_R, "RAlt"),
    (HeldKeys::SHIFT_R, xk::SHIFT_R, "RShift"),
    (HeldKeys::CONTROL_R, xk::CONTROL_R, "RCtrl"),
];

/// The interactive viewer of one session
pub struct Viewer<C: Canvas, S: InputSink> {
    canvas: C,
    sink: S,
    info: SessionInfo,
    state: Arc<SessionState>,
    framebuffer: SharedFramebuffer,
    viewport: Viewport,
    input: InputMachine,
    dither: Dither,
    /// Private copy of the framebuffer, refreshed when it changes
    snapshot: Vec<u8>,
    seen_generation: Option<u64>,
    frame_interval: Duration,
    theme: ThemeConfig,
    input_to_remote: bool,
    show_help: bool,
    show_pointer: bool,
    buttons: ButtonMask,
    held: HeldKeys,
}

impl<C: Canvas, S: InputSink> Viewer<C, S> {
    pub fn new(
        canvas: C,
        sink: S,
        info: SessionInfo,
        state: Arc<SessionState>,
        framebuffer: SharedFramebuffer,
        config: &Config,
    ) -> Result<Self, CanvasError> {
        let width = u32::from(info.width);
        let height = u32::from(info.height);
        let dither = Dither::new(
            32,
            width,
            height,
            width as usize * BYTES_PER_PIXEL,
            PIXEL_MASKS,
        )?;
        let frame_interval = config.viewer.frame_interval();
        let (cols, rows) = canvas.size();
        let facts = GeometryFacts::new(
            canvas.display_size(),
            (u32::from(cols), u32::from(rows)),
            (width, height),
        );

        Ok(Self {
            viewport: Viewport::new(&config.geometry, &facts),
            input: InputMachine::new(&config.input, frame_interval),
            canvas,
            sink,
            info,
            state,
            framebuffer,
            dither,
            snapshot: Vec::new(),
            seen_generation: None,
            frame_interval,
            theme: config.theme.clone(),
            input_to_remote: false,
            show_help: false,
            show_pointer: config.viewer.show_pointer,
            buttons: ButtonMask::empty(),
            held: HeldKeys::empty(),
        })
    }

    /// Run until the user quits or the display goes away.
    pub fn run(&mut self) -> Result<(), CanvasError> {
        self.canvas.set_title(&self.info.desktop_name);
        // Place the pointer at the centre with no buttons held
        self.send_pointer(ButtonMask::empty());
        self.redraw()?;

        loop {
            let event = self.canvas.wait_event(self.frame_interval)?;
            if self.handle_event(event, Instant::now())? {
                break;
            }
        }
        Ok(())
    }

    /// Process one event. Returns true when the viewer should stop.
    fn handle_event(&mut self, event: CanvasEvent, now: Instant) -> Result<bool, CanvasError> {
        match event {
            CanvasEvent::Quit => Ok(true),
            CanvasEvent::Timeout | CanvasEvent::Resize => {
                let actions = self.input.on_tick(now);
                if self.execute(actions)? {
                    return Ok(true);
                }
                self.redraw()?;
                Ok(false)
            }
            CanvasEvent::Key(key) => {
                let route = self.route(key);
                let actions = self.input.on_key(key, route, now);
                self.execute(actions)
            }
        }
    }

    /// Decide where a key goes
    fn route(&mut self, key: RawKey) -> Route {
        // Input never goes to the remote once disconnected
        if !self.state.is_connected() {
            self.input_to_remote = false;
        }
        if self.input_to_remote && key != ROUTING_KEY {
            Route::Remote
        } else {
            Route::Local
        }
    }

    /// Carry out actions. Returns true on quit.
    fn execute(&mut self, actions: Vec<Action>) -> Result<bool, CanvasError> {
        let mut needs_redraw = false;
        for action in actions {
            match action {
                Action::Remote(stroke) => self.send_key(stroke.keysym, stroke.down),
                Action::Command(command) => {
                    self.run_command(command);
                    needs_redraw |= command.redraws();
                }
                Action::Quit => return Ok(true),
                Action::Unmapped(key) => warn!("Unknown key {:#x} is not sent to the remote", key),
            }
        }
        if needs_redraw {
            self.redraw()?;
        }
        Ok(false)
    }

    fn run_command(&mut self, command: Command) {
        let facts = self.facts();
        match command {
            Command::ToggleRouting => {
                if self.state.is_connected() {
                    self.input_to_remote = !self.input_to_remote;
                }
            }
            Command::ClickBacktick => {
                self.send_key(u32::from(b'`'), true);
                self.send_key(u32::from(b'`'), false);
            }
            Command::ToggleHelp => self.show_help = !self.show_help,
            Command::Pan { dx, dy } => self.viewport.pan(dx, dy),
            Command::Zoom(delta) => self.viewport.set_zoom(&facts, delta),
            Command::ZoomToCursor => self.viewport.zoom_to_cursor(&facts),
            Command::MoveMouse { dx, dy } => {
                self.viewport.move_mouse(&facts, dx, dy);
                self.send_pointer(self.buttons);
            }
            Command::Click(button) => {
                self.send_pointer(self.buttons | button);
                self.send_pointer(self.buttons);
            }
            Command::ToggleButton(button) => {
                self.buttons.toggle(button);
                self.send_pointer(self.buttons);
            }
            Command::TogglePointer => self.show_pointer = !self.show_pointer,
            Command::ToggleModifier(modifier) => {
                self.held.toggle(modifier);
                let down = self.held.contains(modifier);
                if let Some(&(_, keysym, _)) = MODIFIERS.iter().find(|(m, _, _)| *m == modifier) {
                    self.send_key(keysym, down);
                }
            }
        }
    }

    fn send_key(&mut self, keysym: u32, down: bool) {
        if !self.state.is_connected() {
            debug!("Not connected, key {:#x} dropped", keysym);
            return;
        }
        if let Err(e) = self.sink.send_key(keysym, down) {
            warn!("Failed to send key {:#x}: {}", keysym, e);
        }
    }

    fn send_pointer(&mut self, buttons: ButtonMask) {
        if !self.state.is_connected() {
            return;
        }
        // The viewport keeps the pointer inside the framebuffer
        let (x, y) = self.viewport.mouse();
        if let Err(e) = self.sink.send_pointer(x as u16, y as u16, buttons) {
            warn!("Failed to send pointer event: {}", e);
        }
    }

    fn facts(&self) -> GeometryFacts {
        let (cols, rows) = self.canvas.size();
        GeometryFacts::new(
            self.canvas.display_size(),
            (u32::from(cols), u32::from(rows)),
            (u32::from(self.info.width), u32::from(self.info.height)),
        )
    }

    fn redraw(&mut self) -> Result<(), CanvasError> {
        let facts = self.facts();
        // The terminal may have been resized since the last frame
        self.viewport.set_zoom(&facts, 0);
        let region = self.viewport.dither_region(&facts);

        self.framebuffer
            .snapshot_into(&mut self.snapshot, &mut self.seen_generation);

        self.canvas.clear();
        self.canvas.draw_bitmap(&region, &self.dither, &self.snapshot);
        self.draw_status();
        if self.show_help {
            self.draw_help();
        }
        self.draw_pointer(&facts, &region);
        self.canvas.present()
    }

    fn status_style(&self) -> Style {
        Style::new(self.theme.status_fg, self.theme.status_bg)
    }

    fn status_text(&self) -> String {
        let mut status = format!("h:Help | {}:{}", self.info.host, self.info.port);
        if !self.state.is_connected() {
            status.push_str(" (Disconnected)");
        }
        status.push_str(" | ");
        status.push_str(if self.input_to_remote {
            "Input to remote (` to disengage)"
        } else {
            "Input to viewer"
        });

        let held: Vec<&str> = BUTTONS
            .iter()
            .filter(|(button, _)| self.buttons.contains(*button))
            .map(|(_, label)| *label)
            .chain(
                MODIFIERS
                    .iter()
                    .filter(|(modifier, _, _)| self.held.contains(*modifier))
                    .map(|(_, _, label)| *label),
            )
            .collect();
        if !held.is_empty() {
            status.push_str(" | Holding down: ");
            status.push_str(&held.join(" "));
        }

        if !self.info.desktop_name.is_empty() {
            status.push_str(" | ");
            status.push_str(&self.info.desktop_name);
        }
        status
    }

    fn draw_status(&mut self) {
        let (width, _) = self.canvas.size();
        let style = self.status_style();
        let text = self.status_text();
        self.canvas.fill(0, 0, i32::from(width), 1, ' ', style);
        self.canvas
            .put_str(0, 0, truncate_to_width(&text, width as usize), style);
    }

    fn draw_help(&mut self) {
        let style = self.status_style();
        for (i, line) in HELP.iter().enumerate() {
            self.canvas.put_str(0, 1 + i as i32, line, style);
        }
    }

    fn draw_pointer(&mut self, facts: &GeometryFacts, region: &DitherRegion) {
        let (mx, my) = self.viewport.mouse();
        let x = region.to_cell(facts, Axis::X, mx);
        let y = region.to_cell(facts, Axis::Y, my);
        let style = Style::new(self.theme.pointer, Color::new(0, 0, 0));
        if region.cursor_hard_to_see(facts) {
            self.canvas.fill(x - 1, y - 1, 3, 3, '█', style);
        } else if self.show_pointer {
            self.canvas.fill(x, y, 1, 1, '█', style);
        }
    }
}

/// Longest prefix of `text` that fits in `max` columns
fn truncate_to_width(text: &str, max: usize) -> &str {
    let mut width = 0;
    for (i, ch) in text.char_indices() {
        width += UnicodeWidthChar::width(ch).unwrap_or(0);
        if width > max {
            return &text[..i];
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::{ProtocolError, Result as ProtocolResult};
    use crate::ui::canvas::CellGrid;
    use crate::ui::keys::{KEY_ESCAPE, KEY_RETURN};
    use std::collections::VecDeque;

    struct ScriptedCanvas {
        grid: CellGrid,
        display: (u32, u32),
        events: VecDeque<CanvasEvent>,
        presented: usize,
    }

    impl ScriptedCanvas {
        fn new(events: Vec<CanvasEvent>) -> Self {
            Self {
                grid: CellGrid::new(80, 24),
                display: (800, 600),
                events: events.into(),
                presented: 0,
            }
        }
    }

    impl Canvas for ScriptedCanvas {
        fn grid(&self) -> &CellGrid {
            &self.grid
        }

        fn grid_mut(&mut self) -> &mut CellGrid {
            &mut self.grid
        }

        fn display_size(&self) -> (u32, u32) {
            self.display
        }

        fn present(&mut self) -> Result<(), CanvasError> {
            self.presented += 1;
            Ok(())
        }

        fn wait_event(&mut self, _timeout: Duration) -> Result<CanvasEvent, CanvasError> {
            Ok(self.events.pop_front().unwrap_or(CanvasEvent::Quit))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Key(u32, bool),
        Pointer(u16, u16, ButtonMask),
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<Sent>,
        fail: bool,
    }

    impl InputSink for RecordingSink {
        fn send_key(&mut self, keysym: u32, down: bool) -> ProtocolResult<()> {
            if self.fail {
                return Err(ProtocolError::Closed);
            }
            self.sent.push(Sent::Key(keysym, down));
            Ok(())
        }

        fn send_pointer(&mut self, x: u16, y: u16, buttons: ButtonMask) -> ProtocolResult<()> {
            if self.fail {
                return Err(ProtocolError::Closed);
            }
            self.sent.push(Sent::Pointer(x, y, buttons));
            Ok(())
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            host: "example".to_string(),
            port: 5901,
            width: 1024,
            height: 768,
            desktop_name: "desk".to_string(),
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        // Command spacing is covered by the input machine tests
        config.input.control_interval_ms = 0;
        config
    }

    fn viewer(events: Vec<CanvasEvent>) -> Viewer<ScriptedCanvas, RecordingSink> {
        let info = info();
        let fb = SharedFramebuffer::new(info.width, info.height);
        Viewer::new(
            ScriptedCanvas::new(events),
            RecordingSink::default(),
            info,
            Arc::new(SessionState::new()),
            fb,
            &config(),
        )
        .unwrap()
    }

    fn key(ch: char) -> CanvasEvent {
        CanvasEvent::Key(ch as RawKey)
    }

    fn feed(v: &mut Viewer<ScriptedCanvas, RecordingSink>, events: &[CanvasEvent], start: Instant) -> bool {
        for (i, event) in events.iter().enumerate() {
            let now = start + Duration::from_millis(10 * i as u64);
            if v.handle_event(*event, now).unwrap() {
                return true;
            }
        }
        false
    }

    #[test]
    fn test_run_syncs_pointer_and_draws() {
        let mut v = viewer(vec![CanvasEvent::Timeout, CanvasEvent::Timeout]);
        v.run().unwrap();
        assert_eq!(v.sink.sent, vec![Sent::Pointer(512, 384, ButtonMask::empty())]);
        // Initial frame plus one per timeout
        assert_eq!(v.canvas.presented, 3);
        let status = v.canvas.grid.row_text(0);
        assert!(status.starts_with("h:Help | example:5901 | Input to viewer | desk"));
    }

    #[test]
    fn test_zoom_redraws_immediately() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('e')], t0);
        assert_eq!(v.viewport.level(), 1);
        assert_eq!(v.canvas.presented, 1);

        // Help waits for the next tick
        feed(&mut v, &[key('h')], t0 + Duration::from_secs(1));
        assert!(v.show_help);
        assert_eq!(v.canvas.presented, 1);
        feed(&mut v, &[CanvasEvent::Timeout], t0 + Duration::from_secs(2));
        assert_eq!(v.canvas.presented, 2);
        assert!(v.canvas.grid.row_text(1).starts_with("============ LEFT HAND"));
    }

    #[test]
    fn test_routing_toggle_and_remote_keys() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('`'), key('a'), key('`'), key('a')], t0);
        // Only the 'a' typed while routed to the remote is sent
        assert_eq!(
            v.sink.sent,
            vec![Sent::Key(0x61, true), Sent::Key(0x61, false)]
        );
        assert!(!v.input_to_remote);
        // The second 'a' panned instead (no effect at level 0)
        assert_eq!(v.viewport.view(Axis::X), 0.5);
    }

    #[test]
    fn test_disconnect_forces_local() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('`')], t0);
        assert!(v.input_to_remote);

        v.state.mark_disconnected();
        feed(&mut v, &[key('e')], t0 + Duration::from_secs(1));
        assert!(!v.input_to_remote);
        assert_eq!(v.viewport.level(), 1);
        assert!(v.sink.sent.is_empty());

        // Routing cannot be re-enabled
        feed(&mut v, &[key('`')], t0 + Duration::from_secs(2));
        assert!(!v.input_to_remote);

        feed(&mut v, &[CanvasEvent::Timeout], t0 + Duration::from_secs(3));
        assert!(v.canvas.grid.row_text(0).contains("(Disconnected)"));
    }

    #[test]
    fn test_mouse_buttons_and_modifiers() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('l'), key('7'), key('u'), key('7'), key('z'), key('z')], t0);
        // Level 0 speed is 31px per step
        let x = 512 + 31;
        assert_eq!(
            v.sink.sent,
            vec![
                Sent::Pointer(x, 384, ButtonMask::empty()),
                Sent::Pointer(x, 384, ButtonMask::LEFT),
                Sent::Pointer(x, 384, ButtonMask::LEFT),
                Sent::Pointer(x, 384, ButtonMask::LEFT),
                Sent::Pointer(x, 384, ButtonMask::empty()),
                Sent::Key(xk::CONTROL_L, true),
                Sent::Key(xk::CONTROL_L, false),
            ]
        );
        assert!(v.held.is_empty());
        assert!(v.buttons.is_empty());
    }

    #[test]
    fn test_status_lists_held_controls() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('9'), key('m'), key('v')], t0);
        assert!(v
            .status_text()
            .contains("| Holding down: RMouse LSuper RCtrl"));
    }

    #[test]
    fn test_backtick_click() {
        let mut v = viewer(vec![]);
        feed(&mut v, &[key('~')], Instant::now());
        assert_eq!(v.sink.sent, vec![Sent::Key(0x60, true), Sent::Key(0x60, false)]);
    }

    #[test]
    fn test_escape_then_tick_quits() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        assert!(!v.handle_event(CanvasEvent::Key(KEY_ESCAPE), t0).unwrap());
        assert!(!v.handle_event(CanvasEvent::Timeout, t0 + Duration::from_millis(1)).unwrap());
        assert!(v
            .handle_event(CanvasEvent::Timeout, t0 + Duration::from_millis(150))
            .unwrap());
    }

    #[test]
    fn test_remote_escape_then_tick_sends_escape() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('`')], t0);
        v.handle_event(CanvasEvent::Key(KEY_ESCAPE), t0).unwrap();
        assert!(v.sink.sent.is_empty());
        v.handle_event(CanvasEvent::Timeout, t0 + Duration::from_millis(150))
            .unwrap();
        assert_eq!(
            v.sink.sent,
            vec![Sent::Key(xk::ESCAPE, true), Sent::Key(xk::ESCAPE, false)]
        );
    }

    #[test]
    fn test_unmapped_and_failed_sends_are_not_fatal() {
        let mut v = viewer(vec![]);
        let t0 = Instant::now();
        feed(&mut v, &[key('`'), CanvasEvent::Key(0x3042)], t0);
        assert!(v.sink.sent.is_empty());

        v.sink.fail = true;
        assert!(!v
            .handle_event(CanvasEvent::Key(KEY_RETURN), t0 + Duration::from_secs(1))
            .unwrap());
    }

    #[test]
    fn test_pointer_marker() {
        let mut v = viewer(vec![]);
        v.redraw().unwrap();
        // Unzoomed, the pointer is hard to see: 3x3 block around it
        let facts = v.facts();
        let region = v.viewport.dither_region(&facts);
        let x = region.to_cell(&facts, Axis::X, 512) as u16;
        let y = region.to_cell(&facts, Axis::Y, 384) as u16;
        for (dx, dy) in [(0, 0), (1, 1)] {
            assert_eq!(v.canvas.grid.cell(x - dx, y - dy).map(|c| c.ch), Some('█'));
        }

        // Deep zoom makes it visible; no marker unless toggled
        v.viewport.set_zoom(&facts, 15);
        v.redraw().unwrap();
        let region = v.viewport.dither_region(&facts);
        assert!(!region.cursor_hard_to_see(&facts));
        let x = region.to_cell(&facts, Axis::X, 512) as u16;
        let y = region.to_cell(&facts, Axis::Y, 384) as u16;
        assert_ne!(v.canvas.grid.cell(x, y).map(|c| c.ch), Some('█'));

        v.show_pointer = true;
        v.redraw().unwrap();
        assert_eq!(v.canvas.grid.cell(x, y).map(|c| c.ch), Some('█'));
    }

    #[test]
    fn test_truncate_to_width() {
        assert_eq!(truncate_to_width("abcdef", 4), "abcd");
        assert_eq!(truncate_to_width("日本語", 5), "日本");
        assert_eq!(truncate_to_width("short", 80), "short");
    }
}
