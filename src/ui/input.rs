//! Input disambiguation
//!
//! Raw key codes from the terminal are ambiguous in two ways that only timing
//! can resolve:
//!
//! - Alt+key arrives as Escape followed almost immediately by the key. An
//!   Escape is therefore never acted on at once; it is banked and resolved by
//!   the next key (Alt combination) or by a poll-loop tick (plain Escape).
//! - Ctrl+H/I/M/S share their codes with Backspace/Tab/Return/Pause, and some
//!   terminals send the plain key right after the control code. After sending
//!   the Ctrl combination, the matching plain key is swallowed once.
//!
//! Viewer commands are additionally rate limited so that key repeat during a
//! slow redraw does not pile up.
//!
//! [`InputMachine`] never reads the clock itself. Every call takes the time
//! of the event, so the timeline is fully under the caller's control.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::debug;

use super::keys::{
    ctrl_letter, to_keysym, xk, RawKey, KEY_BACKSPACE, KEY_ESCAPE, KEY_PAUSE, KEY_RETURN, KEY_TAB,
};
use crate::config::InputConfig;
use crate::core::protocol::ButtonMask;

bitflags! {
    /// Plain keys to swallow because they echo a Ctrl combination just sent
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct VoidNext: u8 {
        const BACKSPACE = 0b0001;
        const TAB       = 0b0010;
        const RETURN    = 0b0100;
        const PAUSE     = 0b1000;
    }
}

impl VoidNext {
    /// Flag armed by sending Ctrl+`letter`
    fn armed_by(letter: char) -> Option<Self> {
        match letter {
            'h' => Some(Self::BACKSPACE),
            'i' => Some(Self::TAB),
            'm' => Some(Self::RETURN),
            's' => Some(Self::PAUSE),
            _ => None,
        }
    }

    /// Flag that would swallow `key`
    fn voided_by(key: RawKey) -> Option<Self> {
        match key {
            KEY_BACKSPACE => Some(Self::BACKSPACE),
            KEY_TAB => Some(Self::TAB),
            KEY_RETURN => Some(Self::RETURN),
            KEY_PAUSE => Some(Self::PAUSE),
            _ => None,
        }
    }
}

bitflags! {
    /// Modifier keys the viewer holds down on the remote side
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HeldKeys: u8 {
        const CONTROL_L = 0b0000_0001;
        const CONTROL_R = 0b0000_0010;
        const SHIFT_L   = 0b0000_0100;
        const SHIFT_R   = 0b0000_1000;
        const ALT_L     = 0b0001_0000;
        const ALT_R     = 0b0010_0000;
        const SUPER_L   = 0b0100_0000;
    }
}

/// State of one Escape bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EscapeBank {
    #[default]
    Idle,
    AwaitingCombo { since: Instant },
}

/// Rejects commands arriving closer together than `floor`
#[derive(Debug, Clone)]
pub struct RateLimiter {
    floor: Duration,
    last_accepted: Option<Instant>,
}

impl RateLimiter {
    pub fn new(floor: Duration) -> Self {
        Self {
            floor,
            last_accepted: None,
        }
    }

    /// Accept or reject an event at `now`. Rejections leave the timestamp
    /// alone.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_accepted {
            if now.saturating_duration_since(last) < self.floor {
                return false;
            }
        }
        self.last_accepted = Some(now);
        true
    }
}

/// Where a key goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Remote,
    Local,
}

/// One key event for the remote side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStroke {
    pub keysym: u32,
    pub down: bool,
}

impl KeyStroke {
    pub fn press(keysym: u32) -> Self {
        Self { keysym, down: true }
    }

    pub fn release(keysym: u32) -> Self {
        Self { keysym, down: false }
    }
}

/// Viewer commands bound to keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ToggleRouting,
    /// Send a back-tick, which otherwise toggles routing
    ClickBacktick,
    ToggleHelp,
    Pan { dx: i32, dy: i32 },
    Zoom(i32),
    ZoomToCursor,
    MoveMouse { dx: i32, dy: i32 },
    Click(ButtonMask),
    ToggleButton(ButtonMask),
    TogglePointer,
    ToggleModifier(HeldKeys),
}

impl Command {
    /// Look up the command bound to `key`. Letters match in either case.
    pub fn from_key(key: RawKey) -> Option<Self> {
        let ch = char::from_u32(key)?.to_ascii_lowercase();
        let command = match ch {
            '`' => Self::ToggleRouting,
            '~' => Self::ClickBacktick,
            'h' => Self::ToggleHelp,
            // Left hand
            'w' => Self::Pan { dx: 0, dy: -1 },
            'a' => Self::Pan { dx: -1, dy: 0 },
            's' => Self::Pan { dx: 0, dy: 1 },
            'd' => Self::Pan { dx: 1, dy: 0 },
            'q' => Self::Zoom(-1),
            'e' => Self::Zoom(1),
            'z' => Self::ToggleModifier(HeldKeys::CONTROL_L),
            'x' => Self::ToggleModifier(HeldKeys::SHIFT_L),
            'c' => Self::ToggleModifier(HeldKeys::ALT_L),
            'v' => Self::ToggleModifier(HeldKeys::SUPER_L),
            't' => Self::TogglePointer,
            // Right hand
            'i' => Self::MoveMouse { dx: 0, dy: -1 },
            'j' => Self::MoveMouse { dx: -1, dy: 0 },
            'k' => Self::MoveMouse { dx: 0, dy: 1 },
            'l' => Self::MoveMouse { dx: 1, dy: 0 },
            'u' => Self::Click(ButtonMask::LEFT),
            'o' => Self::Click(ButtonMask::RIGHT),
            '0' => Self::Click(ButtonMask::MIDDLE),
            '7' => Self::ToggleButton(ButtonMask::LEFT),
            '8' => Self::ToggleButton(ButtonMask::MIDDLE),
            '9' => Self::ToggleButton(ButtonMask::RIGHT),
            'p' => Self::ZoomToCursor,
            'm' => Self::ToggleModifier(HeldKeys::CONTROL_R),
            'n' => Self::ToggleModifier(HeldKeys::SHIFT_R),
            'b' => Self::ToggleModifier(HeldKeys::ALT_R),
            _ => return None,
        };
        Some(command)
    }

    /// Whether the view changed enough to redraw right away
    pub fn redraws(&self) -> bool {
        matches!(self, Self::Pan { .. } | Self::Zoom(_) | Self::ZoomToCursor)
    }
}

/// Outcome of feeding an event to the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Remote(KeyStroke),
    Command(Command),
    Quit,
    /// No keysym exists for this code; nothing was sent
    Unmapped(RawKey),
}

/// Timing state for both input paths
#[derive(Debug)]
pub struct InputMachine {
    combo_window: Duration,
    grace: Duration,
    remote_escape: EscapeBank,
    local_escape: EscapeBank,
    void_next: VoidNext,
    limiter: RateLimiter,
}

impl InputMachine {
    /// `grace` is how long a banked Escape waits before standing on its own;
    /// the poll loop passes its frame interval.
    pub fn new(config: &InputConfig, grace: Duration) -> Self {
        Self {
            combo_window: config.combo_window(),
            grace,
            remote_escape: EscapeBank::Idle,
            local_escape: EscapeBank::Idle,
            void_next: VoidNext::empty(),
            limiter: RateLimiter::new(config.control_interval()),
        }
    }

    pub fn escape_bank(&self, route: Route) -> EscapeBank {
        match route {
            Route::Remote => self.remote_escape,
            Route::Local => self.local_escape,
        }
    }

    pub fn void_next(&self) -> VoidNext {
        self.void_next
    }

    /// Handle a key event at `now`
    pub fn on_key(&mut self, key: RawKey, route: Route, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        // The echo of a Ctrl combination can only be the very next event
        let armed = std::mem::take(&mut self.void_next);
        if let Some(flag) = VoidNext::voided_by(key) {
            if armed.contains(flag) {
                debug!("Swallowed key {:#x} following its Ctrl combination", key);
                return actions;
            }
        }

        match route {
            Route::Remote => self.remote_key(key, now, &mut actions),
            Route::Local => self.local_key(key, now, &mut actions),
        }
        actions
    }

    /// Handle a poll-loop tick: resolve Escapes nobody followed up on
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        self.void_next = VoidNext::empty();

        if let EscapeBank::AwaitingCombo { since } = self.remote_escape {
            if now.saturating_duration_since(since) >= self.grace {
                self.remote_escape = EscapeBank::Idle;
                click(xk::ESCAPE, &mut actions);
            }
        }
        if let EscapeBank::AwaitingCombo { since } = self.local_escape {
            if now.saturating_duration_since(since) >= self.grace {
                self.local_escape = EscapeBank::Idle;
                actions.push(Action::Quit);
            }
        }
        actions
    }

    fn within_combo(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) <= self.combo_window
    }

    fn remote_key(&mut self, key: RawKey, now: Instant, actions: &mut Vec<Action>) {
        if let EscapeBank::AwaitingCombo { since } = std::mem::take(&mut self.remote_escape) {
            if self.within_combo(since, now) {
                // Alt is only sent around a key the remote can receive
                if ctrl_letter(key).is_none() && to_keysym(key).is_none() {
                    actions.push(Action::Unmapped(key));
                    return;
                }
                // Alt + key
                actions.push(Action::Remote(KeyStroke::press(xk::ALT_L)));
                self.forward(key, actions);
                actions.push(Action::Remote(KeyStroke::release(xk::ALT_L)));
                return;
            }
            // Too late for a combination: the Escape was meant on its own
            click(xk::ESCAPE, actions);
        }

        if key == KEY_ESCAPE {
            self.remote_escape = EscapeBank::AwaitingCombo { since: now };
            return;
        }
        self.forward(key, actions);
    }

    /// Translate and send a key, spelling out Ctrl combinations
    fn forward(&mut self, key: RawKey, actions: &mut Vec<Action>) {
        if let Some(letter) = ctrl_letter(key) {
            actions.push(Action::Remote(KeyStroke::press(xk::CONTROL_L)));
            click(letter as u32, actions);
            actions.push(Action::Remote(KeyStroke::release(xk::CONTROL_L)));
            if let Some(flag) = VoidNext::armed_by(letter) {
                self.void_next |= flag;
            }
            return;
        }
        match to_keysym(key) {
            Some(keysym) => click(keysym, actions),
            None => actions.push(Action::Unmapped(key)),
        }
    }

    fn local_key(&mut self, key: RawKey, now: Instant, actions: &mut Vec<Action>) {
        if let EscapeBank::AwaitingCombo { since } = std::mem::take(&mut self.local_escape) {
            if !self.within_combo(since, now) {
                actions.push(Action::Quit);
                return;
            }
            // An Alt combination typed at the viewer: not a request to quit
        }

        if key == KEY_ESCAPE {
            self.local_escape = EscapeBank::AwaitingCombo { since: now };
            return;
        }

        let Some(command) = Command::from_key(key) else {
            debug!("Key {:#x} has no viewer binding", key);
            return;
        };
        if self.limiter.try_accept(now) {
            actions.push(Action::Command(command));
        } else {
            debug!("Rate limited viewer command {:?}", command);
        }
    }
}

fn click(keysym: u32, actions: &mut Vec<Action>) {
    actions.push(Action::Remote(KeyStroke::press(keysym)));
    actions.push(Action::Remote(KeyStroke::release(keysym)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(100);

    fn machine() -> InputMachine {
        InputMachine::new(&InputConfig::default(), FRAME)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn us(n: u64) -> Duration {
        Duration::from_micros(n)
    }

    fn strokes(actions: &[Action]) -> Vec<(u32, bool)> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Remote(k) => Some((k.keysym, k.down)),
                _ => None,
            })
            .collect()
    }

    fn ctrl_combo(letter: char) -> Vec<(u32, bool)> {
        vec![
            (xk::CONTROL_L, true),
            (letter as u32, true),
            (letter as u32, false),
            (xk::CONTROL_L, false),
        ]
    }

    #[test]
    fn test_plain_key_forwarded() {
        let mut m = machine();
        let t0 = Instant::now();
        let actions = m.on_key('a' as u32, Route::Remote, t0);
        assert_eq!(strokes(&actions), vec![(0x61, true), (0x61, false)]);
    }

    #[test]
    fn test_unmapped_key_dropped() {
        let mut m = machine();
        let actions = m.on_key(0x3042, Route::Remote, Instant::now());
        assert_eq!(actions, vec![Action::Unmapped(0x3042)]);
    }

    #[test]
    fn test_alt_with_unmapped_key_sends_nothing() {
        let mut m = machine();
        let t0 = Instant::now();
        assert!(m.on_key(KEY_ESCAPE, Route::Remote, t0).is_empty());
        let actions = m.on_key(0x3042, Route::Remote, t0 + us(300));
        assert_eq!(actions, vec![Action::Unmapped(0x3042)]);
        assert_eq!(m.escape_bank(Route::Remote), EscapeBank::Idle);
        // Nothing left to fire on the next tick either
        assert!(m.on_tick(t0 + FRAME * 2).is_empty());
    }

    #[test]
    fn test_ctrl_collisions_void_once() {
        let cases = [
            (8, 'h', KEY_BACKSPACE, VoidNext::BACKSPACE),
            (9, 'i', KEY_TAB, VoidNext::TAB),
            (13, 'm', KEY_RETURN, VoidNext::RETURN),
            (19, 's', KEY_PAUSE, VoidNext::PAUSE),
        ];
        for (code, letter, echo, flag) in cases {
            let mut m = machine();
            let t0 = Instant::now();

            let actions = m.on_key(code, Route::Remote, t0);
            assert_eq!(strokes(&actions), ctrl_combo(letter));
            assert_eq!(m.void_next(), flag);

            // The echo is swallowed exactly once
            assert!(m.on_key(echo, Route::Remote, t0 + ms(1)).is_empty());
            assert!(m.void_next().is_empty());
            let actions = m.on_key(echo, Route::Remote, t0 + ms(2));
            assert_eq!(strokes(&actions).len(), 2);
        }
    }

    #[test]
    fn test_other_ctrl_letters_arm_nothing() {
        let mut m = machine();
        let actions = m.on_key(3, Route::Remote, Instant::now());
        assert_eq!(strokes(&actions), ctrl_combo('c'));
        assert!(m.void_next().is_empty());
    }

    #[test]
    fn test_return_does_not_clear_pause() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(19, Route::Remote, t0);
        // Return is not the echo of Ctrl+S: forwarded, and the flag is gone
        let actions = m.on_key(KEY_RETURN, Route::Remote, t0 + ms(1));
        assert_eq!(strokes(&actions), vec![(xk::RETURN, true), (xk::RETURN, false)]);
        assert!(m.void_next().is_empty());
    }

    #[test]
    fn test_non_matching_key_disarms() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(8, Route::Remote, t0);
        let actions = m.on_key('x' as u32, Route::Remote, t0 + ms(1));
        assert_eq!(strokes(&actions), vec![('x' as u32, true), ('x' as u32, false)]);
        // A later deliberate Backspace goes through
        let actions = m.on_key(KEY_BACKSPACE, Route::Remote, t0 + ms(500));
        assert_eq!(strokes(&actions), vec![(xk::BACKSPACE, true), (xk::BACKSPACE, false)]);
    }

    #[test]
    fn test_tick_disarms_void_flags() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(13, Route::Remote, t0);
        m.on_tick(t0 + FRAME);
        assert!(m.void_next().is_empty());
        let actions = m.on_key(KEY_RETURN, Route::Remote, t0 + FRAME + ms(1));
        assert_eq!(strokes(&actions).len(), 2);
    }

    #[test]
    fn test_escape_combo_sends_alt() {
        let mut m = machine();
        let t0 = Instant::now();
        assert!(m.on_key(KEY_ESCAPE, Route::Remote, t0).is_empty());
        assert_eq!(
            m.escape_bank(Route::Remote),
            EscapeBank::AwaitingCombo { since: t0 }
        );

        let actions = m.on_key('f' as u32, Route::Remote, t0 + us(500));
        assert_eq!(
            strokes(&actions),
            vec![
                (xk::ALT_L, true),
                ('f' as u32, true),
                ('f' as u32, false),
                (xk::ALT_L, false),
            ]
        );
        assert_eq!(m.escape_bank(Route::Remote), EscapeBank::Idle);

        // Nothing left for the tick
        assert!(m.on_tick(t0 + FRAME * 2).is_empty());
    }

    #[test]
    fn test_lone_escape_fires_on_tick() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Remote, t0);

        // Grace period not over yet
        assert!(m.on_tick(t0 + ms(50)).is_empty());

        let actions = m.on_tick(t0 + FRAME);
        assert_eq!(strokes(&actions), vec![(xk::ESCAPE, true), (xk::ESCAPE, false)]);
        assert!(m.on_tick(t0 + FRAME * 2).is_empty());
    }

    #[test]
    fn test_late_key_resolves_escape_first() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Remote, t0);
        let actions = m.on_key('a' as u32, Route::Remote, t0 + ms(30));
        assert_eq!(
            strokes(&actions),
            vec![
                (xk::ESCAPE, true),
                (xk::ESCAPE, false),
                ('a' as u32, true),
                ('a' as u32, false),
            ]
        );
        assert_eq!(m.escape_bank(Route::Remote), EscapeBank::Idle);
    }

    #[test]
    fn test_alt_ctrl_combination() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Remote, t0);
        let actions = m.on_key(3, Route::Remote, t0 + us(100));
        let mut expected = vec![(xk::ALT_L, true)];
        expected.extend(ctrl_combo('c'));
        expected.push((xk::ALT_L, false));
        assert_eq!(strokes(&actions), expected);
    }

    #[test]
    fn test_local_escape_quits_on_tick() {
        let mut m = machine();
        let t0 = Instant::now();
        assert!(m.on_key(KEY_ESCAPE, Route::Local, t0).is_empty());
        assert!(m.on_tick(t0 + ms(10)).is_empty());
        assert_eq!(m.on_tick(t0 + FRAME), vec![Action::Quit]);
    }

    #[test]
    fn test_local_alt_combo_does_not_quit() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Local, t0);
        let actions = m.on_key('e' as u32, Route::Local, t0 + us(800));
        assert_eq!(actions, vec![Action::Command(Command::Zoom(1))]);
        assert!(m.on_tick(t0 + FRAME * 2).is_empty());
    }

    #[test]
    fn test_local_late_key_quits() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Local, t0);
        assert_eq!(m.on_key('w' as u32, Route::Local, t0 + ms(20)), vec![Action::Quit]);
    }

    #[test]
    fn test_escape_banks_are_independent() {
        let mut m = machine();
        let t0 = Instant::now();
        m.on_key(KEY_ESCAPE, Route::Local, t0);
        assert_eq!(m.escape_bank(Route::Remote), EscapeBank::Idle);
        m.on_key(KEY_ESCAPE, Route::Remote, t0 + ms(1));
        let actions = m.on_tick(t0 + FRAME + ms(1));
        assert_eq!(actions.len(), 3);
        assert!(actions.contains(&Action::Quit));
        assert_eq!(strokes(&actions), vec![(xk::ESCAPE, true), (xk::ESCAPE, false)]);
    }

    #[test]
    fn test_rate_limit_burst() {
        let mut m = machine();
        let t0 = Instant::now();
        let accepted: usize = (0..10)
            .map(|i| m.on_key('d' as u32, Route::Local, t0 + ms(i * 5)).len())
            .sum();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_rate_limit_spaced() {
        let mut m = machine();
        let t0 = Instant::now();
        let accepted: usize = (0..10)
            .map(|i| m.on_key('d' as u32, Route::Local, t0 + ms(i * 120)).len())
            .sum();
        assert_eq!(accepted, 10);
    }

    #[test]
    fn test_rejections_do_not_extend_floor() {
        let mut limiter = RateLimiter::new(ms(100));
        let t0 = Instant::now();
        assert!(limiter.try_accept(t0));
        assert!(!limiter.try_accept(t0 + ms(60)));
        assert!(!limiter.try_accept(t0 + ms(99)));
        assert!(limiter.try_accept(t0 + ms(100)));
    }

    #[test]
    fn test_escape_exempt_from_rate_limit() {
        let mut m = machine();
        let t0 = Instant::now();
        assert_eq!(m.on_key('h' as u32, Route::Local, t0).len(), 1);
        m.on_key(KEY_ESCAPE, Route::Local, t0 + ms(1));
        assert_eq!(m.on_tick(t0 + ms(1) + FRAME), vec![Action::Quit]);
    }

    #[test]
    fn test_keymap() {
        assert_eq!(Command::from_key('W' as u32), Some(Command::Pan { dx: 0, dy: -1 }));
        assert_eq!(Command::from_key('q' as u32), Some(Command::Zoom(-1)));
        assert_eq!(Command::from_key('`' as u32), Some(Command::ToggleRouting));
        assert_eq!(
            Command::from_key('9' as u32),
            Some(Command::ToggleButton(ButtonMask::RIGHT))
        );
        assert_eq!(
            Command::from_key('N' as u32),
            Some(Command::ToggleModifier(HeldKeys::SHIFT_R))
        );
        assert_eq!(Command::from_key('g' as u32), None);
        assert_eq!(Command::from_key(KEY_RETURN), None);

        assert!(Command::Zoom(1).redraws());
        assert!(Command::ZoomToCursor.redraws());
        assert!(!Command::ToggleHelp.redraws());
        assert!(!Command::MoveMouse { dx: 1, dy: 0 }.redraws());
    }
}
