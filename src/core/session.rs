//! Session management
//!
//! Owns the connection-liveness flag and runs the protocol I/O thread that
//! keeps the shared framebuffer up to date.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn, Dispatch};

use super::framebuffer::SharedFramebuffer;
use super::protocol::{Interrupter, MessageSource};

/// Flags shared between the UI thread and the I/O thread
#[derive(Debug)]
pub struct SessionState {
    /// Cleared exactly once, on I/O failure or teardown
    connected: AtomicBool,
    /// Raised by teardown, observed by the I/O thread
    cancelled: AtomicBool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Clear the liveness flag. Returns true only for the call that
    /// actually performed the transition.
    pub fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A live connection: liveness flags, framebuffer and the I/O thread
pub struct Connection {
    state: Arc<SessionState>,
    framebuffer: SharedFramebuffer,
    interrupter: Option<Interrupter>,
    io_thread: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start pumping messages from `source` on a dedicated thread.
    ///
    /// Log events from the thread go to `dispatch`.
    pub fn spawn<S: MessageSource>(
        source: S,
        framebuffer: SharedFramebuffer,
        poll_timeout: Duration,
        dispatch: Dispatch,
    ) -> io::Result<Self> {
        let state = Arc::new(SessionState::new());
        let interrupter = source.interrupter();

        let thread_state = state.clone();
        let thread_fb = framebuffer.clone();
        let io_thread = thread::Builder::new()
            .name("headmore-io".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    io_loop(source, thread_fb, thread_state, poll_timeout)
                })
            })?;

        Ok(Self {
            state,
            framebuffer,
            interrupter,
            io_thread: Some(io_thread),
        })
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn framebuffer(&self) -> &SharedFramebuffer {
        &self.framebuffer
    }

    /// Stop the I/O thread and wait for it to exit.
    ///
    /// Order matters: cancel, unblock, join. Only after the join may the
    /// framebuffer be released, since the thread writes into it.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.io_thread.take() else {
            return;
        };
        self.state.cancel();
        self.state.mark_disconnected();
        if let Some(interrupt) = self.interrupter.take() {
            interrupt();
        }
        if handle.join().is_err() {
            error!("Failed to join the protocol I/O thread");
        }
        info!("Connection has been terminated");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Clears the liveness flag when the I/O thread exits, panics included
struct LivenessGuard {
    state: Arc<SessionState>,
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("Protocol I/O thread panicked");
        }
        if self.state.mark_disconnected() {
            warn!("Connection lost, input is now limited to viewer controls");
        }
    }
}

/// Process server messages until cancelled or the connection fails
fn io_loop<S: MessageSource>(
    mut source: S,
    framebuffer: SharedFramebuffer,
    state: Arc<SessionState>,
    poll_timeout: Duration,
) {
    let _guard = LivenessGuard {
        state: state.clone(),
    };
    debug!("Protocol I/O loop started");
    loop {
        // First check if we should stop
        if state.is_cancelled() {
            debug!("Protocol I/O loop cancelled");
            break;
        }

        let result = match source.poll_message(poll_timeout) {
            Ok(None) => continue,
            Ok(Some(message)) => source.dispatch(message, &framebuffer),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            // An interrupted read during teardown is not a failure
            if state.is_cancelled() {
                debug!("Protocol I/O loop interrupted: {}", e);
                break;
            }
            error!("Error has occurred in the protocol I/O loop: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::framebuffer::BYTES_PER_PIXEL;
    use crate::core::protocol::{ProtocolError, Result};
    use std::collections::VecDeque;
    use std::time::Instant;

    enum Step {
        Paint(u8),
        PaintOutside,
        Fail,
        Panic,
    }

    struct ScriptedSource {
        script: VecDeque<Step>,
        interrupted: Option<Arc<AtomicBool>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                script: steps.into(),
                interrupted: None,
            }
        }
    }

    impl MessageSource for ScriptedSource {
        type Message = Step;

        fn poll_message(&mut self, timeout: Duration) -> Result<Option<Step>> {
            match self.script.pop_front() {
                Some(Step::Fail) => Err(ProtocolError::Closed),
                Some(step) => Ok(Some(step)),
                None => {
                    thread::sleep(timeout.min(Duration::from_millis(2)));
                    Ok(None)
                }
            }
        }

        fn dispatch(&mut self, message: Step, framebuffer: &SharedFramebuffer) -> Result<()> {
            match message {
                Step::Paint(v) => {
                    let data = vec![v; 2 * 2 * BYTES_PER_PIXEL];
                    framebuffer.update(|fb| fb.put_rect(0, 0, 2, 2, &data))?;
                }
                Step::PaintOutside => {
                    framebuffer.update(|fb| fb.put_rect(1, 1, 2, 2, &[0; 16]))?;
                }
                Step::Panic => panic!("scripted panic"),
                Step::Fail => unreachable!(),
            }
            Ok(())
        }

        fn interrupter(&self) -> Option<Interrupter> {
            let flag = self.interrupted.clone()?;
            Some(Box::new(move || flag.store(true, Ordering::SeqCst)))
        }
    }

    fn spawn(source: ScriptedSource) -> Connection {
        Connection::spawn(
            source,
            SharedFramebuffer::new(2, 2),
            Duration::from_millis(10),
            Dispatch::none(),
        )
        .unwrap()
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_mark_disconnected_once() {
        let state = SessionState::new();
        assert!(state.is_connected());
        assert!(state.mark_disconnected());
        assert!(!state.mark_disconnected());
        assert!(!state.is_connected());
    }

    #[test]
    fn test_updates_then_failure() {
        let mut conn = spawn(ScriptedSource::new(vec![Step::Paint(1), Step::Paint(2), Step::Fail]));
        assert!(wait_until(|| !conn.is_connected()));
        assert_eq!(conn.framebuffer().generation(), 2);

        let mut out = Vec::new();
        conn.framebuffer().snapshot_into(&mut out, &mut None);
        assert!(out.iter().all(|b| *b == 2));
        assert!(!conn.state().is_cancelled());
        conn.shutdown();
    }

    #[test]
    fn test_dispatch_failure_disconnects() {
        let conn = spawn(ScriptedSource::new(vec![Step::PaintOutside, Step::Paint(7)]));
        assert!(wait_until(|| !conn.is_connected()));
        // The loop stopped at the failing update, which published nothing
        thread::sleep(Duration::from_millis(20));
        assert_eq!(conn.framebuffer().generation(), 0);
    }

    #[test]
    fn test_panicking_source_disconnects() {
        let mut conn = spawn(ScriptedSource::new(vec![Step::Paint(3), Step::Panic]));
        // The thread dies on its own; no teardown has happened yet
        assert!(wait_until(|| !conn.is_connected()));
        assert!(!conn.state().is_cancelled());
        assert_eq!(conn.framebuffer().generation(), 1);
        conn.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_idle_loop() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut source = ScriptedSource::new(vec![]);
        source.interrupted = Some(flag.clone());

        let mut conn = spawn(source);
        thread::sleep(Duration::from_millis(20));
        assert!(conn.is_connected());

        conn.shutdown();
        assert!(conn.state().is_cancelled());
        assert!(!conn.is_connected());
        assert!(flag.load(Ordering::SeqCst));
        // Second shutdown is a no-op
        conn.shutdown();
    }

    #[test]
    fn test_shutdown_survives_panicked_thread() {
        let mut conn = spawn(ScriptedSource::new(vec![Step::Panic]));
        thread::sleep(Duration::from_millis(20));
        conn.shutdown();
        assert!(!conn.is_connected());
    }
}
