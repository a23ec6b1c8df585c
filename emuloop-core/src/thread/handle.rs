//! Thread handle - state machine shared by callers and the execution thread
//!
//! Execution State and Saved State live under one mutex/condvar pair. Every
//! transition stores a lock-free mirror of the state (read by the execution
//! thread between steps and by sync waiters) and wakes both the state
//! condvar and the frame sync, in that lock order.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::state::ExecutionState;
use crate::config::LogLevel;
use crate::logging::ThreadLogger;
use crate::sync::FrameSync;

thread_local! {
    static CURRENT: RefCell<Option<ThreadHandle>> = const { RefCell::new(None) };
}

pub(super) struct ControlState {
    pub(super) state: ExecutionState,
    /// State restored by the final `resume`
    pub(super) saved_state: ExecutionState,
    /// State restored after a `RunOn` function completes
    pub(super) run_on_return: ExecutionState,
    pub(super) interrupt_depth: u32,
    /// Video gating to restore on unpause
    pub(super) frame_was_on: bool,
    /// An execution thread exists (spawned and not yet finished)
    pub(super) thread_live: bool,
    /// The execution thread has left its loop
    pub(super) exit_observed: bool,
    pub(super) thread_id: Option<ThreadId>,
}

pub(super) struct HandleInner {
    pub(super) control: Mutex<ControlState>,
    pub(super) cond: Condvar,
    hint: AtomicU8,
    pub(super) frame: AtomicU64,
    pub(super) sync: FrameSync,
    pub(super) logger: ThreadLogger,
}

/// Cloneable handle to a controller's state machine.
///
/// Every operation is safe from any thread. Blocking operations never block
/// when called from the execution thread itself; they record the request and
/// let the thread act on it at its next safe point.
#[derive(Clone)]
pub struct ThreadHandle {
    pub(super) inner: Arc<HandleInner>,
}

type Guard<'a> = MutexGuard<'a, ControlState>;

impl ThreadHandle {
    pub(super) fn new(sync: FrameSync, logger: ThreadLogger) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                control: Mutex::new(ControlState {
                    state: ExecutionState::Initialized,
                    saved_state: ExecutionState::Initialized,
                    run_on_return: ExecutionState::Initialized,
                    interrupt_depth: 0,
                    frame_was_on: true,
                    thread_live: false,
                    exit_observed: false,
                    thread_id: None,
                }),
                cond: Condvar::new(),
                hint: AtomicU8::new(ExecutionState::Initialized as u8),
                frame: AtomicU64::new(0),
                sync,
                logger,
            }),
        }
    }

    /// Handle of the controller whose execution thread is calling, if any
    pub fn current() -> Option<ThreadHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(super) fn set_current(handle: Option<ThreadHandle>) {
        CURRENT.with(|current| *current.borrow_mut() = handle);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn state(&self) -> ExecutionState {
        self.inner.control.lock().state
    }

    /// Lock-free view of the state, possibly a transition behind
    pub(super) fn hint(&self) -> ExecutionState {
        ExecutionState::from_u8(self.inner.hint.load(Ordering::Acquire))
    }

    pub fn has_started(&self) -> bool {
        self.state() != ExecutionState::Initialized
    }

    pub fn has_exited(&self) -> bool {
        self.state().has_exited()
    }

    pub fn has_crashed(&self) -> bool {
        self.state() == ExecutionState::Crashed
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn interrupt_depth(&self) -> u32 {
        self.inner.control.lock().interrupt_depth
    }

    /// Frames completed since start or the last reset
    pub fn frame_count(&self) -> u64 {
        self.inner.frame.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        Self::paused_locked(&self.inner.control.lock())
    }

    pub fn logger(&self) -> &ThreadLogger {
        &self.inner.logger
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.logger.set_log_level(level);
    }

    /// Frame sync shared with the consumer
    pub fn sync(&self) -> &FrameSync {
        &self.inner.sync
    }

    /// True when called on this controller's execution thread
    pub fn is_execution_thread(&self) -> bool {
        Self::on_exec_thread(&self.inner.control.lock())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Move to `Crashed` from anything but `Shutdown`
    pub fn mark_crashed(&self) {
        let mut control = self.inner.control.lock();
        if matches!(
            control.state,
            ExecutionState::Shutdown | ExecutionState::Crashed
        ) {
            return;
        }
        self.inner
            .logger
            .error(format_args!("Execution thread crashed in state {:?}", control.state));
        self.set_state(&mut control, ExecutionState::Crashed);
    }

    /// Request orderly shutdown.
    ///
    /// Idempotent. Off the execution thread, returns once the thread has
    /// observed the request; use `join` to wait for it to finish.
    pub fn end(&self) {
        let mut control = self.inner.control.lock();
        if !control.thread_live && control.state == ExecutionState::Initialized {
            self.set_state(&mut control, ExecutionState::Shutdown);
            return;
        }
        if !control.state.is_ending() {
            self.inner.logger.debug(format_args!(
                "End requested in state {:?} (interrupt depth {})",
                control.state, control.interrupt_depth
            ));
            control.interrupt_depth = 0;
            self.set_state(&mut control, ExecutionState::Exiting);
            self.inner.sync.set_frame_on(false);
        }
        if !Self::on_exec_thread(&control) {
            while control.thread_live && !control.exit_observed {
                self.inner.cond.wait(&mut control);
            }
        }
    }

    /// Block until the execution thread has finished (no-op if none)
    pub(super) fn wait_for_exit(&self) {
        let mut control = self.inner.control.lock();
        if Self::on_exec_thread(&control) {
            self.inner
                .logger
                .warn(format_args!("join called from the execution thread"));
            return;
        }
        while control.thread_live {
            self.inner.cond.wait(&mut control);
        }
    }

    // ========================================================================
    // Interrupt / Continue
    // ========================================================================

    /// Suspend the execution thread and wait until it is `Interrupted`.
    ///
    /// Nests; each call needs a matching [`ThreadHandle::resume`]. Called on
    /// the execution thread this behaves like `interrupt_from_thread`.
    pub fn interrupt(&self) {
        let mut control = self.inner.control.lock();
        if Self::on_exec_thread(&control) {
            self.interrupt_locked(&mut control);
            return;
        }
        self.wait_stable(&mut control);
        if self.interrupt_locked(&mut control) {
            while control.state == ExecutionState::Interrupting && control.thread_live {
                self.inner.cond.wait(&mut control);
            }
        }
    }

    /// Interrupt requested by the execution thread on itself; never blocks
    pub fn interrupt_from_thread(&self) {
        let mut control = self.inner.control.lock();
        self.interrupt_locked(&mut control);
    }

    /// Returns true if the thread now has to acknowledge an interruption
    fn interrupt_locked(&self, control: &mut Guard<'_>) -> bool {
        control.interrupt_depth += 1;
        if control.interrupt_depth > 1 {
            return control.state == ExecutionState::Interrupting;
        }
        if !control.state.is_active() {
            return false;
        }
        control.saved_state = control.state;
        self.set_state(control, ExecutionState::Interrupting);
        true
    }

    /// Undo one `interrupt`; the last one restores the Saved State
    pub fn resume(&self) {
        let mut control = self.inner.control.lock();
        if control.interrupt_depth == 0 {
            self.inner
                .logger
                .warn(format_args!("resume called without a matching interrupt"));
            return;
        }
        control.interrupt_depth -= 1;
        if control.interrupt_depth > 0 {
            return;
        }
        match control.state {
            ExecutionState::Interrupted | ExecutionState::Interrupting => {
                let saved = control.saved_state;
                self.set_state(&mut control, saved);
            }
            // A function queued inside the window returns to the saved state
            ExecutionState::RunOn
                if matches!(
                    control.run_on_return,
                    ExecutionState::Interrupted | ExecutionState::Interrupting
                ) =>
            {
                control.run_on_return = control.saved_state;
            }
            _ => {}
        }
    }

    // ========================================================================
    // Pause
    // ========================================================================

    /// Pause a running thread and wait until it is `Paused`
    pub fn pause(&self) {
        let mut control = self.inner.control.lock();
        self.pause_locked(&mut control);
    }

    pub fn unpause(&self) {
        let mut control = self.inner.control.lock();
        self.unpause_locked(&mut control);
    }

    pub fn toggle_pause(&self) {
        let mut control = self.inner.control.lock();
        if Self::paused_locked(&control) {
            self.unpause_locked(&mut control);
        } else {
            self.pause_locked(&mut control);
        }
    }

    /// Pause requested from a frame callback; takes effect at the next safe
    /// point
    pub fn pause_from_thread(&self) {
        let mut control = self.inner.control.lock();
        if control.interrupt_depth > 0 {
            if control.saved_state == ExecutionState::Running {
                control.saved_state = ExecutionState::Paused;
                self.gate_frames(&mut control);
            }
        } else if control.state == ExecutionState::Running {
            self.set_state(&mut control, ExecutionState::Pausing);
            self.gate_frames(&mut control);
        }
    }

    fn pause_locked(&self, control: &mut Guard<'_>) {
        if control.interrupt_depth > 0 {
            if control.saved_state == ExecutionState::Running {
                control.saved_state = ExecutionState::Paused;
                self.gate_frames(control);
            }
            return;
        }
        self.wait_stable(control);
        if control.state != ExecutionState::Running {
            return;
        }
        self.set_state(control, ExecutionState::Pausing);
        if !Self::on_exec_thread(control) {
            while control.state == ExecutionState::Pausing && control.thread_live {
                self.inner.cond.wait(control);
            }
        }
        if matches!(
            control.state,
            ExecutionState::Paused | ExecutionState::Pausing
        ) {
            self.gate_frames(control);
        }
    }

    fn unpause_locked(&self, control: &mut Guard<'_>) {
        if control.interrupt_depth > 0 {
            if matches!(
                control.saved_state,
                ExecutionState::Paused | ExecutionState::Pausing
            ) {
                control.saved_state = ExecutionState::Running;
                self.ungate_frames(control);
            }
            return;
        }
        self.wait_stable(control);
        if matches!(
            control.state,
            ExecutionState::Paused | ExecutionState::Pausing
        ) {
            self.set_state(control, ExecutionState::Running);
            self.ungate_frames(control);
        }
    }

    fn paused_locked(control: &ControlState) -> bool {
        if control.interrupt_depth > 0 {
            control.saved_state == ExecutionState::Paused
        } else {
            control.state == ExecutionState::Paused
        }
    }

    fn gate_frames(&self, control: &mut Guard<'_>) {
        control.frame_was_on = self.inner.sync.frame_on();
        self.inner.sync.set_frame_on(false);
    }

    fn ungate_frames(&self, control: &mut Guard<'_>) {
        self.inner.sync.set_frame_on(control.frame_was_on);
    }

    // ========================================================================
    // Waiting / Rewinding / Reset
    // ========================================================================

    /// Park the execution thread until `stop_waiting`
    pub fn wait_from_thread(&self) {
        let mut control = self.inner.control.lock();
        if control.interrupt_depth > 0 && control.saved_state == ExecutionState::Running {
            control.saved_state = ExecutionState::Waiting;
        } else if control.state == ExecutionState::Running {
            self.set_state(&mut control, ExecutionState::Waiting);
        }
    }

    pub fn stop_waiting(&self) {
        let mut control = self.inner.control.lock();
        if control.interrupt_depth > 0 && control.saved_state == ExecutionState::Waiting {
            control.saved_state = ExecutionState::Running;
        } else if control.state == ExecutionState::Waiting {
            self.set_state(&mut control, ExecutionState::Running);
        }
    }

    /// Switch between forward stepping and rewind playback
    pub fn set_rewinding(&self, rewinding: bool) {
        let (from, to) = if rewinding {
            (ExecutionState::Running, ExecutionState::Rewinding)
        } else {
            (ExecutionState::Rewinding, ExecutionState::Running)
        };
        let mut control = self.inner.control.lock();
        if control.interrupt_depth > 0 {
            if control.saved_state == from {
                control.saved_state = to;
            }
            return;
        }
        self.wait_stable(&mut control);
        if control.state == from {
            self.set_state(&mut control, to);
        }
    }

    pub fn is_rewinding(&self) -> bool {
        let control = self.inner.control.lock();
        if control.interrupt_depth > 0 {
            control.saved_state == ExecutionState::Rewinding
        } else {
            control.state == ExecutionState::Rewinding
        }
    }

    /// Power-cycle the machine core on the execution thread.
    ///
    /// Waits for the reset to finish unless called on the execution thread
    /// or inside an interrupt window, where it is recorded and performed
    /// once the thread next runs.
    pub fn reset(&self) {
        let mut control = self.inner.control.lock();
        if !control.state.is_active() {
            self.inner
                .logger
                .warn(format_args!("reset ignored in state {:?}", control.state));
            return;
        }
        if control.interrupt_depth > 0 {
            if matches!(
                control.saved_state,
                ExecutionState::Paused | ExecutionState::Pausing
            ) {
                self.ungate_frames(&mut control);
            }
            control.saved_state = ExecutionState::Resetting;
            return;
        }
        self.wait_stable(&mut control);
        if !control.state.is_active() {
            return;
        }
        if control.state == ExecutionState::Paused {
            self.ungate_frames(&mut control);
        }
        self.set_state(&mut control, ExecutionState::Resetting);
        if !Self::on_exec_thread(&control) {
            while control.state == ExecutionState::Resetting && control.thread_live {
                self.inner.cond.wait(&mut control);
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(super) fn lock(&self) -> Guard<'_> {
        self.inner.control.lock()
    }

    pub(super) fn set_state(&self, control: &mut ControlState, state: ExecutionState) {
        if control.state != state {
            self.inner
                .logger
                .trace(format_args!("{:?} -> {:?}", control.state, state));
        }
        control.state = state;
        self.inner.hint.store(state as u8, Ordering::Release);
        self.inner.cond.notify_all();
        self.inner.sync.wake();
    }

    pub(super) fn wait(&self, control: &mut Guard<'_>) {
        self.inner.cond.wait(control);
    }

    pub(super) fn notify(&self) {
        self.inner.cond.notify_all();
    }

    pub(super) fn set_frame_count(&self, frame: u64) {
        self.inner.frame.store(frame, Ordering::Release);
    }

    pub(super) fn on_exec_thread(control: &ControlState) -> bool {
        control.thread_id == Some(thread::current().id())
    }

    /// Let a starting thread or a transient state resolve before acting on
    /// the current one
    pub(super) fn wait_stable(&self, control: &mut Guard<'_>) {
        if Self::on_exec_thread(control) {
            return;
        }
        while control.thread_live
            && (control.state.is_transient() || control.state == ExecutionState::Initialized)
        {
            self.inner.cond.wait(control);
        }
    }
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("logger", &self.inner.logger)
            .field("state", &self.hint())
            .finish()
    }
}
