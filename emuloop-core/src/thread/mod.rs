//! # Thread Controller
//!
//! Owns one background execution thread stepping a [`MachineCore`], and the
//! state machine every other thread uses to steer it:
//!
//! ```text
//! Initialized ─start─► Running ⇄ Paused            (pause / unpause)
//!                      Running ⇄ Interrupted       (interrupt / resume, nests)
//!                      Running ⇄ Rewinding         (set_rewinding)
//!                      Running ─► Waiting ─► Running (wait_from_thread / stop_waiting)
//!            any ─end─► Exiting ─► Shutdown        any ─fault─► Crashed
//! ```
//!
//! Callers that request a transition block until the execution thread
//! reaches a safe point and resolves it. The machine core is only touched by
//! the execution thread, or through [`ThreadController::run_function`].

mod handle;
mod session;
mod state;

#[cfg(test)]
mod tests;

pub use handle::ThreadHandle;
pub use state::ExecutionState;

use std::sync::Arc;
use std::thread::{self as std_thread, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ThreadConfig;
use crate::logging::ThreadLogger;
use crate::machine::MachineCore;
use crate::rewind::{RewindBuffer, RewindStats};
use crate::sync::FrameSync;

// ============================================================================
// Errors
// ============================================================================

/// Setup errors reported by [`ThreadController::start`]
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("No machine core attached")]
    NoMachine,

    #[error("Execution thread already started")]
    AlreadyStarted,

    #[error("Failed to spawn execution thread: {0}")]
    Spawn(#[from] std::io::Error),
}

// ============================================================================
// Callbacks
// ============================================================================

/// What a lifecycle callback gets to work with
pub struct CallbackContext<'a, M> {
    pub thread: &'a ThreadHandle,
    pub machine: &'a mut M,
    /// Frames completed since start or the last reset
    pub frame: u64,
}

/// Embedder hooks, run synchronously on the execution thread.
///
/// They must not block indefinitely; emulation stalls while they run.
pub trait ThreadCallbacks<M>: Send {
    /// Thread initialized, before the first step
    fn on_start(&mut self, _ctx: &mut CallbackContext<'_, M>) {}

    /// After start and after every reset
    fn on_reset(&mut self, _ctx: &mut CallbackContext<'_, M>) {}

    /// After each completed frame has been handed to the consumer
    fn on_frame(&mut self, _ctx: &mut CallbackContext<'_, M>) {}

    /// Once, as the thread exits (also after a crash)
    fn on_cleanup(&mut self, _ctx: &mut CallbackContext<'_, M>) {}
}

impl<M> ThreadCallbacks<M> for () {}

pub(crate) type Job<M> = Box<dyn FnOnce(&mut M) + Send>;

/// Machine and callbacks, held here whenever no thread is running them
pub(crate) struct Parts<M> {
    pub(crate) machine: Option<M>,
    pub(crate) callbacks: Box<dyn ThreadCallbacks<M>>,
}

/// State shared between the controller and its execution thread
pub(crate) struct Shared<M> {
    pub(crate) parts: Mutex<Parts<M>>,
    pub(crate) run_slot: Mutex<Option<Job<M>>>,
    pub(crate) rewind: Mutex<RewindBuffer>,
}

// ============================================================================
// Controller
// ============================================================================

pub struct ThreadController<M: MachineCore> {
    handle: ThreadHandle,
    config: ThreadConfig,
    shared: Arc<Shared<M>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<M: MachineCore> ThreadController<M> {
    /// Controller with no machine attached yet
    pub fn new(config: ThreadConfig) -> Self {
        let logger = ThreadLogger::new(&config.name, config.log_level);
        let sync = FrameSync::new(&config.sync);
        let frame_budget = Duration::from_secs_f64(1.0 / config.sync.target_fps.max(1.0));
        let rewind = RewindBuffer::new(&config.rewind).with_budget(frame_budget);

        Self {
            handle: ThreadHandle::new(sync, logger),
            shared: Arc::new(Shared {
                parts: Mutex::new(Parts {
                    machine: None,
                    callbacks: Box::new(()),
                }),
                run_slot: Mutex::new(None),
                rewind: Mutex::new(rewind),
            }),
            config,
            join: Mutex::new(None),
        }
    }

    pub fn with_machine(machine: M, config: ThreadConfig) -> Self {
        let controller = Self::new(config);
        controller.shared.parts.lock().machine = Some(machine);
        controller
    }

    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    pub fn config(&self) -> &ThreadConfig {
        &self.config
    }

    /// Attach (or replace) the machine core. Fails while a thread is live.
    pub fn attach_machine(&self, machine: M) -> Result<(), ThreadError> {
        let control = self.handle.lock();
        if control.thread_live {
            return Err(ThreadError::AlreadyStarted);
        }
        self.shared.parts.lock().machine = Some(machine);
        Ok(())
    }

    pub fn set_callbacks<C>(&self, callbacks: C) -> Result<(), ThreadError>
    where
        C: ThreadCallbacks<M> + 'static,
    {
        let control = self.handle.lock();
        if control.thread_live {
            return Err(ThreadError::AlreadyStarted);
        }
        self.shared.parts.lock().callbacks = Box::new(callbacks);
        Ok(())
    }

    /// Machine core back from a controller whose thread has exited
    pub fn take_machine(&self) -> Option<M> {
        let control = self.handle.lock();
        if control.thread_live {
            return None;
        }
        self.shared.parts.lock().machine.take()
    }

    /// Spawn the execution thread.
    ///
    /// Returns once the thread has run `on_start`. A controller whose thread
    /// has exited can be started again.
    pub fn start(&self) -> Result<(), ThreadError> {
        let mut control = self.handle.lock();
        if control.thread_live {
            return Err(ThreadError::AlreadyStarted);
        }
        if self.shared.parts.lock().machine.is_none() {
            return Err(ThreadError::NoMachine);
        }

        control.saved_state = ExecutionState::Initialized;
        control.run_on_return = ExecutionState::Initialized;
        control.interrupt_depth = 0;
        control.frame_was_on = true;
        control.exit_observed = false;
        control.thread_live = true;
        self.handle.set_state(&mut control, ExecutionState::Initialized);
        self.handle.set_frame_count(0);
        self.shared.rewind.lock().clear();
        self.handle.sync().flush();
        self.handle.sync().set_frame_on(true);
        drop(control);

        let handle = self.handle.clone();
        let shared = self.shared.clone();
        let spawned = std_thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || session::run(handle, shared));

        let join = match spawned {
            Ok(join) => join,
            Err(err) => {
                let mut control = self.handle.lock();
                control.thread_live = false;
                self.handle.notify();
                return Err(ThreadError::Spawn(err));
            }
        };
        if let Some(previous) = self.join.lock().replace(join) {
            let _ = previous.join();
        }

        let mut control = self.handle.lock();
        while control.state == ExecutionState::Initialized && control.thread_live {
            self.handle.wait(&mut control);
        }
        Ok(())
    }

    /// Block until the execution thread has terminated. Safe to call again.
    pub fn join(&self) {
        self.handle.wait_for_exit();
        if self.handle.is_execution_thread() {
            return;
        }
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                self.handle
                    .logger()
                    .error(format_args!("Execution thread panicked outside its loop"));
            }
        }
    }

    /// Run `f` on the execution thread at its next safe point and return its
    /// result.
    ///
    /// Works from any state the thread can act in, including inside an
    /// interrupt window or while paused. Returns `None` when no thread is
    /// active, when the thread ends before running `f`, or when called from
    /// the execution thread itself.
    pub fn run_function<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut M) -> R + Send + 'static,
        R: Send + 'static,
    {
        let mut control = self.handle.lock();
        if ThreadHandle::on_exec_thread(&control) {
            self.handle
                .logger()
                .warn(format_args!("run_function called from the execution thread"));
            return None;
        }
        self.handle.wait_stable(&mut control);
        if !control.state.is_active() {
            return None;
        }

        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        *self.shared.run_slot.lock() = Some(Box::new(move |machine: &mut M| {
            *slot.lock() = Some(f(machine));
        }));
        control.run_on_return = control.state;
        self.handle.set_state(&mut control, ExecutionState::RunOn);
        while control.state == ExecutionState::RunOn && control.thread_live {
            self.handle.wait(&mut control);
        }
        // Not run if the thread went away first
        self.shared.run_slot.lock().take();
        drop(control);

        let value = result.lock().take();
        value
    }

    /// Step back `frames` snapshots through the rewind history.
    ///
    /// Stops early at the oldest retained snapshot. Returns the frame landed
    /// on, or `None` if no thread is active.
    pub fn rewind_frames(&self, frames: u64) -> Option<u64> {
        let shared = self.shared.clone();
        let handle = self.handle.clone();
        self.run_function(move |machine| {
            let current = handle.frame_count();
            let mut rewind = shared.rewind.lock();
            let mut target = None;
            let mut from = current;
            for _ in 0..frames {
                match rewind.rewind(from) {
                    Some(point) => {
                        from = point.frame;
                        target = Some(point);
                    }
                    None => break,
                }
            }
            let Some(point) = target else {
                return current;
            };
            match machine.restore(&point.state) {
                Ok(()) => {
                    handle.set_frame_count(point.frame);
                    point.frame
                }
                Err(err) => {
                    handle
                        .logger()
                        .warn(format_args!("Rewind to frame {} failed: {}", point.frame, err));
                    current
                }
            }
        })
    }

    pub fn rewind_stats(&self) -> RewindStats {
        self.shared.rewind.lock().stats()
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    pub fn state(&self) -> ExecutionState {
        self.handle.state()
    }

    pub fn has_started(&self) -> bool {
        self.handle.has_started()
    }

    pub fn has_exited(&self) -> bool {
        self.handle.has_exited()
    }

    pub fn has_crashed(&self) -> bool {
        self.handle.has_crashed()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub fn frame_count(&self) -> u64 {
        self.handle.frame_count()
    }

    pub fn end(&self) {
        self.handle.end();
    }

    pub fn interrupt(&self) {
        self.handle.interrupt();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn unpause(&self) {
        self.handle.unpause();
    }

    pub fn toggle_pause(&self) {
        self.handle.toggle_pause();
    }

    pub fn is_paused(&self) -> bool {
        self.handle.is_paused()
    }

    pub fn set_rewinding(&self, rewinding: bool) {
        self.handle.set_rewinding(rewinding);
    }

    pub fn reset(&self) {
        self.handle.reset();
    }

    pub fn sync(&self) -> &FrameSync {
        self.handle.sync()
    }
}

impl<M: MachineCore> Drop for ThreadController<M> {
    fn drop(&mut self) {
        self.handle.end();
        self.join();
    }
}
