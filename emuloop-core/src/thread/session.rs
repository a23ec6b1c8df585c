//! Execution thread body
//!
//! Steps the machine while the state is Running or Rewinding, handles frame
//! boundaries, and settles pending transitions under the state lock at every
//! safe point. Panics from the machine core or callbacks are caught here and
//! become `Crashed`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::MutexGuard;

use super::{CallbackContext, ExecutionState, Shared, ThreadCallbacks, ThreadHandle};
use crate::machine::{MachineCore, StepOutcome};
use crate::sync::VideoFrame;

struct Session<M: MachineCore> {
    handle: ThreadHandle,
    shared: Arc<Shared<M>>,
    machine: M,
    callbacks: Box<dyn ThreadCallbacks<M>>,
    frame_start: Instant,
}

/// Thread entry point
pub(super) fn run<M: MachineCore>(handle: ThreadHandle, shared: Arc<Shared<M>>) {
    ThreadHandle::set_current(Some(handle.clone()));
    handle.lock().thread_id = Some(thread::current().id());

    let (machine, callbacks) = {
        let mut parts = shared.parts.lock();
        let callbacks = std::mem::replace(&mut parts.callbacks, Box::new(()));
        (parts.machine.take(), callbacks)
    };

    match machine {
        Some(machine) => {
            let mut session = Session {
                handle: handle.clone(),
                shared: shared.clone(),
                machine,
                callbacks,
                frame_start: Instant::now(),
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| session.execute()));
            if let Err(payload) = outcome {
                session.handle.logger().error(format_args!(
                    "Execution thread panicked: {}",
                    panic_message(payload.as_ref())
                ));
                session.handle.mark_crashed();
            }
            session.finish();
        }
        None => {
            handle
                .logger()
                .error(format_args!("Execution thread started without a machine core"));
            handle.mark_crashed();
            shared.parts.lock().callbacks = callbacks;
        }
    }

    let mut control = handle.lock();
    control.exit_observed = true;
    control.thread_live = false;
    control.thread_id = None;
    handle.notify();
    drop(control);
    ThreadHandle::set_current(None);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl<M: MachineCore> Session<M> {
    fn execute(&mut self) {
        self.machine.reset();
        self.handle.set_frame_count(0);

        self.callback(|callbacks, ctx| callbacks.on_start(ctx));
        self.callback(|callbacks, ctx| callbacks.on_reset(ctx));

        {
            let mut control = self.handle.lock();
            if control.state == ExecutionState::Initialized {
                if control.interrupt_depth > 0 {
                    // Interrupted before the first step
                    control.saved_state = ExecutionState::Running;
                    self.handle.set_state(&mut control, ExecutionState::Interrupting);
                } else {
                    self.handle.set_state(&mut control, ExecutionState::Running);
                }
            }
        }
        self.handle
            .logger()
            .info(format_args!("Execution thread started"));

        self.frame_started();
        loop {
            while self.handle.hint().is_running() {
                self.step();
            }
            if !self.settle() {
                break;
            }
        }
    }

    fn step(&mut self) {
        if self.handle.hint() == ExecutionState::Rewinding {
            self.rewind_step();
            return;
        }
        match self.machine.run_loop() {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::FrameComplete) => {
                self.frame_ended();
                self.frame_started();
            }
            Ok(StepOutcome::Halted) => {
                self.handle.logger().debug(format_args!(
                    "Machine halted with no wake source at frame {}",
                    self.handle.frame_count()
                ));
                self.handle.wait_from_thread();
            }
            Err(err) => {
                self.handle
                    .logger()
                    .error(format_args!("Machine fault: {}", err));
                self.handle.mark_crashed();
            }
        }
    }

    fn frame_started(&mut self) {
        self.frame_start = Instant::now();
    }

    /// Frame boundary: rewind capture, consumer handoff, frame callback
    fn frame_ended(&mut self) {
        let frame = self.handle.frame_count() + 1;
        self.handle.set_frame_count(frame);

        let machine = &self.machine;
        let captured = self
            .shared
            .rewind
            .lock()
            .capture(frame, || machine.snapshot());
        if let Err(err) = captured {
            self.handle
                .logger()
                .warn(format_args!("Rewind capture at frame {} failed: {}", frame, err));
        }

        self.deliver(frame);
        let audio = self.machine.drain_audio();
        let handle = &self.handle;
        handle
            .sync()
            .produce_audio(&audio, &|| !handle.hint().is_running());

        self.handle.logger().trace(format_args!(
            "Frame {} took {:?}",
            frame,
            self.frame_start.elapsed()
        ));
        self.callback(|callbacks, ctx| callbacks.on_frame(ctx));
    }

    fn deliver(&self, frame: u64) {
        let handle = &self.handle;
        let video = VideoFrame {
            number: frame,
            pixels: self.machine.video_frame(),
        };
        handle
            .sync()
            .wait_for_frame(video, &|| !handle.hint().is_running());
    }

    /// One step of history playback
    fn rewind_step(&mut self) {
        let frame = self.handle.frame_count();
        let point = self.shared.rewind.lock().rewind(frame);
        let Some(point) = point else {
            self.handle.logger().info(format_args!(
                "Rewind history exhausted at frame {}",
                frame
            ));
            self.handle.set_rewinding(false);
            return;
        };
        match self.machine.restore(&point.state) {
            Ok(()) => {
                self.handle.set_frame_count(point.frame);
                self.deliver(point.frame);
            }
            Err(err) => {
                self.handle.logger().error(format_args!(
                    "Restoring frame {} failed: {}",
                    point.frame, err
                ));
                self.handle.mark_crashed();
            }
        }
    }

    /// Resolve pending transitions; park while Paused, Interrupted or
    /// Waiting. Returns false once the thread has to exit.
    fn settle(&mut self) -> bool {
        let handle = self.handle.clone();
        let mut control = handle.lock();
        loop {
            match control.state {
                ExecutionState::Pausing => {
                    handle.set_state(&mut control, ExecutionState::Paused);
                }
                ExecutionState::Interrupting => {
                    handle.set_state(&mut control, ExecutionState::Interrupted);
                }
                ExecutionState::RunOn => {
                    let job = self.shared.run_slot.lock().take();
                    if let Some(job) = job {
                        MutexGuard::unlocked(&mut control, || job(&mut self.machine));
                    }
                    if control.state == ExecutionState::RunOn {
                        let back = control.run_on_return;
                        handle.set_state(&mut control, back);
                    }
                    continue;
                }
                ExecutionState::Resetting => {
                    MutexGuard::unlocked(&mut control, || self.reset_machine());
                    if control.state == ExecutionState::Resetting {
                        handle.set_state(&mut control, ExecutionState::Running);
                    }
                    continue;
                }
                _ => {}
            }

            match control.state {
                ExecutionState::Paused
                | ExecutionState::Interrupted
                | ExecutionState::Waiting => handle.wait(&mut control),
                state => return !state.is_ending(),
            }
        }
    }

    fn reset_machine(&mut self) {
        self.machine.reset();
        self.shared.rewind.lock().clear();
        self.handle.set_frame_count(0);
        self.handle.logger().info(format_args!("Machine reset"));
        self.callback(|callbacks, ctx| callbacks.on_reset(ctx));
        self.frame_started();
    }

    fn callback<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut dyn ThreadCallbacks<M>, &mut CallbackContext<'_, M>),
    {
        let mut ctx = CallbackContext {
            thread: &self.handle,
            machine: &mut self.machine,
            frame: self.handle.frame_count(),
        };
        hook(self.callbacks.as_mut(), &mut ctx);
    }

    /// Leave the loop: record the exit, run clean-up once, hand the machine
    /// back to the controller
    fn finish(mut self) {
        {
            let mut control = self.handle.lock();
            control.exit_observed = true;
            if control.state == ExecutionState::Crashed {
                self.handle.notify();
            } else {
                self.handle.set_state(&mut control, ExecutionState::Shutdown);
            }
        }

        let cleanup = panic::catch_unwind(AssertUnwindSafe(|| {
            self.callback(|callbacks, ctx| callbacks.on_cleanup(ctx))
        }));
        if let Err(payload) = cleanup {
            self.handle.logger().error(format_args!(
                "Clean-up callback panicked: {}",
                panic_message(payload.as_ref())
            ));
        }

        let crashed = self.handle.has_crashed();
        self.handle.logger().info(format_args!(
            "Execution thread exited at frame {}{}",
            self.handle.frame_count(),
            if crashed { " (crashed)" } else { "" }
        ));

        self.shared.run_slot.lock().take();
        let mut parts = self.shared.parts.lock();
        parts.machine = Some(self.machine);
        parts.callbacks = self.callbacks;
    }
}
