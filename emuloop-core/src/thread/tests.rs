use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::*;
use crate::config::{LogLevel, RewindConfig, SyncConfig};
use crate::logging;
use crate::machine::reference::{ReferenceConfig, ReferenceMachine};
use crate::machine::{need, MachineError, MachineResult, StepOutcome};
use crate::timing::{Irq, IrqSet};

// ============================================================================
// Fixtures
// ============================================================================

/// Deterministic machine: `substeps` calls per frame, state is the frame
/// counter, the position inside the frame and a scratch buffer
#[derive(Default)]
struct FrameMachine {
    frames: u64,
    position: u32,
    substeps: u32,
    scratch: [u8; 32],
    delay: Option<Duration>,
    fault_at: Option<u64>,
    panic_at: Option<u64>,
    halt_at: Option<u64>,
    halted: bool,
    pending: IrqSet,
}

impl FrameMachine {
    fn new() -> Self {
        Self {
            substeps: 1,
            ..Default::default()
        }
    }

    fn after(frames: u64) -> Self {
        let mut machine = Self::new();
        while machine.frames < frames {
            machine.run_loop().unwrap();
        }
        machine
    }
}

impl MachineCore for FrameMachine {
    fn run_loop(&mut self) -> MachineResult<StepOutcome> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        if self.fault_at == Some(self.frames) {
            return Err(MachineError::Fault("bus error".into()));
        }
        if self.panic_at == Some(self.frames) {
            panic!("core exploded at frame {}", self.frames);
        }
        if self.halt_at == Some(self.frames) {
            self.halt_at = None;
            self.halted = true;
        }
        if self.halted {
            if !self.pending.contains(IrqSet::KEYPAD) {
                return Ok(StepOutcome::Halted);
            }
            self.halted = false;
            self.pending.remove(IrqSet::KEYPAD);
        }

        self.position += 1;
        let slot = (self.frames as usize * 7 + self.position as usize) % self.scratch.len();
        self.scratch[slot] = self.scratch[slot].wrapping_add(self.frames as u8 | 1);
        if self.position < self.substeps {
            return Ok(StepOutcome::Continue);
        }
        self.position = 0;
        self.frames += 1;
        Ok(StepOutcome::FrameComplete)
    }

    fn reset(&mut self) {
        self.frames = 0;
        self.position = 0;
        self.scratch = [0; 32];
        self.halted = false;
        self.pending = IrqSet::empty();
    }

    fn raise_interrupt(&mut self, irq: Irq) {
        self.pending.insert(irq.mask());
    }

    fn pending_interrupts(&self) -> IrqSet {
        self.pending
    }

    fn clear_interrupts(&mut self, lines: IrqSet) {
        self.pending.remove(lines);
    }

    fn snapshot(&self) -> MachineResult<Bytes> {
        let mut buf = BytesMut::with_capacity(12 + self.scratch.len());
        buf.put_u64_le(self.frames);
        buf.put_u32_le(self.position);
        buf.put_slice(&self.scratch);
        Ok(buf.freeze())
    }

    fn restore(&mut self, state: &[u8]) -> MachineResult<()> {
        let mut buf = state;
        need(&buf, 12 + self.scratch.len())?;
        self.frames = buf.get_u64_le();
        self.position = buf.get_u32_le();
        buf.copy_to_slice(&mut self.scratch);
        Ok(())
    }

    fn is_halted(&self) -> bool {
        self.halted
    }
}

#[derive(Default)]
struct Counters {
    start: AtomicU32,
    reset: AtomicU32,
    frame: AtomicU32,
    cleanup: AtomicU32,
    saw_current: AtomicBool,
    /// `interrupt_from_thread` came back inside `on_frame`
    interrupt_returned: AtomicBool,
}

/// Counts callbacks and steers the thread from `on_frame`
struct Recorder {
    counters: Arc<Counters>,
    pause_at: Arc<AtomicU64>,
    crash_at: Option<u64>,
    end_at: Option<u64>,
    interrupt_at: Option<u64>,
    interrupt_on_start: bool,
    start_delay: Option<Duration>,
}

impl Recorder {
    fn new() -> (Self, Arc<Counters>, Arc<AtomicU64>) {
        let counters = Arc::new(Counters::default());
        let pause_at = Arc::new(AtomicU64::new(u64::MAX));
        let recorder = Self {
            counters: counters.clone(),
            pause_at: pause_at.clone(),
            crash_at: None,
            end_at: None,
            interrupt_at: None,
            interrupt_on_start: false,
            start_delay: None,
        };
        (recorder, counters, pause_at)
    }
}

impl<M> ThreadCallbacks<M> for Recorder {
    fn on_start(&mut self, ctx: &mut CallbackContext<'_, M>) {
        self.counters.start.fetch_add(1, Ordering::SeqCst);
        let current = ThreadHandle::current();
        let found = current.is_some_and(|handle| {
            handle.logger().instance() == ctx.thread.logger().instance()
        }) && logging::current().is_some();
        self.counters.saw_current.store(found, Ordering::SeqCst);
        if self.interrupt_on_start {
            ctx.thread.interrupt_from_thread();
        }
        if let Some(delay) = self.start_delay {
            thread::sleep(delay);
        }
    }

    fn on_reset(&mut self, _ctx: &mut CallbackContext<'_, M>) {
        self.counters.reset.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame(&mut self, ctx: &mut CallbackContext<'_, M>) {
        self.counters.frame.fetch_add(1, Ordering::SeqCst);
        if ctx.frame == self.pause_at.load(Ordering::SeqCst) {
            ctx.thread.pause_from_thread();
        }
        if Some(ctx.frame) == self.crash_at {
            ctx.thread.mark_crashed();
        }
        if Some(ctx.frame) == self.end_at {
            ctx.thread.end();
        }
        if Some(ctx.frame) == self.interrupt_at {
            ctx.thread.interrupt_from_thread();
            self.counters
                .interrupt_returned
                .store(true, Ordering::SeqCst);
        }
    }

    fn on_cleanup(&mut self, _ctx: &mut CallbackContext<'_, M>) {
        self.counters.cleanup.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(capacity: usize, interval: u64) -> ThreadConfig {
    ThreadConfig {
        name: "test-emu".to_string(),
        log_level: LogLevel::Debug,
        rewind: RewindConfig {
            enabled: true,
            capacity,
            interval,
            deltas: true,
        },
        sync: SyncConfig {
            video_sync: false,
            ..SyncConfig::default()
        },
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn controller_with(
    machine: FrameMachine,
    config: ThreadConfig,
) -> (ThreadController<FrameMachine>, Arc<Counters>, Arc<AtomicU64>) {
    let (recorder, counters, pause_at) = Recorder::new();
    let controller = ThreadController::with_machine(machine, config);
    controller.set_callbacks(recorder).unwrap();
    (controller, counters, pause_at)
}

/// Start and run until paused at the end of `frame`
fn paused_at(
    frame: u64,
    config: ThreadConfig,
) -> (ThreadController<FrameMachine>, Arc<Counters>, Arc<AtomicU64>) {
    let (controller, counters, pause_at) = controller_with(FrameMachine::new(), config);
    pause_at.store(frame, Ordering::SeqCst);
    controller.start().unwrap();
    assert!(wait_until(|| controller.is_paused()));
    assert_eq!(controller.frame_count(), frame);
    (controller, counters, pause_at)
}

fn snapshot(controller: &ThreadController<FrameMachine>) -> Bytes {
    controller
        .run_function(|machine| machine.snapshot().unwrap())
        .unwrap()
}

// ============================================================================
// Start / End
// ============================================================================

#[test]
fn test_start_without_machine() {
    let controller = ThreadController::<FrameMachine>::new(config(10, 1));
    assert!(matches!(controller.start(), Err(ThreadError::NoMachine)));
    assert_eq!(controller.state(), ExecutionState::Initialized);
    assert!(!controller.has_started());

    controller.end();
    assert_eq!(controller.state(), ExecutionState::Shutdown);
    controller.join();
}

#[test]
fn test_start_twice_and_restart() {
    let (controller, counters, _) = controller_with(FrameMachine::new(), config(10, 1));
    controller.start().unwrap();
    assert!(controller.has_started());
    assert!(controller.is_active());
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
    assert!(matches!(controller.start(), Err(ThreadError::AlreadyStarted)));
    assert!(controller.take_machine().is_none());
    assert!(wait_until(|| controller.frame_count() > 0));

    controller.end();
    controller.join();
    assert_eq!(controller.state(), ExecutionState::Shutdown);
    assert!(controller.has_exited());
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);

    let machine = controller.take_machine().unwrap();
    assert!(machine.frames > 0);
    assert!(matches!(controller.start(), Err(ThreadError::NoMachine)));

    controller.attach_machine(machine).unwrap();
    controller.start().unwrap();
    assert_eq!(counters.start.load(Ordering::SeqCst), 2);
    assert!(wait_until(|| controller.frame_count() > 0));
    controller.end();
    controller.join();
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 2);
}

#[test]
fn test_restart_clears_rewind_history() {
    let (controller, _, pause_at) = paused_at(8, config(10, 1));
    assert_eq!(controller.rewind_stats().newest_frame, Some(8));
    controller.end();
    controller.join();

    pause_at.store(3, Ordering::SeqCst);
    controller.start().unwrap();
    assert!(wait_until(|| controller.is_paused()));
    let stats = controller.rewind_stats();
    assert_eq!(stats.captured, 3);
    assert_eq!(stats.len, 3);
    assert_eq!(stats.oldest_frame, Some(1));
    assert_eq!(stats.newest_frame, Some(3));
}

#[test]
fn test_concurrent_end_is_idempotent() {
    let (controller, counters, _) = controller_with(FrameMachine::new(), config(10, 1));
    controller.start().unwrap();

    let enders: Vec<_> = (0..2)
        .map(|_| {
            let handle = controller.handle().clone();
            thread::spawn(move || handle.end())
        })
        .collect();
    for ender in enders {
        ender.join().unwrap();
    }
    controller.end();
    controller.join();
    controller.join();

    assert_eq!(controller.state(), ExecutionState::Shutdown);
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
}

#[test]
fn test_end_from_callback() {
    let (mut recorder, counters, _) = Recorder::new();
    recorder.end_at = Some(5);
    let controller = ThreadController::with_machine(FrameMachine::new(), config(10, 1));
    controller.set_callbacks(recorder).unwrap();
    controller.start().unwrap();
    controller.join();

    assert_eq!(controller.state(), ExecutionState::Shutdown);
    assert_eq!(controller.frame_count(), 5);
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
}

#[test]
fn test_current_handle_only_on_execution_thread() {
    let (controller, counters, _) = controller_with(FrameMachine::new(), config(10, 1));
    controller.start().unwrap();
    assert!(counters.saw_current.load(Ordering::SeqCst));
    assert!(ThreadHandle::current().is_none());
    assert!(logging::current().is_none());
    assert!(!controller.handle().is_execution_thread());
}

// ============================================================================
// Crashes
// ============================================================================

#[test]
fn test_machine_fault_crashes() {
    let machine = FrameMachine {
        fault_at: Some(5),
        ..FrameMachine::new()
    };
    let (controller, counters, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();
    controller.join();

    assert!(controller.has_crashed());
    assert!(controller.has_exited());
    assert!(!controller.is_active());
    assert_eq!(controller.frame_count(), 5);
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);

    controller.end();
    assert_eq!(controller.state(), ExecutionState::Crashed);
    assert!(controller.take_machine().is_some());
}

#[test]
fn test_mark_crashed_from_callback() {
    let (mut recorder, counters, _) = Recorder::new();
    recorder.crash_at = Some(3);
    let controller = ThreadController::with_machine(FrameMachine::new(), config(10, 1));
    controller.set_callbacks(recorder).unwrap();
    controller.start().unwrap();
    controller.join();

    assert!(controller.has_crashed());
    assert_eq!(controller.frame_count(), 3);
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
}

#[test]
fn test_panic_becomes_crash() {
    let machine = FrameMachine {
        panic_at: Some(2),
        ..FrameMachine::new()
    };
    let (controller, counters, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();
    controller.join();

    assert!(controller.has_crashed());
    assert_eq!(counters.cleanup.load(Ordering::SeqCst), 1);
    assert!(controller.take_machine().is_some());
}

// ============================================================================
// Interrupt / Pause
// ============================================================================

#[test]
fn test_interrupt_nesting() {
    let machine = FrameMachine {
        delay: Some(Duration::from_micros(200)),
        ..FrameMachine::new()
    };
    let (controller, counters, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();

    controller.interrupt();
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    controller.interrupt();
    assert_eq!(controller.handle().interrupt_depth(), 2);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    assert_eq!(controller.handle().interrupt_depth(), 1);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Running);
    assert_eq!(controller.handle().interrupt_depth(), 0);

    // Unbalanced resume is ignored
    controller.resume();
    assert_eq!(controller.handle().interrupt_depth(), 0);
    assert_eq!(controller.state(), ExecutionState::Running);
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interrupt_from_thread() {
    let (mut recorder, counters, _) = Recorder::new();
    recorder.interrupt_at = Some(6);
    let controller = ThreadController::with_machine(FrameMachine::new(), config(10, 1));
    controller.set_callbacks(recorder).unwrap();
    controller.start().unwrap();

    assert!(wait_until(|| controller.state() == ExecutionState::Interrupted));
    assert!(counters.interrupt_returned.load(Ordering::SeqCst));
    assert_eq!(controller.handle().interrupt_depth(), 1);
    assert_eq!(controller.frame_count(), 6);
    thread::sleep(Duration::from_millis(10));
    assert_eq!(controller.frame_count(), 6);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Running);
    assert_eq!(controller.handle().interrupt_depth(), 0);
    assert!(wait_until(|| controller.frame_count() > 6));
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interrupt_from_start_callback() {
    let (mut recorder, counters, _) = Recorder::new();
    recorder.interrupt_on_start = true;
    let controller = ThreadController::with_machine(FrameMachine::new(), config(10, 1));
    controller.set_callbacks(recorder).unwrap();
    controller.start().unwrap();

    assert!(wait_until(|| controller.state() == ExecutionState::Interrupted));
    assert_eq!(controller.handle().interrupt_depth(), 1);
    assert_eq!(controller.frame_count(), 0);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Running);
    assert!(wait_until(|| controller.frame_count() > 0));
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
}

#[test]
fn test_interrupt_while_starting() {
    let (mut recorder, counters, _) = Recorder::new();
    recorder.start_delay = Some(Duration::from_millis(50));
    let controller = ThreadController::with_machine(FrameMachine::new(), config(10, 1));
    controller.set_callbacks(recorder).unwrap();

    thread::scope(|scope| {
        let starter = scope.spawn(|| controller.start());
        assert!(wait_until(|| counters.start.load(Ordering::SeqCst) == 1));
        assert_eq!(controller.state(), ExecutionState::Initialized);

        controller.interrupt();
        assert_eq!(controller.state(), ExecutionState::Interrupted);
        assert_eq!(controller.handle().interrupt_depth(), 1);
        assert!(starter.join().unwrap().is_ok());
    });

    let frame = controller.frame_count();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(controller.frame_count(), frame);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Running);
    assert!(wait_until(|| controller.frame_count() > frame));
}

#[test]
fn test_interrupt_mid_frame() {
    let machine = FrameMachine {
        substeps: 50,
        delay: Some(Duration::from_micros(100)),
        ..FrameMachine::new()
    };
    let (controller, counters, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();
    assert!(wait_until(|| controller.frame_count() >= 2));

    controller.interrupt();
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    let frozen = controller.frame_count();
    let before = snapshot(&controller);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(controller.frame_count(), frozen);
    assert_eq!(snapshot(&controller), before);
    assert_eq!(controller.state(), ExecutionState::Interrupted);

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Running);
    assert!(wait_until(|| controller.frame_count() > frozen));
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
}

#[test]
fn test_pause_unpause_loses_no_cycles() {
    let config = config(10, 1);
    let controller =
        ThreadController::with_machine(ReferenceMachine::new(ReferenceConfig::small()), config);
    controller.start().unwrap();

    let mut fresh = ReferenceMachine::new(ReferenceConfig::small());
    for round in 0..3u64 {
        assert!(wait_until(|| controller.frame_count() >= (round + 1) * 3));
        controller.pause();
        assert_eq!(controller.state(), ExecutionState::Paused);

        let (state, cycles) = controller
            .run_function(|machine| (machine.snapshot().unwrap(), machine.timing().cycles()))
            .unwrap();
        while fresh.timing().cycles() < cycles {
            fresh.run_loop().unwrap();
        }
        assert_eq!(fresh.snapshot().unwrap(), state, "diverged in round {}", round);
        assert_eq!(controller.state(), ExecutionState::Paused);

        controller.unpause();
    }
}

#[test]
fn test_pause_gates_video() {
    let (controller, _, _) = controller_with(FrameMachine::new(), config(10, 1));
    controller.start().unwrap();
    assert!(controller.sync().frame_on());

    controller.toggle_pause();
    assert!(controller.is_paused());
    assert!(!controller.sync().frame_on());

    controller.toggle_pause();
    assert!(!controller.is_paused());
    assert_eq!(controller.state(), ExecutionState::Running);
    assert!(controller.sync().frame_on());
}

#[test]
fn test_pause_inside_interrupt() {
    let (controller, _, _) = controller_with(FrameMachine::new(), config(10, 1));
    controller.start().unwrap();

    controller.interrupt();
    controller.pause();
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    assert!(controller.is_paused());

    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Paused);
    let frame = controller.frame_count();
    thread::sleep(Duration::from_millis(10));
    assert_eq!(controller.frame_count(), frame);

    // Interrupting a paused thread restores the pause afterwards
    controller.interrupt();
    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Paused);

    controller.unpause();
    assert_eq!(controller.state(), ExecutionState::Running);
}

// ============================================================================
// RunFunction / Reset / Waiting
// ============================================================================

#[test]
fn test_run_function() {
    let (controller, _, _) = paused_at(4, config(10, 1));

    let frames = controller.run_function(|machine| machine.frames);
    assert_eq!(frames, Some(4));
    controller.run_function(|machine| machine.scratch[0] = 0xEE);
    assert_eq!(controller.run_function(|machine| machine.scratch[0]), Some(0xEE));
    assert_eq!(controller.state(), ExecutionState::Paused);

    controller.interrupt();
    assert_eq!(controller.run_function(|machine| machine.frames), Some(4));
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    assert_eq!(controller.handle().interrupt_depth(), 1);
    controller.resume();
    assert_eq!(controller.state(), ExecutionState::Paused);

    controller.end();
    controller.join();
    assert_eq!(controller.run_function(|machine| machine.frames), None);
}

#[test]
fn test_resume_while_function_runs_in_interrupt() {
    let machine = FrameMachine {
        delay: Some(Duration::from_micros(200)),
        ..FrameMachine::new()
    };
    let (controller, _, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();
    assert!(wait_until(|| controller.frame_count() >= 2));

    controller.interrupt();
    assert_eq!(controller.state(), ExecutionState::Interrupted);

    thread::scope(|scope| {
        let job = scope.spawn(|| {
            controller.run_function(|machine| {
                thread::sleep(Duration::from_millis(100));
                machine.frames
            })
        });
        assert!(wait_until(|| controller.state() == ExecutionState::RunOn));
        controller.resume();
        assert_eq!(controller.handle().interrupt_depth(), 0);
        assert!(job.join().unwrap().is_some());
    });

    assert!(wait_until(|| controller.state() == ExecutionState::Running));
    assert_eq!(controller.handle().interrupt_depth(), 0);
    let frame = controller.frame_count();
    assert!(wait_until(|| controller.frame_count() > frame));
}

#[test]
fn test_reset() {
    let (controller, counters, pause_at) = paused_at(10, config(100, 1));
    assert_eq!(counters.reset.load(Ordering::SeqCst), 1);

    pause_at.store(3, Ordering::SeqCst);
    controller.reset();
    assert!(wait_until(|| controller.is_paused()));

    assert_eq!(controller.frame_count(), 3);
    assert_eq!(counters.reset.load(Ordering::SeqCst), 2);
    assert_eq!(counters.start.load(Ordering::SeqCst), 1);
    assert_eq!(controller.rewind_stats().captured, 3);
    assert_eq!(snapshot(&controller), FrameMachine::after(3).snapshot().unwrap());
}

#[test]
fn test_halted_machine_waits() {
    let machine = FrameMachine {
        halt_at: Some(4),
        ..FrameMachine::new()
    };
    let (controller, _, _) = controller_with(machine, config(10, 1));
    controller.start().unwrap();
    assert!(wait_until(|| controller.state() == ExecutionState::Waiting));
    assert_eq!(controller.frame_count(), 4);

    controller.interrupt();
    controller.run_function(|machine| machine.raise_interrupt(Irq::Keypad));
    controller.handle().stop_waiting();
    assert_eq!(controller.state(), ExecutionState::Interrupted);
    controller.resume();

    assert!(wait_until(|| controller.frame_count() > 4));
    assert!(controller.is_active());
}

// ============================================================================
// Rewind
// ============================================================================

#[test]
fn test_rewind_round_trip() {
    let (controller, _, pause_at) = paused_at(10, config(100, 1));
    let at_ten = snapshot(&controller);

    pause_at.store(15, Ordering::SeqCst);
    controller.unpause();
    assert!(wait_until(|| controller.is_paused() && controller.frame_count() == 15));
    assert_ne!(snapshot(&controller), at_ten);

    assert_eq!(controller.rewind_frames(5), Some(10));
    assert_eq!(controller.frame_count(), 10);
    assert_eq!(snapshot(&controller), at_ten);
    assert_eq!(controller.state(), ExecutionState::Paused);
}

#[test]
fn test_rewind_clamps_at_oldest() {
    let (controller, _, _) = paused_at(20, config(5, 1));
    assert_eq!(controller.rewind_stats().oldest_frame, Some(16));

    assert_eq!(controller.rewind_frames(100), Some(16));
    assert_eq!(controller.rewind_frames(1), Some(16));
    assert_eq!(controller.frame_count(), 16);
    assert_eq!(snapshot(&controller), FrameMachine::after(16).snapshot().unwrap());
    assert!(controller.is_active());
}

#[test]
fn test_rewind_playback_returns_to_running() {
    let (controller, _, pause_at) = paused_at(20, config(8, 1));
    assert_eq!(controller.rewind_stats().oldest_frame, Some(13));

    // Set up rewinding inside an interrupt window, then let it play
    controller.interrupt();
    controller.unpause();
    controller.set_rewinding(true);
    assert!(controller.handle().is_rewinding());
    pause_at.store(14, Ordering::SeqCst);
    controller.resume();

    assert!(wait_until(|| controller.is_paused()));
    assert_eq!(controller.frame_count(), 14);
    let stats = controller.rewind_stats();
    assert_eq!(stats.oldest_frame, Some(13));
    assert_eq!(stats.newest_frame, Some(14));
    assert_eq!(snapshot(&controller), FrameMachine::after(14).snapshot().unwrap());
}

#[test]
fn test_sixty_frames_interval_ten() {
    for (capacity, oldest) in [(6, 10), (5, 20)] {
        let (controller, counters, _) = paused_at(60, config(capacity, 10));
        let stats = controller.rewind_stats();
        assert_eq!(counters.frame.load(Ordering::SeqCst), 60);
        assert_eq!(stats.captured, 6);
        assert_eq!(stats.len, capacity);
        assert_eq!(stats.oldest_frame, Some(oldest));
        assert_eq!(stats.newest_frame, Some(60));
    }
}
