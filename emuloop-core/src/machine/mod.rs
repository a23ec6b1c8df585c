//! Machine core contract
//!
//! The controller never looks inside the emulated machine. It steps it,
//! resets it, snapshots and restores it, and pulls finished video/audio out
//! of it; everything else is the core's business.

pub mod reference;

use bytes::{Buf, Bytes};
use thiserror::Error;

use crate::timing::{Irq, IrqSet};

/// Machine core errors
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("Machine fault: {0}")]
    Fault(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("State truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
}

pub type MachineResult<T> = Result<T, MachineError>;

/// Result of one slice of emulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stopped at a safe point inside the frame
    Continue,
    /// A frame boundary was reached
    FrameComplete,
    /// Halted with nothing internal that can wake it; needs outside input
    Halted,
}

/// An emulated machine driven by the execution thread
pub trait MachineCore: Send + 'static {
    /// Run until the next safe point, frame boundary or unrecoverable halt.
    ///
    /// Pending interrupts are tested before each unit of work, and a halted
    /// CPU resumes on its own when a qualifying interrupt or DMA comes due.
    fn run_loop(&mut self) -> MachineResult<StepOutcome>;

    /// Power-cycle the machine
    fn reset(&mut self);

    /// Request an interrupt line (no-op if already pending)
    fn raise_interrupt(&mut self, irq: Irq);

    fn pending_interrupts(&self) -> IrqSet;

    fn clear_interrupts(&mut self, lines: IrqSet);

    /// Full machine state, taken only at frame boundaries
    fn snapshot(&self) -> MachineResult<Bytes>;

    fn restore(&mut self, state: &[u8]) -> MachineResult<()>;

    fn is_halted(&self) -> bool;

    /// Pixels of the last completed frame
    fn video_frame(&self) -> Bytes {
        Bytes::new()
    }

    /// Audio produced since the last call
    fn drain_audio(&mut self) -> Vec<i16> {
        Vec::new()
    }
}

/// Bail out of a state load if fewer than `needed` bytes are left
pub(crate) fn need<B: Buf>(buf: &B, needed: usize) -> MachineResult<()> {
    if buf.remaining() < needed {
        return Err(MachineError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}
