//! # emuloop Core
//!
//! Emulation execution lifecycle for cycle-accurate console cores: the
//! execution thread state machine, frame pacing against an audio/video
//! consumer, rewind history, and the interrupt/timer/DMA coordination the
//! machine core runs against.

// ============================================================================
// Ambient
// ============================================================================
pub mod config;
pub mod logging;

// ============================================================================
// Machine Core Contract
// ============================================================================
pub mod machine;
pub mod timing;

// ============================================================================
// History / Pacing
// ============================================================================
pub mod rewind;
pub mod sync;

// ============================================================================
// Execution Thread
// ============================================================================
pub mod thread;

pub use config::{ConfigError, LogLevel, RewindConfig, SyncConfig, ThreadConfig};
pub use logging::ThreadLogger;
pub use machine::{MachineCore, MachineError, MachineResult, StepOutcome};
pub use rewind::{RewindBuffer, RewindPoint, RewindStats};
pub use sync::{FrameDelivery, FrameSync, SyncStats, VideoFrame};
pub use thread::{
    CallbackContext, ExecutionState, ThreadCallbacks, ThreadController, ThreadError, ThreadHandle,
};
pub use timing::{Coordinator, Irq, IrqSet};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
