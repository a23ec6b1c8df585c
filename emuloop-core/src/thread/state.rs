//! Execution states

/// Lifecycle state of a controller's execution thread.
///
/// `Pausing`, `Interrupting`, `Resetting` and `RunOn` are transient: they
/// are set by a caller and resolved by the execution thread at its next
/// safe point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ExecutionState {
    #[default]
    Initialized = 0,
    Running = 1,
    Rewinding = 2,
    Interrupted = 3,
    Interrupting = 4,
    Paused = 5,
    Pausing = 6,
    RunOn = 7,
    Waiting = 8,
    Resetting = 9,
    Exiting = 10,
    Shutdown = 11,
    Crashed = 12,
}

impl ExecutionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Rewinding,
            3 => Self::Interrupted,
            4 => Self::Interrupting,
            5 => Self::Paused,
            6 => Self::Pausing,
            7 => Self::RunOn,
            8 => Self::Waiting,
            9 => Self::Resetting,
            10 => Self::Exiting,
            11 => Self::Shutdown,
            12 => Self::Crashed,
            _ => Self::Initialized,
        }
    }

    /// The machine core is being stepped (forward or backward)
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Rewinding)
    }

    /// The thread exists and has not exited, shut down or crashed
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Running
                | Self::Rewinding
                | Self::Interrupted
                | Self::Interrupting
                | Self::Paused
                | Self::Pausing
                | Self::RunOn
                | Self::Waiting
                | Self::Resetting
        )
    }

    /// Set by a caller, waiting for the execution thread to act on it
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Interrupting | Self::Pausing | Self::Resetting | Self::RunOn
        )
    }

    pub fn has_exited(self) -> bool {
        matches!(self, Self::Shutdown | Self::Crashed)
    }

    /// Exiting or already gone
    pub(crate) fn is_ending(self) -> bool {
        matches!(self, Self::Exiting | Self::Shutdown | Self::Crashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_mapping() {
        for value in 0..=12u8 {
            assert_eq!(ExecutionState::from_u8(value) as u8, value);
        }
        assert_eq!(ExecutionState::from_u8(200), ExecutionState::Initialized);
    }

    #[test]
    fn test_classes() {
        assert!(ExecutionState::Rewinding.is_running());
        assert!(!ExecutionState::Paused.is_running());
        assert!(ExecutionState::Resetting.is_active());
        assert!(!ExecutionState::Initialized.is_active());
        assert!(!ExecutionState::Exiting.is_active());
        assert!(!ExecutionState::Crashed.is_active());
        assert!(ExecutionState::Crashed.has_exited());
        assert!(ExecutionState::RunOn.is_transient());
        assert!(!ExecutionState::Waiting.is_transient());
    }
}
