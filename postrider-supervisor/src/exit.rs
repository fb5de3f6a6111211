//! Fixed process exit codes for supervisor-fatal conditions.
//!
//! Each code identifies exactly one failure so an operator can tell from a
//! dead process what went wrong. The codes are part of the operational
//! contract and are never reused for anything else.

/// Why a supervisor or worker process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    /// The process could not build its async runtime at startup.
    ReactorInit = 65,
    /// A worker could not rebuild runtime state inherited from its parent.
    ReactorReinit = 66,
    /// A worker was started with an unusable configuration.
    WorkerConfig = 67,
    /// The worker entry point failed before serving anything.
    WorkerEntry = 68,
}

impl ExitStatus {
    /// The process exit code for this condition.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Maps an exit code back to its condition, if it is one of ours.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            65 => Some(Self::ReactorInit),
            66 => Some(Self::ReactorReinit),
            67 => Some(Self::WorkerConfig),
            68 => Some(Self::WorkerEntry),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ReactorInit => "runtime initialisation failed",
            Self::ReactorReinit => "worker runtime reinitialisation failed",
            Self::WorkerConfig => "worker configuration invalid",
            Self::WorkerEntry => "worker entry point failed",
        };
        write!(f, "{reason} (exit {})", self.code())
    }
}
