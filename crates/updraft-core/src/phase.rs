use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Position of an update session in the pipeline state machine.
///
/// The sequenced phases only ever move forward. `Error`, `FatalError` and
/// `Cancelled` are side branches reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialized,
    Download,
    Merging,
    Extraction,
    Replacement,
    Migration,
    Completing,
    Completed,
    Error,
    FatalError,
    Cancelled,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Download => "download",
            Self::Merging => "merging",
            Self::Extraction => "extraction",
            Self::Replacement => "replacement",
            Self::Migration => "migration",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::FatalError => "fatal_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim() {
            "initialized" => Ok(Self::Initialized),
            "download" => Ok(Self::Download),
            "merging" => Ok(Self::Merging),
            "extraction" => Ok(Self::Extraction),
            "replacement" => Ok(Self::Replacement),
            "migration" => Ok(Self::Migration),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "fatal_error" => Ok(Self::FatalError),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(anyhow!("invalid phase: {value}")),
        }
    }

    fn rank(self) -> Option<u8> {
        match self {
            Self::Initialized => Some(0),
            Self::Download => Some(1),
            Self::Merging => Some(2),
            Self::Extraction => Some(3),
            Self::Replacement => Some(4),
            Self::Migration => Some(5),
            Self::Completing => Some(6),
            Self::Completed => Some(7),
            Self::Error | Self::FatalError | Self::Cancelled => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::FatalError | Self::Cancelled)
    }

    pub fn can_resume(self) -> bool {
        !self.is_terminal()
    }

    /// Whether a session sitting in `self` may move to `next`.
    ///
    /// `failed_phase` is the phase that was running when the session was
    /// forced into `Error`; leaving `Error` may re-enter that phase or any
    /// later one, never an earlier one.
    pub fn can_transition_to(self, next: Phase, failed_phase: Option<Phase>) -> bool {
        if next == Self::Cancelled {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Self::Error | Self::FatalError) {
            return true;
        }

        let Some(next_rank) = next.rank() else {
            return false;
        };

        if self == Self::Error {
            return match failed_phase.and_then(Phase::rank) {
                Some(failed_rank) => next_rank >= failed_rank,
                None => true,
            };
        }

        match self.rank() {
            Some(current_rank) => next_rank >= current_rank,
            None => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}
