use thiserror::Error;

/// Reasons an engine refuses a proposal.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalRejection {
    /// Only the believed leader accepts proposals
    #[error("not the leader")]
    NotLeader,

    /// Another membership change is appended but not committed yet
    #[error("a membership change is already in flight")]
    ConfigChangeInFlight,

    /// The leader has not committed an entry of its own term yet
    #[error("leader has not committed in its current term")]
    LeaderNotReady,

    /// The change does not apply to the current membership
    #[error("invalid membership change")]
    InvalidConfigChange,
}

/// Errors returned by engine entrypoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The replica applied its own removal and must be quiesced
    #[error("engine requested shutdown")]
    Shutdown,

    /// A proposal was refused, the caller must leave its state untouched
    #[error("proposal rejected: {0}")]
    Rejected(ProposalRejection),

    /// A cfg-change payload could not be decoded
    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    /// Check if this error is an expected, non-fatal outcome
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Rejected(_))
    }

    /// The rejection reason, if this error is a rejection
    pub fn rejection(&self) -> Option<ProposalRejection> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

impl From<ProposalRejection> for EngineError {
    fn from(value: ProposalRejection) -> Self {
        Self::Rejected(value)
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
