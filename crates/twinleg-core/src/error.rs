use thiserror::Error;

use crate::registry::ParticipantId;

/// Canonical error type returned by every mutating ledger command.
///
/// The `Display` text of each variant is the description surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The identity already owns a participant record.
    #[error("participant {0} is already registered")]
    AlreadyRegistered(ParticipantId),

    /// The named referrer has no record.
    #[error("unknown referrer {0}")]
    UnknownReferrer(ParticipantId),

    /// A participant tried to sponsor itself.
    #[error("participant {0} cannot refer itself")]
    SelfReferral(ParticipantId),

    /// No open slot exists within the configured depth limit.
    #[error("no open slot within depth limit {max_depth}")]
    PlacementFull { max_depth: u32 },

    /// The caller's role does not permit the command.
    #[error("caller {caller} is not authorized to {operation}")]
    Unauthorized {
        caller: ParticipantId,
        operation: &'static str,
    },

    /// The reward cycle has not elapsed since the last distribution.
    #[error("reward cycle not elapsed: {remaining}s remaining")]
    CycleNotElapsed { remaining: u64 },

    /// A zero or otherwise unusable amount was supplied.
    #[error("invalid amount: {0}")]
    InvalidAmount(&'static str),

    /// The participant has been deactivated.
    #[error("participant {0} is inactive")]
    InactiveParticipant(ParticipantId),

    /// The participant has no record.
    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    /// Engine or global configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A counter would wrap.
    #[error("arithmetic overflow")]
    Overflow,

    /// The external custodian reported a failure.
    #[error("custodian failure: {0}")]
    Custodian(String),

    /// A loaded snapshot failed its integrity checks.
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),
}
