//! Role-gated command surface.
//!
//! Every mutating command is checked once against [`PERMISSIONS`] before it
//! touches state. Registration is open to everyone but only on one's own
//! behalf; that rule lives in [`authorize`].

use serde::{Deserialize, Serialize};

use crate::config::GlobalConfig;
use crate::error::LedgerError;
use crate::registry::Registry;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Participant,
    Anonymous,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Register,
    ChangeRewardCycle,
    EmergencyWithdraw,
    SendMessage,
    Distribute,
    Deactivate,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::ChangeRewardCycle => "change the reward cycle",
            Operation::EmergencyWithdraw => "emergency withdraw",
            Operation::SendMessage => "send a broadcast message",
            Operation::Distribute => "distribute rewards",
            Operation::Deactivate => "deactivate participants",
        }
    }
}

/// `(operation, owner, admin, participant or anonymous)`.
pub const PERMISSIONS: &[(Operation, bool, bool, bool)] = &[
    (Operation::Register, true, true, true),
    (Operation::ChangeRewardCycle, true, true, false),
    (Operation::EmergencyWithdraw, true, true, false),
    (Operation::SendMessage, true, false, false),
    (Operation::Distribute, true, false, false),
    (Operation::Deactivate, true, true, false),
];

pub fn role_of(config: &GlobalConfig, registry: &Registry, caller: &str) -> Role {
    if caller == config.owner {
        Role::Owner
    } else if caller == config.admin {
        Role::Admin
    } else if registry.contains(caller) {
        Role::Participant
    } else {
        Role::Anonymous
    }
}

pub fn permits(role: Role, operation: Operation) -> bool {
    PERMISSIONS
        .iter()
        .find(|(op, ..)| *op == operation)
        .map(|&(_, owner, admin, public)| match role {
            Role::Owner => owner,
            Role::Admin => admin,
            Role::Participant | Role::Anonymous => public,
        })
        .unwrap_or(false)
}

/// Check `caller` may run `operation`. `subject` is the identity a
/// registration is made for.
pub fn authorize(
    config: &GlobalConfig,
    registry: &Registry,
    caller: &str,
    operation: Operation,
    subject: Option<&str>,
) -> Result<Role, LedgerError> {
    let role = role_of(config, registry, caller);
    let self_only = operation == Operation::Register && subject.is_some_and(|id| id != caller);
    if !permits(role, operation) || self_only {
        return Err(LedgerError::Unauthorized {
            caller: caller.to_string(),
            operation: operation.name(),
        });
    }
    Ok(role)
}
