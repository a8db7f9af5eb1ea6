//! Boundary to whatever actually moves value.
//!
//! The ledger never holds custody. It asks a [`Custodian`] to approve a stake
//! or execute a withdrawal and records the answer it gets back.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LedgerError;
use crate::registry::{Amount, ParticipantId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct CustodyError(pub String);

impl From<CustodyError> for LedgerError {
    fn from(err: CustodyError) -> Self {
        LedgerError::Custodian(err.0)
    }
}

/// Custodian's acknowledgement of a transfer or approval.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: String,
    pub amount: Option<Amount>,
}

pub trait Custodian: Send + Sync {
    /// Confirm `from` has approved `amount` as its registration stake.
    fn approve_stake(&self, from: &str, amount: Amount) -> Result<TransferReceipt, CustodyError>;

    /// Move funds out to `to`. `None` drains whatever the custodian holds.
    fn emergency_withdraw(
        &self,
        to: &str,
        amount: Option<Amount>,
    ) -> Result<TransferReceipt, CustodyError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CustodyCall {
    ApproveStake { from: ParticipantId, amount: Amount },
    EmergencyWithdraw { to: ParticipantId, amount: Option<Amount> },
}

/// Custodian double that remembers every call and can be told to fail.
#[derive(Debug, Default)]
pub struct RecordingCustodian {
    calls: Mutex<Vec<CustodyCall>>,
    failure: Mutex<Option<String>>,
}

impl RecordingCustodian {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, reason: impl Into<String>) {
        *lock(&self.failure) = Some(reason.into());
    }

    pub fn recover(&self) {
        *lock(&self.failure) = None;
    }

    pub fn calls(&self) -> Vec<CustodyCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: CustodyCall, amount: Option<Amount>) -> Result<TransferReceipt, CustodyError> {
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(CustodyError(reason));
        }
        let mut calls = lock(&self.calls);
        calls.push(call);
        Ok(TransferReceipt {
            reference: format!("rec-{}", calls.len()),
            amount,
        })
    }
}

impl Custodian for RecordingCustodian {
    fn approve_stake(&self, from: &str, amount: Amount) -> Result<TransferReceipt, CustodyError> {
        self.record(
            CustodyCall::ApproveStake {
                from: from.to_string(),
                amount,
            },
            Some(amount),
        )
    }

    fn emergency_withdraw(
        &self,
        to: &str,
        amount: Option<Amount>,
    ) -> Result<TransferReceipt, CustodyError> {
        self.record(
            CustodyCall::EmergencyWithdraw {
                to: to.to_string(),
                amount,
            },
            amount,
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
