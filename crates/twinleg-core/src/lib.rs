//! Core of the twinleg binary referral ledger.
//!
//! The crate is organised leaf-first:
//!
//! * [`registry`]: identity-keyed arena of participant records.
//! * [`placement`]: decides where a newcomer attaches (binary spillover or
//!   the shared in-order matrix).
//! * [`volume`]: pushes contributed volume up the structural ancestor chain.
//! * [`cycle`] and [`distribution`]: the reward cycle gate and the sweep
//!   that turns matched leg volume into balance.
//! * [`access`]: the role/permission table checked at the command boundary.
//! * [`ledger`]: the single-writer state machine tying the above together,
//!   with its audit log and integrity-rooted snapshots.
//! * [`service`]: a lock-guarded handle that talks to the external
//!   [`custodian`] and [`clock`].

pub mod access;
pub mod clock;
pub mod config;
pub mod custodian;
pub mod cycle;
pub mod distribution;
pub mod ledger;
pub mod placement;
pub mod registry;
pub mod service;
pub mod volume;

mod error;

pub use access::{Operation, Role};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, GlobalConfig};
pub use custodian::{Custodian, CustodyError, RecordingCustodian, TransferReceipt};
pub use distribution::DistributionReport;
pub use error::LedgerError;
pub use ledger::{LedgerEngine, LedgerEvent, LedgerSnapshot, Registration, WithdrawalIntent};
pub use registry::{Amount, Leg, ParticipantId, ParticipantRecord, ParticipantSnapshot, Plan, Timestamp};
pub use service::Ledger;
