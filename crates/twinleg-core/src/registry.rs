use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub type ParticipantId = String;
pub type Amount = u64;
pub type Timestamp = u64;

/// Placement variant chosen at registration. Never changes afterwards.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Binary,
    InOrder,
}

/// One of the two structural subtrees below a participant.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Left,
    Right,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    /// Sponsor. `None` only for the root.
    pub referrer: Option<ParticipantId>,
    pub plan: Plan,
    /// Structural parent; differs from `referrer` after spillover.
    pub parent: Option<ParticipantId>,
    /// Slot occupied in `parent`.
    pub position: Option<Leg>,
    pub depth: u32,
    pub left_child: Option<ParticipantId>,
    pub right_child: Option<ParticipantId>,
    pub directs: u32,
    pub current_left_volume: Amount,
    pub current_right_volume: Amount,
    pub total_left_volume: Amount,
    pub total_right_volume: Amount,
    pub balance_points: Amount,
    pub total_earnings: Amount,
    pub active: bool,
    /// Registration sequence number, starting at zero for the root.
    pub joined_at: u64,
    pub registered_at: Timestamp,
}

/// Read-only copy handed out by queries.
pub type ParticipantSnapshot = ParticipantRecord;

impl ParticipantRecord {
    pub(crate) fn new(
        id: ParticipantId,
        referrer: Option<ParticipantId>,
        plan: Plan,
        joined_at: u64,
        registered_at: Timestamp,
    ) -> Self {
        Self {
            id,
            referrer,
            plan,
            parent: None,
            position: None,
            depth: 0,
            left_child: None,
            right_child: None,
            directs: 0,
            current_left_volume: 0,
            current_right_volume: 0,
            total_left_volume: 0,
            total_right_volume: 0,
            balance_points: 0,
            total_earnings: 0,
            active: true,
            joined_at,
            registered_at,
        }
    }

    pub fn child(&self, leg: Leg) -> Option<&ParticipantId> {
        match leg {
            Leg::Left => self.left_child.as_ref(),
            Leg::Right => self.right_child.as_ref(),
        }
    }

    /// First empty slot, left preferred.
    pub fn open_slot(&self) -> Option<Leg> {
        if self.left_child.is_none() {
            Some(Leg::Left)
        } else if self.right_child.is_none() {
            Some(Leg::Right)
        } else {
            None
        }
    }

    pub fn matched_volume(&self) -> Amount {
        self.current_left_volume.min(self.current_right_volume)
    }
}

/// Identity-keyed arena of participant records plus registration order.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    records: BTreeMap<ParticipantId, ParticipantRecord>,
    order: Vec<ParticipantId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ParticipantRecord> {
        self.records.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut ParticipantRecord> {
        self.records.get_mut(id)
    }

    pub fn root(&self) -> Option<&ParticipantId> {
        self.order.first()
    }

    /// Identities in registration order.
    pub fn order(&self) -> &[ParticipantId] {
        &self.order
    }

    /// Records in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ParticipantRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn list_all(&self) -> Vec<ParticipantSnapshot> {
        self.iter().cloned().collect()
    }

    /// Resolve the sponsor for a new registration without touching state.
    ///
    /// The first participant may omit the referrer and becomes the root;
    /// later registrations without one are sponsored by the root.
    pub fn resolve_sponsor(
        &self,
        id: &str,
        referrer: Option<&str>,
    ) -> Result<Option<ParticipantId>, LedgerError> {
        if self.contains(id) {
            return Err(LedgerError::AlreadyRegistered(id.to_string()));
        }
        let sponsor = match referrer {
            Some(referrer) if referrer == id => {
                return Err(LedgerError::SelfReferral(id.to_string()))
            }
            Some(referrer) => referrer.to_string(),
            None => match self.root() {
                Some(root) => root.clone(),
                None => return Ok(None),
            },
        };
        let record = self
            .get(&sponsor)
            .ok_or_else(|| LedgerError::UnknownReferrer(sponsor.clone()))?;
        if !record.active {
            return Err(LedgerError::InactiveParticipant(sponsor));
        }
        Ok(Some(sponsor))
    }

    pub(crate) fn insert(&mut self, record: ParticipantRecord) -> Result<(), LedgerError> {
        if self.records.contains_key(&record.id) {
            return Err(LedgerError::AlreadyRegistered(record.id));
        }
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Rebuild from records listed in registration order.
    pub(crate) fn from_records(records: Vec<ParticipantRecord>) -> Result<Self, LedgerError> {
        let mut registry = Registry::new();
        for record in records {
            let id = record.id.clone();
            registry
                .insert(record)
                .map_err(|_| LedgerError::CorruptSnapshot(format!("duplicate record {id}")))?;
        }
        Ok(registry)
    }
}
