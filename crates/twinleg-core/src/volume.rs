use std::collections::BTreeSet;

use tracing::debug;

use crate::error::LedgerError;
use crate::registry::{Amount, Leg, ParticipantId, Registry};

/// One ancestor and the leg through which the newcomer descends from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeCredit {
    pub ancestor: ParticipantId,
    pub leg: Leg,
}

/// Structural ancestors starting at `parent`, nearest first.
///
/// `leg` is the slot of `parent` the walk enters through. `depth_cap` bounds
/// the number of ancestors returned.
pub fn ancestor_path(
    registry: &Registry,
    parent: &str,
    leg: Leg,
    depth_cap: Option<u32>,
) -> Vec<VolumeCredit> {
    let limit = depth_cap.map_or(usize::MAX, |cap| cap as usize);
    let mut path = Vec::new();
    let mut visited = BTreeSet::new();
    let mut cursor = Some((parent.to_string(), leg));
    while let Some((ancestor, leg)) = cursor.take() {
        if path.len() >= limit || !visited.insert(ancestor.clone()) {
            break;
        }
        let Some(record) = registry.get(&ancestor) else {
            break;
        };
        cursor = record.parent.clone().zip(record.position);
        path.push(VolumeCredit { ancestor, leg });
    }
    path
}

/// Credits `volume` would add for a newcomer placed in `leg` of `parent`.
///
/// Read-only. Fails with [`LedgerError::Overflow`] if any credited counter
/// would overflow, so the result can be applied without further checks.
pub fn plan_propagation(
    registry: &Registry,
    parent: &str,
    leg: Leg,
    volume: Amount,
    depth_cap: Option<u32>,
) -> Result<Vec<VolumeCredit>, LedgerError> {
    let credits = ancestor_path(registry, parent, leg, depth_cap);
    for credit in &credits {
        let record = registry
            .get(&credit.ancestor)
            .ok_or_else(|| LedgerError::UnknownParticipant(credit.ancestor.clone()))?;
        let (current, total) = match credit.leg {
            Leg::Left => (record.current_left_volume, record.total_left_volume),
            Leg::Right => (record.current_right_volume, record.total_right_volume),
        };
        current.checked_add(volume).ok_or(LedgerError::Overflow)?;
        total.checked_add(volume).ok_or(LedgerError::Overflow)?;
    }
    Ok(credits)
}

/// Add `volume` to the current and lifetime counters of each credited leg.
/// `credits` must come from [`plan_propagation`] on the same registry state.
pub(crate) fn propagate_volume(registry: &mut Registry, credits: &[VolumeCredit], volume: Amount) {
    for credit in credits {
        if let Some(record) = registry.get_mut(&credit.ancestor) {
            match credit.leg {
                Leg::Left => {
                    record.current_left_volume += volume;
                    record.total_left_volume += volume;
                }
                Leg::Right => {
                    record.current_right_volume += volume;
                    record.total_right_volume += volume;
                }
            }
        }
    }
    debug!(volume, ancestors = credits.len(), "volume propagated");
}
