//! Structural placement of new participants.
//!
//! * [`Plan::Binary`] runs a left-preferring breadth-first search below the
//!   sponsor, so a full sponsor spills the newcomer into the nearest open
//!   slot of its downline.
//! * [`Plan::InOrder`] ignores the sponsor and fills one shared matrix: the
//!   earliest-joined participant that still has an open slot receives the
//!   newcomer, left slot first.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerError;
use crate::registry::{Leg, ParticipantId, Plan, Registry};

/// Where a new record attaches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlacementDecision {
    pub parent: ParticipantId,
    pub leg: Leg,
    pub depth: u32,
    /// Matrix cursor to store once the placement commits.
    in_order_cursor: Option<usize>,
}

/// Placement state kept between registrations.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlacementEngine {
    /// Index into registration order of the earliest record that may still
    /// have an open slot. Slots never empty again, so it only moves forward.
    in_order_cursor: usize,
}

impl PlacementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_order_cursor(&self) -> usize {
        self.in_order_cursor
    }

    /// Decide a slot for a newcomer sponsored by `sponsor`. Read-only.
    pub fn locate(
        &self,
        registry: &Registry,
        plan: Plan,
        sponsor: &str,
        max_depth: Option<u32>,
    ) -> Result<PlacementDecision, LedgerError> {
        let decision = match plan {
            Plan::Binary => self.locate_binary(registry, sponsor, max_depth)?,
            Plan::InOrder => self.locate_in_order(registry, max_depth)?,
        };
        debug!(
            ?plan,
            sponsor,
            parent = %decision.parent,
            leg = ?decision.leg,
            depth = decision.depth,
            "placement located"
        );
        Ok(decision)
    }

    pub(crate) fn commit(&mut self, decision: &PlacementDecision) {
        if let Some(cursor) = decision.in_order_cursor {
            self.in_order_cursor = cursor;
        }
    }

    fn locate_binary(
        &self,
        registry: &Registry,
        sponsor: &str,
        max_depth: Option<u32>,
    ) -> Result<PlacementDecision, LedgerError> {
        let mut queue = VecDeque::new();
        queue.push_back(sponsor.to_string());
        while let Some(node_id) = queue.pop_front() {
            let node = registry
                .get(&node_id)
                .ok_or_else(|| LedgerError::UnknownReferrer(node_id.clone()))?;
            let child_depth = node.depth + 1;
            if exceeds(child_depth, max_depth) {
                // Breadth-first order never returns to a shallower level.
                break;
            }
            if let Some(leg) = node.open_slot() {
                return Ok(PlacementDecision {
                    parent: node_id,
                    leg,
                    depth: child_depth,
                    in_order_cursor: None,
                });
            }
            queue.extend(node.left_child.iter().cloned());
            queue.extend(node.right_child.iter().cloned());
        }
        Err(full(max_depth))
    }

    fn locate_in_order(
        &self,
        registry: &Registry,
        max_depth: Option<u32>,
    ) -> Result<PlacementDecision, LedgerError> {
        let order = registry.order();
        let mut cursor = self.in_order_cursor;
        while let Some(record) = order.get(cursor).and_then(|id| registry.get(id)) {
            if record.open_slot().is_some() {
                break;
            }
            cursor += 1;
        }
        for id in order.iter().skip(cursor) {
            let Some(record) = registry.get(id) else {
                continue;
            };
            let Some(leg) = record.open_slot() else {
                continue;
            };
            if exceeds(record.depth + 1, max_depth) {
                continue;
            }
            return Ok(PlacementDecision {
                parent: id.clone(),
                leg,
                depth: record.depth + 1,
                in_order_cursor: Some(cursor),
            });
        }
        Err(full(max_depth))
    }
}

fn exceeds(depth: u32, max_depth: Option<u32>) -> bool {
    matches!(max_depth, Some(max) if depth > max)
}

fn full(max_depth: Option<u32>) -> LedgerError {
    LedgerError::PlacementFull {
        max_depth: max_depth.unwrap_or(u32::MAX),
    }
}
