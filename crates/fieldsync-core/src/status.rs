//! # Status Transition Graphs
//!
//! Some entity types carry a lifecycle field whose value may only move along
//! known edges. A device that was offline while an order progressed must not
//! be able to drag it back to an earlier state by pushing a stale edit.
//!
//! ```text
//!  order.status                          deal.stage
//!  ────────────────────────────────      ─────────────────────────
//!  new         → accepted | assigned     lead      → qualified | lost
//!                | cancelled             qualified → proposal | lost
//!  accepted    → assigned | in_progress  proposal  → won | lost
//!                | cancelled             won       (terminal)
//!  assigned    → in_progress | cancelled lost      (terminal)
//!  in_progress → completed | cancelled
//!  completed   → closed
//!  closed      (terminal)
//!  cancelled   (terminal)
//! ```
//!
//! Writing the current value again is always allowed (a no-op edge).

use crate::types::ConflictReason;

/// A lifecycle field and its allowed edges.
#[derive(Debug)]
pub struct StatusGraph {
    pub entity_type: &'static str,
    pub field: &'static str,
    edges: &'static [(&'static str, &'static [&'static str])],
}

impl StatusGraph {
    /// Whether `value` is a state of this graph.
    pub fn is_known(&self, value: &str) -> bool {
        self.edges.iter().any(|(state, _)| *state == value)
    }

    /// Whether moving from `from` to `to` is allowed.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        if from == to {
            return self.is_known(to);
        }
        self.edges
            .iter()
            .find(|(state, _)| *state == from)
            .map(|(_, next)| next.contains(&to))
            .unwrap_or(false)
    }

    /// Checks a proposed value against the current one.
    ///
    /// `current` is `None` when the entity has no value for the field yet.
    /// When `enforce_edges` is false only membership is checked.
    pub fn check(
        &self,
        current: Option<&str>,
        proposed: &serde_json::Value,
        enforce_edges: bool,
    ) -> Result<(), ConflictReason> {
        let proposed = proposed
            .as_str()
            .ok_or(ConflictReason::InvalidStatusValue)?;
        if !self.is_known(proposed) {
            return Err(ConflictReason::InvalidStatusValue);
        }
        match current {
            Some(from) if enforce_edges && !self.can_transition(from, proposed) => {
                Err(ConflictReason::InvalidStatusTransition)
            }
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Graphs
// =============================================================================

pub static ORDER_STATUS: StatusGraph = StatusGraph {
    entity_type: "order",
    field: "status",
    edges: &[
        ("new", &["accepted", "assigned", "cancelled"]),
        ("accepted", &["assigned", "in_progress", "cancelled"]),
        ("assigned", &["in_progress", "cancelled"]),
        ("in_progress", &["completed", "cancelled"]),
        ("completed", &["closed"]),
        ("closed", &[]),
        ("cancelled", &[]),
    ],
};

pub static DEAL_STAGE: StatusGraph = StatusGraph {
    entity_type: "deal",
    field: "stage",
    edges: &[
        ("lead", &["qualified", "lost"]),
        ("qualified", &["proposal", "lost"]),
        ("proposal", &["won", "lost"]),
        ("won", &[]),
        ("lost", &[]),
    ],
};

static GRAPHS: &[&StatusGraph] = &[&ORDER_STATUS, &DEAL_STAGE];

/// Returns the lifecycle graph for an entity type, if it has one.
pub fn graph_for(entity_type: &str) -> Option<&'static StatusGraph> {
    GRAPHS.iter().copied().find(|g| g.entity_type == entity_type)
}
