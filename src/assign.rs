//! Variant assignment: traffic gating plus weighted random selection.
//!
//! Assignment is idempotent — once an entity is bound to a variant it keeps
//! that variant for the lifetime of the test, even if weights change later.
//! Entities that fail the traffic roll are not recorded, so they may
//! re-roll on a later call; exclusion is deliberately not sticky.

use std::sync::Arc;

use tracing::debug;

use crate::config::{new_id, now_ms, Assignment, TestStatus, Variant};
use crate::error::EngineError;
use crate::rng::RandomSource;
use crate::store::{AssignOutcome, Store};

pub struct VariantAssigner {
    store: Arc<dyn Store>,
    rng: Arc<dyn RandomSource>,
}

impl VariantAssigner {
    pub fn new(store: Arc<dyn Store>, rng: Arc<dyn RandomSource>) -> Self {
        Self { store, rng }
    }

    /// Binds `entity_id` to a variant of `test_id`, creating the binding on
    /// first touch. Returns `Ok(None)` when the entity is not eligible:
    /// unknown or non-running test, or excluded by the traffic roll.
    pub fn assign(
        &self,
        test_id: &str,
        entity_id: &str,
        entity_kind: &str,
    ) -> Result<Option<String>, EngineError> {
        if entity_id.trim().is_empty() {
            return Err(EngineError::MissingInput("entityId"));
        }
        if entity_kind.trim().is_empty() {
            return Err(EngineError::MissingInput("entityKind"));
        }

        let test = match self.store.get_test(test_id) {
            Ok(t) => t,
            Err(EngineError::TestNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if test.status != TestStatus::Running {
            return Ok(None);
        }

        if let Some(existing) = self.store.find_assignment(test_id, entity_id) {
            return Ok(Some(existing.variant_id));
        }

        // Traffic gate: roll in [0, 100); strictly above the configured
        // percent means the entity stays out of the experiment this time.
        let roll = self.rng.next_fraction() * 100.0;
        if roll > test.traffic_percent {
            debug!(test_id, entity_id, roll, "entity excluded by traffic gate");
            return Ok(None);
        }

        let variants = self.store.variants_for_test(test_id)?;
        let variant = match pick_weighted(&variants, self.rng.as_ref()) {
            Some(v) => v,
            None => return Ok(None),
        };

        let assignment = Assignment {
            id: new_id(),
            test_id: test_id.to_string(),
            variant_id: variant.id.clone(),
            entity_id: entity_id.to_string(),
            entity_kind: entity_kind.to_string(),
            impressions: 0,
            clicks: 0,
            views: 0,
            conversions: 0,
            revenue: 0.0,
            assigned_at: now_ms(),
            last_event_at: None,
        };

        // A concurrent first-touch may have raced us; the store resolves
        // the winner atomically and we return whatever it bound.
        match self.store.create_assignment_if_absent(assignment)? {
            AssignOutcome::Inserted(a) => {
                debug!(test_id, entity_id, variant_id = %a.variant_id, "entity assigned");
                Ok(Some(a.variant_id))
            }
            AssignOutcome::Existing(a) => Ok(Some(a.variant_id)),
        }
    }
}

/// Weighted random selection in stable (insertion) order: draw in
/// [0, total), subtract each weight, and take the first variant that drives
/// the remainder to zero or below. Falls back to the first variant if the
/// walk somehow exhausts the list.
fn pick_weighted<'a>(variants: &'a [Variant], rng: &dyn RandomSource) -> Option<&'a Variant> {
    if variants.is_empty() {
        return None;
    }
    let total: u64 = variants.iter().map(|v| v.weight as u64).sum();
    if total == 0 {
        return Some(&variants[0]);
    }
    let mut remainder = rng.next_fraction() * total as f64;
    for variant in variants {
        remainder -= variant.weight as f64;
        if remainder <= 0.0 {
            return Some(variant);
        }
    }
    Some(&variants[0])
}
