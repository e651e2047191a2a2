//! Funnel event recording.
//!
//! Events only count when the entity already holds an assignment under the
//! test; anything else is silently dropped because it cannot be attributed
//! to a variant. Each recorded event increments the matching counter on
//! both the assignment and its variant — a conversion lands in the
//! variant's `sales` and the assignment's `conversions`.

use std::sync::Arc;

use tracing::debug;

use crate::config::{now_ms, EventType};
use crate::error::EngineError;
use crate::store::{CounterDelta, Store};

pub struct EventRecorder {
    store: Arc<dyn Store>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records one funnel event. Returns `Ok(false)` when no assignment
    /// exists for (test, entity) — nothing is mutated in that case.
    /// `revenue` is only meaningful on conversion events.
    pub fn record(
        &self,
        test_id: &str,
        entity_id: &str,
        entity_kind: &str,
        event_type: EventType,
        revenue: Option<f64>,
    ) -> Result<bool, EngineError> {
        if entity_id.trim().is_empty() {
            return Err(EngineError::MissingInput("entityId"));
        }
        if entity_kind.trim().is_empty() {
            return Err(EngineError::MissingInput("entityKind"));
        }

        let assignment = match self.store.find_assignment(test_id, entity_id) {
            Some(a) => a,
            None => {
                debug!(test_id, entity_id, ?event_type, "event dropped: no assignment");
                return Ok(false);
            }
        };

        let delta = event_delta(event_type, revenue);
        let at = now_ms();
        self.store
            .apply_assignment_delta(test_id, entity_id, &delta, at)?;
        self.store
            .apply_variant_delta(test_id, &assignment.variant_id, &delta)?;
        Ok(true)
    }
}

fn event_delta(event_type: EventType, revenue: Option<f64>) -> CounterDelta {
    match event_type {
        EventType::Impression => CounterDelta {
            impressions: 1,
            ..Default::default()
        },
        EventType::Click => CounterDelta {
            clicks: 1,
            ..Default::default()
        },
        EventType::View => CounterDelta {
            views: 1,
            ..Default::default()
        },
        EventType::Conversion => CounterDelta {
            conversions: 1,
            revenue: revenue.unwrap_or(0.0),
            ..Default::default()
        },
    }
}
