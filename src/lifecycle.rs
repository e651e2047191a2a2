//! Test lifecycle: creation with normalized variant weights, the status
//! state machine, and final statistical evaluation on completion.
//!
//! Status flow: `Draft → Scheduled → Running → {Paused, Completed}`, with
//! `Paused → Running` via an explicit resume. `Completed` is terminal and
//! triggers the significance/winner/conclusion write-back.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::{
    new_id, now_ms, CreateTest, PrimaryMetric, Test, TestStatus, Variant, VariantDraft,
    normalize_weights, DEFAULT_CONFIDENCE_LEVEL, DEFAULT_MIN_SAMPLE_SIZE,
    DEFAULT_TRAFFIC_PERCENT, DEFAULT_VARIANT_WEIGHT,
};
use crate::error::EngineError;
use crate::report::conclusion_text;
use crate::stats::SignificanceCalculator;
use crate::store::Store;
use crate::winner::WinnerSelector;

/// Aggregate engine counters for operator dashboards.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub total_tests: usize,
    pub draft: usize,
    pub scheduled: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub total_assignments: usize,
}

pub struct TestLifecycle {
    store: Arc<dyn Store>,
}

impl TestLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates a test in `Draft` with its variants. Input weights default
    /// to 50 and are normalized to a 100-point scale.
    pub fn create(&self, input: CreateTest) -> Result<Test, EngineError> {
        let weights = normalize_weights(
            &input
                .variants
                .iter()
                .map(|v| v.weight)
                .collect::<Vec<_>>(),
        )?;

        let test = Test {
            id: new_id(),
            name: input.name,
            description: input.description,
            entity_kind: input.entity_kind,
            target_field: input.target_field,
            filters: input.filters,
            traffic_percent: input.traffic_percent.unwrap_or(DEFAULT_TRAFFIC_PERCENT),
            start_at: input.start_at,
            end_at: input.end_at,
            primary_metric: input
                .primary_metric
                .unwrap_or(PrimaryMetric::ConversionRate),
            secondary_metrics: input.secondary_metrics,
            min_sample_size: input.min_sample_size.unwrap_or(DEFAULT_MIN_SAMPLE_SIZE),
            confidence_level: input
                .confidence_level
                .unwrap_or(DEFAULT_CONFIDENCE_LEVEL),
            status: TestStatus::Draft,
            winning_variant_id: None,
            is_significant: None,
            conclusion: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        };
        test.validate()?;

        let variants: Vec<Variant> = input
            .variants
            .into_iter()
            .zip(weights)
            .map(|(draft, weight)| Variant {
                id: new_id(),
                test_id: test.id.clone(),
                name: draft.name,
                is_control: draft.is_control,
                changes: draft.changes,
                weight,
                impressions: 0,
                clicks: 0,
                views: 0,
                sales: 0,
                revenue: 0.0,
            })
            .collect();

        self.store.create_test(test.clone(), variants)?;
        info!(test_id = %test.id, name = %test.name, "test created");
        Ok(test)
    }

    /// `Draft → Scheduled`.
    pub fn schedule(&self, test_id: &str) -> Result<Test, EngineError> {
        let mut test = self.store.get_test(test_id)?;
        if test.status != TestStatus::Draft {
            return Err(EngineError::InvalidTransition {
                action: "schedule",
                status: test.status,
            });
        }
        test.status = TestStatus::Scheduled;
        self.store.update_test(&test)?;
        info!(test_id, "test scheduled");
        Ok(test)
    }

    /// `Draft | Scheduled → Running`, stamping the start time.
    pub fn start(&self, test_id: &str) -> Result<Test, EngineError> {
        let mut test = self.store.get_test(test_id)?;
        if !matches!(test.status, TestStatus::Draft | TestStatus::Scheduled) {
            return Err(EngineError::InvalidTransition {
                action: "start",
                status: test.status,
            });
        }
        test.status = TestStatus::Running;
        test.started_at = Some(now_ms());
        self.store.update_test(&test)?;
        info!(test_id, "test started");
        Ok(test)
    }

    /// `Running → Paused`. The optional reason replaces any prior
    /// conclusion text.
    pub fn pause(&self, test_id: &str, reason: Option<String>) -> Result<Test, EngineError> {
        let mut test = self.store.get_test(test_id)?;
        if test.status != TestStatus::Running {
            return Err(EngineError::InvalidTransition {
                action: "pause",
                status: test.status,
            });
        }
        test.status = TestStatus::Paused;
        test.conclusion = reason;
        self.store.update_test(&test)?;
        info!(test_id, "test paused");
        Ok(test)
    }

    /// `Paused → Running`.
    pub fn resume(&self, test_id: &str) -> Result<Test, EngineError> {
        let mut test = self.store.get_test(test_id)?;
        if test.status != TestStatus::Paused {
            return Err(EngineError::InvalidTransition {
                action: "resume",
                status: test.status,
            });
        }
        test.status = TestStatus::Running;
        self.store.update_test(&test)?;
        info!(test_id, "test resumed");
        Ok(test)
    }

    /// `Running | Paused → Completed`: runs the significance calculator and
    /// winner selector, then writes the verdict back onto the test.
    pub fn complete(&self, test_id: &str) -> Result<Test, EngineError> {
        let mut test = self.store.get_test(test_id)?;
        if !matches!(test.status, TestStatus::Running | TestStatus::Paused) {
            return Err(EngineError::InvalidTransition {
                action: "complete",
                status: test.status,
            });
        }

        let significance = SignificanceCalculator::new(Arc::clone(&self.store))
            .significance(test_id)?;
        let winner_id = WinnerSelector::new(Arc::clone(&self.store)).winner(test_id)?;

        let variants = self.store.variants_for_test(test_id)?;
        let winner = winner_id
            .as_deref()
            .and_then(|id| variants.iter().find(|v| v.id == id));

        test.status = TestStatus::Completed;
        test.completed_at = Some(now_ms());
        test.is_significant = Some(significance.is_significant);
        test.winning_variant_id = winner_id.clone();
        test.conclusion = Some(conclusion_text(test.primary_metric, winner, &significance));
        self.store.update_test(&test)?;
        info!(
            test_id,
            significant = significance.is_significant,
            winner = winner_id.as_deref().unwrap_or("none"),
            "test completed"
        );
        Ok(test)
    }

    /// Deletes a test and everything bound to it. Running tests must be
    /// paused or completed first.
    pub fn delete(&self, test_id: &str) -> Result<(), EngineError> {
        let test = self.store.get_test(test_id)?;
        if test.status == TestStatus::Running {
            return Err(EngineError::InvalidTransition {
                action: "delete",
                status: test.status,
            });
        }
        self.store.delete_test(test_id)?;
        info!(test_id, "test deleted");
        Ok(())
    }

    /// Adds a variant to a `Draft` test. A variant added individually keeps
    /// its literal weight (default 50); normalization only happens at
    /// creation time.
    pub fn add_variant(
        &self,
        test_id: &str,
        draft: VariantDraft,
    ) -> Result<Variant, EngineError> {
        self.ensure_draft(test_id, "add variant")?;
        let variant = Variant {
            id: new_id(),
            test_id: test_id.to_string(),
            name: draft.name,
            is_control: draft.is_control,
            changes: draft.changes,
            weight: draft.weight.unwrap_or(DEFAULT_VARIANT_WEIGHT),
            impressions: 0,
            clicks: 0,
            views: 0,
            sales: 0,
            revenue: 0.0,
        };
        self.store.add_variant(variant.clone())?;
        Ok(variant)
    }

    /// Replaces a variant's definition on a `Draft` test.
    pub fn update_variant(&self, variant: &Variant) -> Result<(), EngineError> {
        self.ensure_draft(&variant.test_id, "update variant")?;
        self.store.update_variant(variant)
    }

    /// Removes a variant from a `Draft` test.
    pub fn remove_variant(&self, test_id: &str, variant_id: &str) -> Result<(), EngineError> {
        self.ensure_draft(test_id, "remove variant")?;
        self.store.remove_variant(test_id, variant_id)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            total_tests: self.store.count_tests(None),
            draft: self.store.count_tests(Some(TestStatus::Draft)),
            scheduled: self.store.count_tests(Some(TestStatus::Scheduled)),
            running: self.store.count_tests(Some(TestStatus::Running)),
            paused: self.store.count_tests(Some(TestStatus::Paused)),
            completed: self.store.count_tests(Some(TestStatus::Completed)),
            total_assignments: self.store.total_assignments(),
        }
    }

    fn ensure_draft(&self, test_id: &str, action: &'static str) -> Result<(), EngineError> {
        let test = self.store.get_test(test_id)?;
        if test.status != TestStatus::Draft {
            return Err(EngineError::InvalidTransition {
                action,
                status: test.status,
            });
        }
        Ok(())
    }
}
