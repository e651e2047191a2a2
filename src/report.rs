//! Result assembly: per-variant statistics, control-relative comparisons,
//! and the human-readable conclusion shown to operators.

use std::sync::Arc;

use serde::Serialize;

use crate::config::{PrimaryMetric, Test, Variant};
use crate::error::EngineError;
use crate::stats::Significance;
use crate::store::Store;
use crate::winner::metric_value;

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub id: String,
    pub name: String,
    pub is_control: bool,
    pub impressions: u64,
    pub clicks: u64,
    pub views: u64,
    pub sales: u64,
    pub revenue: f64,
    pub conversion_rate: f64,
    pub click_rate: f64,
    pub avg_order_value: f64,
}

/// Control-relative comparison for one non-control variant. The lift is
/// computed on the test's primary metric; `lift_label` carries an explicit
/// sign for display.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VariantComparison {
    pub variant_id: String,
    pub variant_name: String,
    pub lift_pct: f64,
    pub lift_label: String,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub total_samples: u64,
    pub has_min_samples: bool,
    pub is_significant: Option<bool>,
    pub winning_variant_id: Option<String>,
    pub conclusion: Option<String>,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TestReport {
    pub test: Test,
    pub variants: Vec<VariantStats>,
    pub comparisons: Vec<VariantComparison>,
    pub summary: ReportSummary,
}

pub struct ReportBuilder {
    store: Arc<dyn Store>,
}

impl ReportBuilder {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn build(&self, test_id: &str) -> Result<TestReport, EngineError> {
        let test = self.store.get_test(test_id)?;
        let variants = self.store.variants_for_test(test_id)?;

        let stats: Vec<VariantStats> = variants.iter().map(variant_stats).collect();

        let control = variants.iter().find(|v| v.is_control);
        let comparisons = match control {
            Some(control) => {
                let control_value = metric_value(control, test.primary_metric);
                variants
                    .iter()
                    .filter(|v| !v.is_control)
                    .map(|v| {
                        let lift_pct = if control_value > 0.0 {
                            (metric_value(v, test.primary_metric) - control_value)
                                / control_value
                                * 100.0
                        } else {
                            0.0
                        };
                        VariantComparison {
                            variant_id: v.id.clone(),
                            variant_name: v.name.clone(),
                            lift_pct,
                            lift_label: format!("{:+.2}%", lift_pct),
                        }
                    })
                    .collect()
            }
            None => Vec::new(),
        };

        let total_samples: u64 = variants.iter().map(|v| v.views).sum();
        let summary = ReportSummary {
            total_samples,
            has_min_samples: total_samples >= test.min_sample_size,
            is_significant: test.is_significant,
            winning_variant_id: test.winning_variant_id.clone(),
            conclusion: test.conclusion.clone(),
        };

        Ok(TestReport {
            test,
            variants: stats,
            comparisons,
            summary,
        })
    }
}

fn variant_stats(v: &Variant) -> VariantStats {
    let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { num / den };
    VariantStats {
        id: v.id.clone(),
        name: v.name.clone(),
        is_control: v.is_control,
        impressions: v.impressions,
        clicks: v.clicks,
        views: v.views,
        sales: v.sales,
        revenue: v.revenue,
        conversion_rate: ratio(v.sales as f64, v.views as f64),
        click_rate: ratio(v.clicks as f64, v.impressions as f64),
        avg_order_value: ratio(v.revenue, v.sales as f64),
    }
}

/// Builds the conclusion sentence recorded when a test completes.
///
/// Branching, in order: no determinable winner → neutral wording; winner
/// without significance → metric name and p-value; the control winning →
/// no improvement found, citing lift; a significant treatment → variant
/// name, improvement percentage, and p-value.
pub fn conclusion_text(
    metric: PrimaryMetric,
    winner: Option<&Variant>,
    significance: &Significance,
) -> String {
    let winner = match winner {
        Some(w) => w,
        None => {
            return "No winner could be determined; the test has no comparable variants."
                .to_string()
        }
    };
    if !significance.is_significant {
        return format!(
            "No statistically significant difference in {} was found (p = {:.4}).",
            metric.label(),
            significance.p_value
        );
    }
    if winner.is_control {
        return format!(
            "The control variant performed best; no improvement was found ({:+.2}% lift).",
            significance.lift
        );
    }
    format!(
        "Variant \"{}\" improved {} by {:+.2}% (p = {:.4}).",
        winner.name,
        metric.label(),
        significance.lift,
        significance.p_value
    )
}
