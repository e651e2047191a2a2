//! Winner selection over a test's primary metric.

use std::sync::Arc;

use crate::config::{PrimaryMetric, Variant};
use crate::error::EngineError;
use crate::store::Store;

/// Scalar score of one variant under a metric. Zero denominators score 0.
pub fn metric_value(variant: &Variant, metric: PrimaryMetric) -> f64 {
    let ratio = |num: f64, den: f64| if den == 0.0 { 0.0 } else { num / den };
    match metric {
        PrimaryMetric::ConversionRate => ratio(variant.sales as f64, variant.views as f64),
        PrimaryMetric::ClickRate => ratio(variant.clicks as f64, variant.impressions as f64),
        PrimaryMetric::Revenue => variant.revenue,
        PrimaryMetric::AvgOrderValue => ratio(variant.revenue, variant.sales as f64),
    }
}

/// Best-scoring variant in iteration order. Comparison is strictly
/// greater-than, so ties keep the earlier variant.
pub fn best_variant(variants: &[Variant], metric: PrimaryMetric) -> Option<&Variant> {
    let mut best: Option<(&Variant, f64)> = None;
    for variant in variants {
        let value = metric_value(variant, metric);
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((variant, value)),
        }
    }
    best.map(|(v, _)| v)
}

pub struct WinnerSelector {
    store: Arc<dyn Store>,
}

impl WinnerSelector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Picks the winning variant id for the test's primary metric.
    /// `None` only when the test has no variants.
    pub fn winner(&self, test_id: &str) -> Result<Option<String>, EngineError> {
        let test = self.store.get_test(test_id)?;
        let variants = self.store.variants_for_test(test_id)?;
        Ok(best_variant(&variants, test.primary_metric).map(|v| v.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    fn variant(id: &str, views: u64, sales: u64, clicks: u64, impressions: u64, revenue: f64) -> Variant {
        Variant {
            id: id.to_string(),
            test_id: "t1".to_string(),
            name: id.to_string(),
            is_control: id == "control",
            changes: IndexMap::new(),
            weight: 50,
            impressions,
            clicks,
            views,
            sales,
            revenue,
        }
    }

    #[test]
    fn conversion_rate_scores_sales_over_views() {
        let v = variant("a", 200, 10, 0, 0, 0.0);
        assert!((metric_value(&v, PrimaryMetric::ConversionRate) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn zero_denominators_score_zero() {
        let v = variant("a", 0, 10, 5, 0, 100.0);
        assert_eq!(metric_value(&v, PrimaryMetric::ConversionRate), 0.0);
        assert_eq!(metric_value(&v, PrimaryMetric::ClickRate), 0.0);
        let no_sales = variant("b", 100, 0, 0, 0, 100.0);
        assert_eq!(metric_value(&no_sales, PrimaryMetric::AvgOrderValue), 0.0);
    }

    #[test]
    fn revenue_metric_uses_raw_total() {
        let v = variant("a", 0, 0, 0, 0, 1234.5);
        assert_eq!(metric_value(&v, PrimaryMetric::Revenue), 1234.5);
    }

    #[test]
    fn avg_order_value_divides_revenue_by_sales() {
        let v = variant("a", 100, 4, 0, 0, 100.0);
        assert!((metric_value(&v, PrimaryMetric::AvgOrderValue) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn ties_keep_the_first_variant_in_order() {
        let variants = vec![
            variant("low", 100, 10, 0, 0, 0.0),
            variant("first-high", 100, 25, 0, 0, 0.0),
            variant("second-high", 100, 25, 0, 0, 0.0),
        ];
        let best = best_variant(&variants, PrimaryMetric::ConversionRate).unwrap();
        assert_eq!(best.id, "first-high");
    }

    #[test]
    fn no_variants_means_no_winner() {
        assert!(best_variant(&[], PrimaryMetric::ConversionRate).is_none());
    }

    #[test]
    fn all_zero_scores_still_name_a_winner() {
        let variants = vec![
            variant("a", 0, 0, 0, 0, 0.0),
            variant("b", 0, 0, 0, 0, 0.0),
        ];
        let best = best_variant(&variants, PrimaryMetric::ConversionRate).unwrap();
        assert_eq!(best.id, "a");
    }

    #[test]
    fn click_rate_winner_ignores_conversion_counts() {
        let variants = vec![
            variant("a", 100, 50, 1, 100, 0.0),
            variant("b", 100, 1, 30, 100, 0.0),
        ];
        let best = best_variant(&variants, PrimaryMetric::ClickRate).unwrap();
        assert_eq!(best.id, "b");
    }
}
