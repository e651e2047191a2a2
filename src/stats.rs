//! Two-proportion z-test for experiment significance.
//!
//! This is a single-look test: calling it repeatedly while a test runs is
//! safe for monitoring, but repeated checks are not a corrected sequential
//! procedure. Thin or missing data never fails — degenerate inputs resolve
//! to the inconclusive default so the reporting path cannot crash on a
//! just-started experiment.

use std::sync::Arc;

use serde::Serialize;

use crate::error::EngineError;
use crate::store::Store;

/// Outcome of a significance check. `lift` and its interval are expressed
/// in percent relative to the control rate; `confidence_interval` bounds
/// the absolute rate difference.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Significance {
    pub z_score: f64,
    pub p_value: f64,
    pub is_significant: bool,
    pub control_rate: f64,
    pub treatment_rate: f64,
    pub confidence_interval: [f64; 2],
    pub lift: f64,
    pub lift_confidence_interval: [f64; 2],
}

impl Significance {
    /// Conservative default for experiments that cannot be evaluated yet:
    /// fewer than two variants, missing control or treatment, or no data.
    pub fn inconclusive() -> Self {
        Self {
            z_score: 0.0,
            p_value: 1.0,
            is_significant: false,
            control_rate: 0.0,
            treatment_rate: 0.0,
            confidence_interval: [0.0, 0.0],
            lift: 0.0,
            lift_confidence_interval: [0.0, 0.0],
        }
    }
}

// ── Normal Survival Function (A&S 26.2.17 with Horner's method) ─────

/// Computes P(Z > z) for the standard normal distribution.
/// Uses the Abramowitz & Stegun 26.2.17 rational approximation
/// (error < 1.5e-7) with Horner's method. Caller must pass z >= 0.
pub fn normal_sf(z: f64) -> f64 {
    debug_assert!(z >= 0.0, "normal_sf requires z >= 0, got {}", z);

    let t = 1.0 / (1.0 + 0.2316419 * z);
    let d = 0.3989422804014327; // 1/sqrt(2*pi)
    let p = d * (-z * z / 2.0).exp();

    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));

    p * poly
}

/// Standard-normal quantile for the supported confidence levels.
/// Unrecognized levels fall back to the 0.95 critical value.
pub fn z_critical(confidence_level: f64) -> f64 {
    if (confidence_level - 0.90).abs() < 1e-9 {
        1.645
    } else if (confidence_level - 0.99).abs() < 1e-9 {
        2.576
    } else {
        1.96
    }
}

// ── Two-Proportion Z-Test ───────────────────────────────────────────

/// Pooled two-proportion z-test on conversion counts out of view counts.
/// Zero views on either side collapses the standard error (and thus z) to
/// zero rather than dividing by zero.
pub fn two_proportion_z_test(
    control_sales: u64,
    control_views: u64,
    treatment_sales: u64,
    treatment_views: u64,
    confidence_level: f64,
) -> Significance {
    let rate = |sales: u64, views: u64| {
        if views == 0 {
            0.0
        } else {
            sales as f64 / views as f64
        }
    };
    let control_rate = rate(control_sales, control_views);
    let treatment_rate = rate(treatment_sales, treatment_views);

    let standard_error = if control_views == 0 || treatment_views == 0 {
        0.0
    } else {
        let pooled = (control_sales + treatment_sales) as f64
            / (control_views + treatment_views) as f64;
        (pooled
            * (1.0 - pooled)
            * (1.0 / control_views as f64 + 1.0 / treatment_views as f64))
            .sqrt()
    };

    let z = if standard_error == 0.0 {
        0.0
    } else {
        (treatment_rate - control_rate) / standard_error
    };
    let p_value = 2.0 * normal_sf(z.abs());

    let diff = treatment_rate - control_rate;
    let margin = z_critical(confidence_level) * standard_error;
    let confidence_interval = [diff - margin, diff + margin];

    let (lift, lift_confidence_interval) = if control_rate > 0.0 {
        let scale = 100.0 / control_rate;
        (
            diff * scale,
            [confidence_interval[0] * scale, confidence_interval[1] * scale],
        )
    } else {
        (0.0, [0.0, 0.0])
    };

    Significance {
        z_score: z,
        p_value,
        is_significant: p_value < (1.0 - confidence_level),
        control_rate,
        treatment_rate,
        confidence_interval,
        lift,
        lift_confidence_interval,
    }
}

// ── Calculator ──────────────────────────────────────────────────────

/// Compares the first control variant against the first non-control
/// variant of a test. When more than one treatment exists, only the first
/// in iteration order is compared; multi-arm comparison is deliberately
/// out of scope.
pub struct SignificanceCalculator {
    store: Arc<dyn Store>,
}

impl SignificanceCalculator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn significance(&self, test_id: &str) -> Result<Significance, EngineError> {
        let test = self.store.get_test(test_id)?;
        let variants = self.store.variants_for_test(test_id)?;
        if variants.len() < 2 {
            return Ok(Significance::inconclusive());
        }
        let control = variants.iter().find(|v| v.is_control);
        let treatment = variants.iter().find(|v| !v.is_control);
        match (control, treatment) {
            (Some(c), Some(t)) => Ok(two_proportion_z_test(
                c.sales,
                c.views,
                t.sales,
                t.views,
                test.confidence_level,
            )),
            _ => Ok(Significance::inconclusive()),
        }
    }
}
