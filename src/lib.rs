//! griddle — experiment assignment and analysis engine.
//!
//! Assigns live entities (listings, products, anything with a stable id)
//! to experiment variants under traffic gating, accumulates funnel events
//! against those assignments, and judges control-vs-treatment differences
//! with a two-proportion z-test.
//!
//! The engine is storage-agnostic: every component talks to a [`Store`],
//! and randomness is injected through [`RandomSource`] so assignment
//! behavior is testable. [`MemoryStore`] is the bundled implementation.

pub mod assign;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod report;
pub mod rng;
pub mod stats;
pub mod store;
pub mod winner;

pub use assign::VariantAssigner;
pub use config::{
    Assignment, CreateTest, EventType, PrimaryMetric, Test, TestStatus, Variant, VariantDraft,
};
pub use error::EngineError;
pub use events::EventRecorder;
pub use lifecycle::{EngineStats, TestLifecycle};
pub use report::{ReportBuilder, TestReport};
pub use rng::{RandomSource, SeededSource, SequenceSource, ThreadRngSource};
pub use stats::{Significance, SignificanceCalculator};
pub use store::{AssignOutcome, CounterDelta, MemoryStore, Store};
pub use winner::WinnerSelector;
