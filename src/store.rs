//! Persistence boundary for the engine.
//!
//! Components never touch shared state directly; they go through the
//! [`Store`] trait. The bundled [`MemoryStore`] keeps everything in
//! `DashMap`s and can optionally mirror test definitions to a JSON
//! directory (one file per test, written atomically via tmp + rename).
//!
//! The one correctness-critical primitive is
//! [`Store::create_assignment_if_absent`]: assignment uniqueness per
//! (test, entity) must be decided atomically at insert time, never by an
//! application-level check-then-act.

use std::path::PathBuf;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::{Assignment, Test, TestStatus, Variant};
use crate::error::EngineError;

/// Counter increments applied to an assignment and its variant in one
/// recorded event. All fields are additive; nothing ever decrements.
#[derive(Clone, Copy, Debug, Default)]
pub struct CounterDelta {
    pub impressions: u64,
    pub clicks: u64,
    pub views: u64,
    pub conversions: u64,
    pub revenue: f64,
}

/// Tagged outcome of an atomic conditional insert.
#[derive(Clone, Debug)]
pub enum AssignOutcome {
    Inserted(Assignment),
    Existing(Assignment),
}

impl AssignOutcome {
    pub fn assignment(&self) -> &Assignment {
        match self {
            AssignOutcome::Inserted(a) | AssignOutcome::Existing(a) => a,
        }
    }
}

pub trait Store: Send + Sync {
    fn create_test(&self, test: Test, variants: Vec<Variant>) -> Result<(), EngineError>;
    fn get_test(&self, id: &str) -> Result<Test, EngineError>;
    fn update_test(&self, test: &Test) -> Result<(), EngineError>;
    fn delete_test(&self, id: &str) -> Result<(), EngineError>;
    fn list_recent(&self, limit: usize) -> Vec<Test>;
    fn count_tests(&self, status: Option<TestStatus>) -> usize;

    /// Variants of a test in insertion order. Assignment depends on this
    /// order being stable across calls.
    fn variants_for_test(&self, test_id: &str) -> Result<Vec<Variant>, EngineError>;
    fn add_variant(&self, variant: Variant) -> Result<(), EngineError>;
    fn update_variant(&self, variant: &Variant) -> Result<(), EngineError>;
    fn remove_variant(&self, test_id: &str, variant_id: &str) -> Result<(), EngineError>;
    /// Atomic per-field increment on a variant's counters.
    fn apply_variant_delta(
        &self,
        test_id: &str,
        variant_id: &str,
        delta: &CounterDelta,
    ) -> Result<(), EngineError>;

    fn find_assignment(&self, test_id: &str, entity_id: &str) -> Option<Assignment>;
    /// Insert if no assignment exists for (test, entity); otherwise return
    /// the existing one. Must be atomic under concurrent first-touch.
    fn create_assignment_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<AssignOutcome, EngineError>;
    /// Atomic per-field increment on an assignment's counters, also
    /// stamping the last-event time.
    fn apply_assignment_delta(
        &self,
        test_id: &str,
        entity_id: &str,
        delta: &CounterDelta,
        at: i64,
    ) -> Result<(), EngineError>;
    fn count_assignments(&self, test_id: &str) -> usize;
    fn total_assignments(&self) -> usize;
}

/// On-disk shape: a test and its variants in one document. Assignments are
/// hot-path state and stay in memory; counter totals land on disk whenever
/// a definition or lifecycle write flushes the record.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestRecord {
    test: Test,
    variants: Vec<Variant>,
}

pub struct MemoryStore {
    tests: DashMap<String, Test>,
    // Keyed by test id; Vec preserves variant insertion order.
    variants: DashMap<String, Vec<Variant>>,
    assignments: DashMap<(String, String), Assignment>,
    dir: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tests: DashMap::new(),
            variants: DashMap::new(),
            assignments: DashMap::new(),
            dir: None,
        }
    }

    /// Opens a store that mirrors test definitions under
    /// `data_dir/.experiments`, loading and validating any existing
    /// records.
    pub fn open(data_dir: &std::path::Path) -> Result<Self, EngineError> {
        let dir = data_dir.join(".experiments");
        std::fs::create_dir_all(&dir)?;
        let store = Self {
            tests: DashMap::new(),
            variants: DashMap::new(),
            assignments: DashMap::new(),
            dir: Some(dir),
        };
        store.load_all()?;
        Ok(store)
    }

    fn load_all(&self) -> Result<(), EngineError> {
        let dir = match &self.dir {
            Some(d) => d,
            None => return Ok(()),
        };
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(&path)?;
            let record: TestRecord = serde_json::from_str(&data)?;
            record.test.validate()?;
            self.variants
                .insert(record.test.id.clone(), record.variants);
            self.tests.insert(record.test.id.clone(), record.test);
        }
        Ok(())
    }

    /// Writes the record to disk before any in-memory state changes, so a
    /// failed write leaves both sides exactly as they were.
    fn persist_record(&self, test: &Test, variants: &[Variant]) -> Result<(), EngineError> {
        let dir = match &self.dir {
            Some(d) => d,
            None => return Ok(()),
        };
        let record = TestRecord {
            test: test.clone(),
            variants: variants.to_vec(),
        };
        let tmp_path = dir.join(format!("{}.json.tmp", test.id));
        let final_path = dir.join(format!("{}.json", test.id));
        let data = serde_json::to_string_pretty(&record)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl Store for MemoryStore {
    fn create_test(&self, test: Test, variants: Vec<Variant>) -> Result<(), EngineError> {
        if self.tests.contains_key(&test.id) {
            return Err(EngineError::AlreadyExists(test.id));
        }
        self.persist_record(&test, &variants)?;
        self.variants.insert(test.id.clone(), variants);
        self.tests.insert(test.id.clone(), test);
        Ok(())
    }

    fn get_test(&self, id: &str) -> Result<Test, EngineError> {
        self.tests
            .get(id)
            .map(|t| t.clone())
            .ok_or_else(|| EngineError::TestNotFound(id.to_string()))
    }

    fn update_test(&self, test: &Test) -> Result<(), EngineError> {
        if !self.tests.contains_key(&test.id) {
            return Err(EngineError::TestNotFound(test.id.clone()));
        }
        let variants = self
            .variants
            .get(&test.id)
            .map(|v| v.clone())
            .unwrap_or_default();
        self.persist_record(test, &variants)?;
        self.tests.insert(test.id.clone(), test.clone());
        Ok(())
    }

    fn delete_test(&self, id: &str) -> Result<(), EngineError> {
        if !self.tests.contains_key(id) {
            return Err(EngineError::TestNotFound(id.to_string()));
        }
        // Disk first, memory second, same as the write paths.
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", id));
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        self.tests.remove(id);
        self.variants.remove(id);
        self.assignments.retain(|(test_id, _), _| test_id != id);
        Ok(())
    }

    fn list_recent(&self, limit: usize) -> Vec<Test> {
        let mut tests: Vec<Test> = self.tests.iter().map(|e| e.value().clone()).collect();
        tests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tests.truncate(limit);
        tests
    }

    fn count_tests(&self, status: Option<TestStatus>) -> usize {
        match status {
            None => self.tests.len(),
            Some(s) => self
                .tests
                .iter()
                .filter(|e| e.value().status == s)
                .count(),
        }
    }

    fn variants_for_test(&self, test_id: &str) -> Result<Vec<Variant>, EngineError> {
        if !self.tests.contains_key(test_id) {
            return Err(EngineError::TestNotFound(test_id.to_string()));
        }
        Ok(self
            .variants
            .get(test_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    fn add_variant(&self, variant: Variant) -> Result<(), EngineError> {
        let test = self.get_test(&variant.test_id)?;
        let mut entry = self.variants.entry(variant.test_id.clone()).or_default();
        let mut next = entry.clone();
        next.push(variant);
        self.persist_record(&test, &next)?;
        *entry = next;
        Ok(())
    }

    fn update_variant(&self, variant: &Variant) -> Result<(), EngineError> {
        let test = self.get_test(&variant.test_id)?;
        let mut entry = self
            .variants
            .get_mut(&variant.test_id)
            .ok_or_else(|| EngineError::TestNotFound(variant.test_id.clone()))?;
        let idx = entry
            .iter()
            .position(|v| v.id == variant.id)
            .ok_or_else(|| EngineError::VariantNotFound(variant.id.clone()))?;
        let mut next = entry.clone();
        next[idx] = variant.clone();
        self.persist_record(&test, &next)?;
        *entry = next;
        Ok(())
    }

    fn remove_variant(&self, test_id: &str, variant_id: &str) -> Result<(), EngineError> {
        let test = self.get_test(test_id)?;
        let mut entry = self
            .variants
            .get_mut(test_id)
            .ok_or_else(|| EngineError::TestNotFound(test_id.to_string()))?;
        if !entry.iter().any(|v| v.id == variant_id) {
            return Err(EngineError::VariantNotFound(variant_id.to_string()));
        }
        let next: Vec<Variant> = entry
            .iter()
            .filter(|v| v.id != variant_id)
            .cloned()
            .collect();
        self.persist_record(&test, &next)?;
        *entry = next;
        Ok(())
    }

    fn apply_variant_delta(
        &self,
        test_id: &str,
        variant_id: &str,
        delta: &CounterDelta,
    ) -> Result<(), EngineError> {
        // Mutation happens under the shard lock, so concurrent events on
        // the same variant never lose increments.
        let mut entry = self
            .variants
            .get_mut(test_id)
            .ok_or_else(|| EngineError::TestNotFound(test_id.to_string()))?;
        let variant = entry
            .iter_mut()
            .find(|v| v.id == variant_id)
            .ok_or_else(|| EngineError::VariantNotFound(variant_id.to_string()))?;
        variant.impressions += delta.impressions;
        variant.clicks += delta.clicks;
        variant.views += delta.views;
        variant.sales += delta.conversions;
        variant.revenue += delta.revenue;
        Ok(())
    }

    fn find_assignment(&self, test_id: &str, entity_id: &str) -> Option<Assignment> {
        self.assignments
            .get(&(test_id.to_string(), entity_id.to_string()))
            .map(|a| a.clone())
    }

    fn create_assignment_if_absent(
        &self,
        assignment: Assignment,
    ) -> Result<AssignOutcome, EngineError> {
        let key = (assignment.test_id.clone(), assignment.entity_id.clone());
        match self.assignments.entry(key) {
            Entry::Occupied(existing) => Ok(AssignOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(assignment.clone());
                Ok(AssignOutcome::Inserted(assignment))
            }
        }
    }

    fn apply_assignment_delta(
        &self,
        test_id: &str,
        entity_id: &str,
        delta: &CounterDelta,
        at: i64,
    ) -> Result<(), EngineError> {
        let key = (test_id.to_string(), entity_id.to_string());
        let mut assignment = self.assignments.get_mut(&key).ok_or_else(|| {
            EngineError::AssignmentNotFound(format!("{}/{}", test_id, entity_id))
        })?;
        assignment.impressions += delta.impressions;
        assignment.clicks += delta.clicks;
        assignment.views += delta.views;
        assignment.conversions += delta.conversions;
        assignment.revenue += delta.revenue;
        assignment.last_event_at = Some(at);
        Ok(())
    }

    fn count_assignments(&self, test_id: &str) -> usize {
        self.assignments
            .iter()
            .filter(|e| e.key().0 == test_id)
            .count()
    }

    fn total_assignments(&self) -> usize {
        self.assignments.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{now_ms, PrimaryMetric};
    use indexmap::IndexMap;
    use tempfile::TempDir;

    fn make_test(id: &str) -> Test {
        Test {
            id: id.to_string(),
            name: "price badge test".to_string(),
            description: String::new(),
            entity_kind: "listing".to_string(),
            target_field: "badge".to_string(),
            filters: IndexMap::new(),
            traffic_percent: 100.0,
            start_at: None,
            end_at: None,
            primary_metric: PrimaryMetric::ConversionRate,
            secondary_metrics: Vec::new(),
            min_sample_size: 100,
            confidence_level: 0.95,
            status: crate::config::TestStatus::Draft,
            winning_variant_id: None,
            is_significant: None,
            conclusion: None,
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
        }
    }

    fn make_variant(id: &str, test_id: &str, is_control: bool) -> Variant {
        Variant {
            id: id.to_string(),
            test_id: test_id.to_string(),
            name: id.to_string(),
            is_control,
            changes: IndexMap::new(),
            weight: 50,
            impressions: 0,
            clicks: 0,
            views: 0,
            sales: 0,
            revenue: 0.0,
        }
    }

    fn make_assignment(test_id: &str, entity_id: &str, variant_id: &str) -> Assignment {
        Assignment {
            id: format!("a-{}", entity_id),
            test_id: test_id.to_string(),
            variant_id: variant_id.to_string(),
            entity_id: entity_id.to_string(),
            entity_kind: "listing".to_string(),
            impressions: 0,
            clicks: 0,
            views: 0,
            conversions: 0,
            revenue: 0.0,
            assigned_at: now_ms(),
            last_event_at: None,
        }
    }

    #[test]
    fn create_and_get_roundtrips() {
        let store = MemoryStore::new();
        store
            .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
            .unwrap();
        assert_eq!(store.get_test("t1").unwrap().name, "price badge test");
        assert_eq!(store.variants_for_test("t1").unwrap().len(), 1);
    }

    #[test]
    fn create_duplicate_id_fails() {
        let store = MemoryStore::new();
        store.create_test(make_test("t1"), Vec::new()).unwrap();
        assert!(matches!(
            store.create_test(make_test("t1"), Vec::new()),
            Err(EngineError::AlreadyExists(_))
        ));
    }

    #[test]
    fn get_missing_test_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_test("ghost"),
            Err(EngineError::TestNotFound(_))
        ));
    }

    #[test]
    fn variants_keep_insertion_order() {
        let store = MemoryStore::new();
        store.create_test(make_test("t1"), Vec::new()).unwrap();
        for name in ["control", "blue", "green"] {
            store.add_variant(make_variant(name, "t1", false)).unwrap();
        }
        let ids: Vec<String> = store
            .variants_for_test("t1")
            .unwrap()
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, vec!["control", "blue", "green"]);
    }

    #[test]
    fn conditional_insert_returns_existing_on_second_call() {
        let store = MemoryStore::new();
        let first = store
            .create_assignment_if_absent(make_assignment("t1", "e1", "v1"))
            .unwrap();
        assert!(matches!(first, AssignOutcome::Inserted(_)));
        let second = store
            .create_assignment_if_absent(make_assignment("t1", "e1", "v2"))
            .unwrap();
        match second {
            AssignOutcome::Existing(a) => assert_eq!(a.variant_id, "v1"),
            other => panic!("expected Existing, got {:?}", other),
        }
    }

    #[test]
    fn conditional_insert_is_atomic_under_contention() {
        use std::sync::Arc;
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let variant = format!("v{}", i);
                let outcome = store
                    .create_assignment_if_absent(make_assignment("t1", "e1", &variant))
                    .unwrap();
                outcome.assignment().variant_id.clone()
            }));
        }
        let winners: std::collections::HashSet<String> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(winners.len(), 1, "all threads must see one binding");
        assert_eq!(store.count_assignments("t1"), 1);
    }

    #[test]
    fn variant_delta_maps_conversions_to_sales() {
        let store = MemoryStore::new();
        store
            .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
            .unwrap();
        let delta = CounterDelta {
            conversions: 2,
            revenue: 19.98,
            ..Default::default()
        };
        store.apply_variant_delta("t1", "v1", &delta).unwrap();
        let v = &store.variants_for_test("t1").unwrap()[0];
        assert_eq!(v.sales, 2);
        assert_eq!(v.views, 0);
        assert!((v.revenue - 19.98).abs() < 1e-9);
    }

    #[test]
    fn assignment_delta_updates_last_event_time() {
        let store = MemoryStore::new();
        store
            .create_assignment_if_absent(make_assignment("t1", "e1", "v1"))
            .unwrap();
        let delta = CounterDelta {
            clicks: 1,
            ..Default::default()
        };
        store
            .apply_assignment_delta("t1", "e1", &delta, 1234)
            .unwrap();
        let a = store.find_assignment("t1", "e1").unwrap();
        assert_eq!(a.clicks, 1);
        assert_eq!(a.last_event_at, Some(1234));
    }

    #[test]
    fn delete_test_removes_variants_and_assignments() {
        let store = MemoryStore::new();
        store
            .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
            .unwrap();
        store
            .create_assignment_if_absent(make_assignment("t1", "e1", "v1"))
            .unwrap();
        store.delete_test("t1").unwrap();
        assert!(store.get_test("t1").is_err());
        assert_eq!(store.total_assignments(), 0);
    }

    #[test]
    fn list_recent_orders_by_created_at_desc() {
        let store = MemoryStore::new();
        let mut old = make_test("old");
        old.created_at = 1000;
        let mut new = make_test("new");
        new.created_at = 2000;
        store.create_test(old, Vec::new()).unwrap();
        store.create_test(new, Vec::new()).unwrap();
        let recent = store.list_recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "new");
    }

    #[test]
    fn count_tests_filters_by_status() {
        let store = MemoryStore::new();
        let mut running = make_test("r1");
        running.status = crate::config::TestStatus::Running;
        store.create_test(running, Vec::new()).unwrap();
        store.create_test(make_test("d1"), Vec::new()).unwrap();
        assert_eq!(store.count_tests(None), 2);
        assert_eq!(
            store.count_tests(Some(crate::config::TestStatus::Running)),
            1
        );
    }

    #[test]
    fn tests_persist_across_store_restart() {
        let tmp = TempDir::new().unwrap();
        {
            let store = MemoryStore::open(tmp.path()).unwrap();
            store
                .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
                .unwrap();
        }
        let store2 = MemoryStore::open(tmp.path()).unwrap();
        assert_eq!(store2.get_test("t1").unwrap().id, "t1");
        assert_eq!(store2.variants_for_test("t1").unwrap().len(), 1);
    }

    #[test]
    fn failed_write_leaves_no_phantom_state() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::open(tmp.path()).unwrap();
        let dir = tmp.path().join(".experiments");

        // Occupy the tmp path with a directory so the record write fails.
        std::fs::create_dir_all(dir.join("t1.json.tmp")).unwrap();
        let result = store.create_test(make_test("t1"), vec![make_variant("v1", "t1", true)]);
        assert!(matches!(result, Err(EngineError::Io(_))));

        // The failed create must not be visible in memory, and a retry
        // must not be refused as a duplicate once the write can succeed.
        assert!(matches!(
            store.get_test("t1"),
            Err(EngineError::TestNotFound(_))
        ));
        std::fs::remove_dir(dir.join("t1.json.tmp")).unwrap();
        store
            .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
            .unwrap();
        assert_eq!(store.get_test("t1").unwrap().id, "t1");
    }

    #[test]
    fn failed_write_keeps_prior_variant_list() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::open(tmp.path()).unwrap();
        let dir = tmp.path().join(".experiments");
        store
            .create_test(make_test("t1"), vec![make_variant("v1", "t1", true)])
            .unwrap();

        std::fs::create_dir_all(dir.join("t1.json.tmp")).unwrap();
        let result = store.add_variant(make_variant("v2", "t1", false));
        assert!(matches!(result, Err(EngineError::Io(_))));
        assert_eq!(store.variants_for_test("t1").unwrap().len(), 1);

        std::fs::remove_dir(dir.join("t1.json.tmp")).unwrap();
        store.add_variant(make_variant("v2", "t1", false)).unwrap();
        assert_eq!(store.variants_for_test("t1").unwrap().len(), 2);
    }

    #[test]
    fn open_rejects_invalid_record_on_disk() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".experiments");
        std::fs::create_dir_all(&dir).unwrap();
        let mut bad = make_test("bad");
        bad.traffic_percent = 250.0;
        let record = serde_json::json!({ "test": bad, "variants": [] });
        std::fs::write(dir.join("bad.json"), record.to_string()).unwrap();
        assert!(MemoryStore::open(tmp.path()).is_err());
    }
}
