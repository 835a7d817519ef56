//! Storage contracts consumed by the detection pipeline.
//!
//! The detector and scheduler only ever see these three traits, injected
//! through their constructors. [`MemoryStore`] implements all of them in
//! memory; [`SqliteStore`](crate::SqliteStore) implements them over SQLite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use rstar::{RTree, RTreeObject, AABB};

use crate::error::{Result, SummitError};
use crate::{Activity, ActivityId, Bounds, Summit, SummitId, SummitRecord, UserId};

/// Read/write access to activities.
pub trait ActivityRepository: Send + Sync {
    /// Activities whose `processed` flag is false.
    fn unprocessed_activities(&self) -> Result<Vec<Activity>>;

    /// A single activity, `None` if it does not exist.
    fn activity_by_id(&self, id: ActivityId) -> Result<Option<Activity>>;

    /// Persist the engine-owned flags (`has_summit`, `processed`).
    ///
    /// Never creates activities: an unknown id is
    /// [`SummitError::ActivityNotFound`].
    fn save_activity(&self, activity: &Activity) -> Result<()>;
}

/// Spatial lookup into the summit catalog.
pub trait SummitCatalog: Send + Sync {
    /// Summits whose coordinates fall inside `bounds` (edges inclusive).
    fn summits_within_bounds(&self, bounds: &Bounds) -> Result<Vec<Summit>>;
}

/// Durable summit records.
pub trait SummitRecordStore: Send + Sync {
    /// Insert a record, or refresh `summited_at` if the
    /// (user, summit, activity) key already exists.
    fn upsert_summit_record(&self, record: &SummitRecord) -> Result<()>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Summit entry for R-tree spatial indexing, keyed by (lng, lat).
#[derive(Debug, Clone)]
struct SummitEntry {
    summit: Summit,
}

impl RTreeObject for SummitEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.summit.longitude, self.summit.latitude])
    }
}

/// In-memory implementation of all three storage contracts.
///
/// Summits live in an R-tree so bounding-box queries are envelope lookups.
/// The catalog and the record store can be switched off, and saves can be
/// made to fail for chosen activities, to simulate outages.
pub struct MemoryStore {
    activities: Mutex<HashMap<ActivityId, Activity>>,
    summits: Mutex<RTree<SummitEntry>>,
    records: Mutex<HashMap<(UserId, SummitId, ActivityId), SummitRecord>>,
    failing_saves: Mutex<HashSet<ActivityId>>,
    catalog_available: AtomicBool,
    records_available: AtomicBool,
    catalog_queries: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            activities: Mutex::new(HashMap::new()),
            summits: Mutex::new(RTree::new()),
            records: Mutex::new(HashMap::new()),
            failing_saves: Mutex::new(HashSet::new()),
            catalog_available: AtomicBool::new(true),
            records_available: AtomicBool::new(true),
            catalog_queries: AtomicU32::new(0),
        }
    }

    /// Build a store with a pre-loaded summit catalog.
    pub fn with_summits(summits: Vec<Summit>) -> Self {
        let store = Self::new();
        let entries = summits.into_iter().map(|summit| SummitEntry { summit }).collect();
        if let Ok(mut tree) = store.summits.lock() {
            *tree = RTree::bulk_load(entries);
        }
        store
    }

    /// Insert or replace an activity.
    pub fn add_activity(&self, activity: Activity) {
        if let Ok(mut activities) = self.activities.lock() {
            activities.insert(activity.id, activity);
        }
    }

    /// Add a summit to the catalog.
    pub fn add_summit(&self, summit: Summit) {
        if let Ok(mut tree) = self.summits.lock() {
            tree.insert(SummitEntry { summit });
        }
    }

    /// Snapshot of one activity.
    pub fn activity(&self, id: ActivityId) -> Option<Activity> {
        self.activities.lock().ok()?.get(&id).cloned()
    }

    /// Snapshot of all summit records, sorted by key.
    pub fn records(&self) -> Vec<SummitRecord> {
        let mut records: Vec<SummitRecord> = self
            .records
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|r| r.key());
        records
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Number of bounding-box queries the catalog has answered or refused.
    pub fn catalog_queries(&self) -> u32 {
        self.catalog_queries.load(Ordering::Relaxed)
    }

    /// Simulate a catalog outage (`false`) or recovery (`true`).
    pub fn set_catalog_available(&self, available: bool) {
        self.catalog_available.store(available, Ordering::Relaxed);
    }

    /// Simulate a record store outage (`false`) or recovery (`true`).
    pub fn set_records_available(&self, available: bool) {
        self.records_available.store(available, Ordering::Relaxed);
    }

    /// Make every later `save_activity` for `id` fail with a storage error.
    pub fn fail_saves_for(&self, id: ActivityId) {
        if let Ok(mut failing) = self.failing_saves.lock() {
            failing.insert(id);
        }
    }

    /// Clear all records and reset the flags on every activity.
    pub fn reset_detection(&self) -> Result<usize> {
        lock(&self.records)?.clear();
        let mut activities = lock(&self.activities)?;
        for activity in activities.values_mut() {
            activity.processed = false;
            activity.has_summit = false;
        }
        Ok(activities.len())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| SummitError::storage("in-memory store lock poisoned"))
}

impl ActivityRepository for MemoryStore {
    fn unprocessed_activities(&self) -> Result<Vec<Activity>> {
        let mut pending: Vec<Activity> = lock(&self.activities)?
            .values()
            .filter(|a| !a.processed)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.id);
        Ok(pending)
    }

    fn activity_by_id(&self, id: ActivityId) -> Result<Option<Activity>> {
        Ok(lock(&self.activities)?.get(&id).cloned())
    }

    fn save_activity(&self, activity: &Activity) -> Result<()> {
        if lock(&self.failing_saves)?.contains(&activity.id) {
            return Err(SummitError::storage(format!(
                "save rejected for activity {}",
                activity.id
            )));
        }

        let mut activities = lock(&self.activities)?;
        let stored = activities
            .get_mut(&activity.id)
            .ok_or(SummitError::ActivityNotFound(activity.id))?;
        stored.has_summit = activity.has_summit;
        stored.processed = activity.processed;
        Ok(())
    }
}

impl SummitCatalog for MemoryStore {
    fn summits_within_bounds(&self, bounds: &Bounds) -> Result<Vec<Summit>> {
        self.catalog_queries.fetch_add(1, Ordering::Relaxed);
        if !self.catalog_available.load(Ordering::Relaxed) {
            return Err(SummitError::CandidateLookup {
                message: "summit catalog unavailable".to_string(),
            });
        }

        let tree = lock(&self.summits)?;
        Ok(tree
            .locate_in_envelope_intersecting(&bounds.envelope())
            .map(|entry| entry.summit.clone())
            .collect())
    }
}

impl SummitRecordStore for MemoryStore {
    fn upsert_summit_record(&self, record: &SummitRecord) -> Result<()> {
        if !self.records_available.load(Ordering::Relaxed) {
            return Err(SummitError::storage("summit record store unavailable"));
        }
        lock(&self.records)?
            .entry(record.key())
            .and_modify(|existing| existing.summited_at = record.summited_at)
            .or_insert_with(|| record.clone());
        Ok(())
    }
}
