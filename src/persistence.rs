//! # SQLite Store
//!
//! Implements the activity repository, summit catalog and summit record
//! store over a single SQLite database.
//!
//! ## Tables
//!
//! - `activities`: one row per activity, including its encoded polyline
//!   and the engine-owned `has_summit` / `processed` flags
//! - `summits`: the summit catalog, indexed on (latitude, longitude)
//! - `summit_records`: one row per (user, summit, activity)
//!
//! Timestamps are stored as RFC 3339 text in UTC with a fixed width, so
//! string comparison in SQL orders them chronologically.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, SummitError};
use crate::store::{ActivityRepository, SummitCatalog, SummitRecordStore};
use crate::{Activity, ActivityId, Bounds, Summit, SummitRecord, UserId};

/// SQLite-backed implementation of all three storage contracts.
///
/// The connection is shared behind a mutex so the store can be handed to
/// the detector and the background worker as `Arc<SqliteStore>`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init_schema(&conn)?;
        log::info!(
            "[SqliteStore] Opened database at {}",
            path.as_ref().display()
        );
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        Self::create_tables(conn)?;
        Self::migrate_schema(conn)?;
        Ok(())
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS activities (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                polyline TEXT NOT NULL DEFAULT '',
                start_date TEXT NOT NULL,
                has_summit INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS summits (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                elevation_meters REAL
            );

            CREATE TABLE IF NOT EXISTS summit_records (
                user_id INTEGER NOT NULL,
                summit_id INTEGER NOT NULL,
                activity_id INTEGER NOT NULL,
                summited_at TEXT NOT NULL,
                PRIMARY KEY (user_id, summit_id, activity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_summits_location ON summits(latitude, longitude);
            CREATE INDEX IF NOT EXISTS idx_records_user_time ON summit_records(user_id, summited_at);
            CREATE INDEX IF NOT EXISTS idx_records_activity ON summit_records(activity_id);
        "#,
        )?;
        Ok(())
    }

    /// Bring databases created by older versions up to date. Returns
    /// whether any column had to be added.
    fn migrate_schema(conn: &Connection) -> Result<bool> {
        let has_processed: i64 = conn
            .prepare("SELECT COUNT(*) FROM pragma_table_info('activities') WHERE name = 'processed'")?
            .query_row([], |row| row.get(0))?;

        if has_processed == 0 {
            conn.execute_batch(
                "ALTER TABLE activities ADD COLUMN processed INTEGER NOT NULL DEFAULT 0;",
            )?;
            log::info!("[SqliteStore] Migrated activities table: added processed column");
        }

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_activities_processed ON activities(processed);",
        )?;
        Ok(has_processed == 0)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SummitError::storage("database connection lock poisoned"))
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Insert an activity, replacing any existing row with the same id.
    pub fn insert_activity(&self, activity: &Activity) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO activities (id, user_id, name, polyline, start_date, has_summit, processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                name = excluded.name,
                polyline = excluded.polyline,
                start_date = excluded.start_date,
                has_summit = excluded.has_summit,
                processed = excluded.processed",
            params![
                activity.id,
                activity.user_id,
                activity.name,
                activity.polyline,
                format_timestamp(&activity.start_date),
                activity.has_summit,
                activity.processed,
            ],
        )?;
        Ok(())
    }

    /// Insert a summit into the catalog, replacing any existing row.
    pub fn insert_summit(&self, summit: &Summit) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO summits (id, name, latitude, longitude, elevation_meters)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                summit.id,
                summit.name,
                summit.latitude,
                summit.longitude,
                summit.elevation_meters,
            ],
        )?;
        Ok(())
    }

    // ========================================================================
    // Maintenance and queries
    // ========================================================================

    /// Delete every summit record and mark every activity unprocessed,
    /// so the next sweep recomputes everything. Returns the number of
    /// activities reset.
    pub fn reset_detection(&self) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cleared = tx.execute("DELETE FROM summit_records", [])?;
        let reset = tx.execute("UPDATE activities SET processed = 0, has_summit = 0", [])?;
        tx.commit()?;

        log::info!(
            "[SqliteStore] Reset detection: cleared {} records, reset {} activities",
            cleared,
            reset
        );
        Ok(reset)
    }

    /// Records for one user with `summited_at` in `[from, to]`, newest first.
    pub fn summit_records_for_user(
        &self,
        user_id: UserId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SummitRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, summit_id, activity_id, summited_at FROM summit_records
             WHERE user_id = ?1 AND summited_at >= ?2 AND summited_at <= ?3
             ORDER BY summited_at DESC, summit_id",
        )?;
        let records = stmt
            .query_map(
                params![user_id, format_timestamp(&from), format_timestamp(&to)],
                record_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// All records produced by one activity.
    pub fn summit_records_for_activity(&self, activity_id: ActivityId) -> Result<Vec<SummitRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, summit_id, activity_id, summited_at FROM summit_records
             WHERE activity_id = ?1
             ORDER BY summit_id",
        )?;
        let records = stmt
            .query_map(params![activity_id], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn summit_record_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn()?
                .query_row("SELECT COUNT(*) FROM summit_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SummitRecord> {
    Ok(SummitRecord {
        user_id: row.get(0)?,
        summit_id: row.get(1)?,
        activity_id: row.get(2)?,
        summited_at: timestamp_column(row, 3)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        polyline: row.get(3)?,
        start_date: timestamp_column(row, 4)?,
        has_summit: row.get(5)?,
        processed: row.get(6)?,
    })
}

const ACTIVITY_COLUMNS: &str =
    "id, user_id, name, polyline, start_date, has_summit, processed";

impl ActivityRepository for SqliteStore {
    fn unprocessed_activities(&self) -> Result<Vec<Activity>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM activities WHERE processed = 0 ORDER BY id",
            ACTIVITY_COLUMNS
        ))?;
        let activities = stmt
            .query_map([], activity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(activities)
    }

    fn activity_by_id(&self, id: ActivityId) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        let activity = conn
            .query_row(
                &format!("SELECT {} FROM activities WHERE id = ?1", ACTIVITY_COLUMNS),
                params![id],
                activity_from_row,
            )
            .optional()?;
        Ok(activity)
    }

    fn save_activity(&self, activity: &Activity) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE activities SET has_summit = ?1, processed = ?2 WHERE id = ?3",
            params![activity.has_summit, activity.processed, activity.id],
        )?;
        if updated == 0 {
            return Err(SummitError::ActivityNotFound(activity.id));
        }
        Ok(())
    }
}

impl SummitCatalog for SqliteStore {
    fn summits_within_bounds(&self, bounds: &Bounds) -> Result<Vec<Summit>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, latitude, longitude, elevation_meters FROM summits
             WHERE latitude BETWEEN ?1 AND ?2 AND longitude BETWEEN ?3 AND ?4",
        )?;
        let summits = stmt
            .query_map(
                params![bounds.min_lat, bounds.max_lat, bounds.min_lng, bounds.max_lng],
                |row| {
                    Ok(Summit {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        latitude: row.get(2)?,
                        longitude: row.get(3)?,
                        elevation_meters: row.get(4)?,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(summits)
    }
}

impl SummitRecordStore for SqliteStore {
    fn upsert_summit_record(&self, record: &SummitRecord) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO summit_records (user_id, summit_id, activity_id, summited_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, summit_id, activity_id)
             DO UPDATE SET summited_at = excluded.summited_at",
            params![
                record.user_id,
                record.summit_id,
                record.activity_id,
                format_timestamp(&record.summited_at),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_activity_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let mut activity = Activity::new(5, 2, "_p~iF~ps|U", at(1));
        activity.name = "Morning hike".to_string();
        store.insert_activity(&activity).unwrap();

        let loaded = store.activity_by_id(5).unwrap().unwrap();
        assert_eq!(loaded, activity);
        assert!(store.activity_by_id(6).unwrap().is_none());
    }

    #[test]
    fn test_save_activity_updates_flags_only() {
        let store = SqliteStore::in_memory().unwrap();
        let activity = Activity::new(1, 1, "_p~iF~ps|U", at(1));
        store.insert_activity(&activity).unwrap();

        let mut changed = activity.clone();
        changed.polyline = String::new();
        changed.has_summit = true;
        changed.processed = true;
        store.save_activity(&changed).unwrap();

        let loaded = store.activity_by_id(1).unwrap().unwrap();
        assert_eq!(loaded.polyline, "_p~iF~ps|U");
        assert!(loaded.has_summit);
        assert!(loaded.processed);
        assert!(store.unprocessed_activities().unwrap().is_empty());
    }

    #[test]
    fn test_save_never_creates_activities() {
        let store = SqliteStore::in_memory().unwrap();
        let mut stray = Activity::new(77, 1, "", at(1));
        stray.processed = true;

        let result = store.save_activity(&stray);
        assert!(matches!(result, Err(SummitError::ActivityNotFound(77))));
        assert!(store.activity_by_id(77).unwrap().is_none());
    }

    #[test]
    fn test_fresh_schema_needs_no_migration() {
        let conn = Connection::open_in_memory().unwrap();
        SqliteStore::create_tables(&conn).unwrap();
        assert!(!SqliteStore::migrate_schema(&conn).unwrap());
    }

    #[test]
    fn test_bounds_query_inclusive() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_summit(&Summit::new(1, "edge", 46.0, 7.0)).unwrap();
        store.insert_summit(&Summit::new(2, "outside", 45.99, 7.5)).unwrap();

        let bounds = Bounds {
            min_lat: 46.0,
            max_lat: 46.5,
            min_lng: 7.0,
            max_lng: 7.5,
        };
        let found = store.summits_within_bounds(&bounds).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);
    }

    #[test]
    fn test_upsert_and_reset() {
        let store = SqliteStore::in_memory().unwrap();
        let mut activity = Activity::new(1, 1, "", at(1));
        activity.processed = true;
        activity.has_summit = true;
        store.insert_activity(&activity).unwrap();

        let mut record = SummitRecord {
            user_id: 1,
            summit_id: 9,
            activity_id: 1,
            summited_at: at(1),
        };
        store.upsert_summit_record(&record).unwrap();
        record.summited_at = at(2);
        store.upsert_summit_record(&record).unwrap();

        let records = store.summit_records_for_activity(1).unwrap();
        assert_eq!(records, vec![record]);

        assert_eq!(store.reset_detection().unwrap(), 1);
        assert_eq!(store.summit_record_count().unwrap(), 0);
        let reset = store.activity_by_id(1).unwrap().unwrap();
        assert!(!reset.processed && !reset.has_summit);
    }

    #[test]
    fn test_migrates_legacy_activities_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE activities (
                    id INTEGER PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    name TEXT NOT NULL DEFAULT '',
                    polyline TEXT NOT NULL DEFAULT '',
                    start_date TEXT NOT NULL,
                    has_summit INTEGER NOT NULL DEFAULT 0
                );
                INSERT INTO activities (id, user_id, start_date)
                VALUES (1, 1, '2024-07-01T09:30:00.000000Z');",
            )
            .unwrap();
        }

        {
            let conn = Connection::open(&path).unwrap();
            assert!(SqliteStore::migrate_schema(&conn).unwrap());
        }

        let store = SqliteStore::new(&path).unwrap();
        let pending = store.unprocessed_activities().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].start_date, at(1));

        // Reopening an already migrated database is a no-op
        drop(store);
        assert!(SqliteStore::new(&path).is_ok());
    }
}
