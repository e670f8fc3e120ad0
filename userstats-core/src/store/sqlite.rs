//! SQLite-backed counter store.
//!
//! One connection in WAL mode is shared behind a mutex held for a single
//! statement at a time; per-contributor atomicity comes from the striped
//! [`KeyLocks`]. Closing the store checkpoints the WAL and switches the file
//! back to a rollback journal so that it can be reopened read-only.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, params};

use super::{CounterStore, KeyLocks, StoreError, StoreOptions};
use crate::counters::{ContributorCounters, KindCounters};
use crate::model::{ContributorId, Timestamp};

/// File name used by [`SqliteCounterStore::open_in_dir`].
pub const COUNTER_STORE_FILE_NAME: &str = "contributors.sqlite";

/// Schema version written by this build.
pub const SCHEMA_VERSION: i64 = 1;

/// SQLite side files that belong to a database and must go with it.
const SIDE_FILE_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

const COUNT_COLUMNS: [&str; 12] = [
    "point_total",
    "point_created",
    "point_current",
    "node_total",
    "node_created",
    "node_current",
    "way_total",
    "way_created",
    "way_current",
    "relation_total",
    "relation_created",
    "relation_current",
];

const SELECT_COLUMNS: &str = "contributor_id, display_name, \
    point_total, point_created, point_current, \
    node_total, node_created, node_current, \
    way_total, way_created, way_current, \
    relation_total, relation_created, relation_current, \
    first_activity_ms, last_activity_ms";

/// Counter store persisted in a single SQLite file.
pub struct SqliteCounterStore {
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
    locks: KeyLocks,
}

impl fmt::Debug for SqliteCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteCounterStore")
            .field("path", &self.path)
            .field("open", &self.connection.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl SqliteCounterStore {
    /// Create a fresh store at `path`, destroying any previous store there.
    ///
    /// # Examples
    /// ```
    /// use userstats_core::{CounterStore, SqliteCounterStore};
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let dir = tempfile::tempdir()?;
    /// let store = SqliteCounterStore::open(dir.path().join("counters.sqlite"))?;
    /// assert_eq!(store.count()?, 0);
    /// store.close()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, StoreOptions::default())
    }

    /// Create a fresh store named [`COUNTER_STORE_FILE_NAME`] inside `dir`.
    pub fn open_in_dir(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(dir.as_ref().join(COUNTER_STORE_FILE_NAME))
    }

    /// Create a fresh store at `path` with explicit tunables.
    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        ensure_location(path)?;
        remove_previous_store(path)?;

        let mut connection = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .map_err(|source| open_error(path, source))?;
        configure_connection(&connection).map_err(|source| open_error(path, source))?;
        initialise_schema(&mut connection).map_err(|source| open_error(path, source))?;

        info!("created counter store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(Some(connection)),
            locks: KeyLocks::new(options.lock_stripes, options.lock_timeout),
        })
    }

    /// Reopen a closed store for reading without discarding its contents.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let connection = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| open_error(path, source))?;
        let found: Option<i64> = connection
            .query_row(
                "SELECT version FROM counter_schema_version LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| open_error(path, source))?;
        if found != Some(SCHEMA_VERSION) {
            return Err(StoreError::SchemaVersion {
                expected: SCHEMA_VERSION,
                found,
            });
        }

        let options = StoreOptions::default();
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(Some(connection)),
            locks: KeyLocks::new(options.lock_stripes, options.lock_timeout),
        })
    }

    /// Location of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_connection<T>(
        &self,
        operation: &'static str,
        run: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let guard = self.connection.lock();
        let connection = guard.as_ref().ok_or(StoreError::Closed)?;
        run(connection).map_err(|source| StoreError::Database { operation, source })
    }

    fn write_record(
        &self,
        contributor: ContributorId,
        record: &ContributorCounters,
    ) -> Result<(), StoreError> {
        let counts = stored_counts(contributor, record)?;
        let first = record.first_activity().timestamp_millis();
        let last = record.last_activity().timestamp_millis();
        let [pt, pc, pcur, nt, nc, ncur, wt, wc, wcur, rt, rc, rcur] = counts;
        self.with_connection("write a contributor record", |connection| {
            connection
                .prepare_cached(
                    "INSERT OR REPLACE INTO contributor_counters (
                        contributor_id, display_name,
                        point_total, point_created, point_current,
                        node_total, node_created, node_current,
                        way_total, way_created, way_current,
                        relation_total, relation_created, relation_current,
                        first_activity_ms, last_activity_ms
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                )?
                .execute(params![
                    contributor.get(),
                    record.display_name(),
                    pt,
                    pc,
                    pcur,
                    nt,
                    nc,
                    ncur,
                    wt,
                    wc,
                    wcur,
                    rt,
                    rc,
                    rcur,
                    first,
                    last,
                ])
                .map(|_| ())
        })
    }
}

impl CounterStore for SqliteCounterStore {
    fn get(&self, contributor: ContributorId) -> Result<Option<ContributorCounters>, StoreError> {
        let stored = self.with_connection("read a contributor record", |connection| {
            connection
                .prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS} FROM contributor_counters WHERE contributor_id = ?1"
                ))?
                .query_row([contributor.get()], StoredRow::read)
                .optional()
        })?;
        stored
            .map(|row| row.into_record().map(|(_, record)| record))
            .transpose()
    }

    fn upsert(
        &self,
        contributor: ContributorId,
        record: &ContributorCounters,
    ) -> Result<(), StoreError> {
        let _guard = self.locks.lock(contributor)?;
        self.write_record(contributor, record)
    }

    fn update<F>(&self, contributor: ContributorId, apply: F) -> Result<ContributorCounters, StoreError>
    where
        F: FnOnce(Option<ContributorCounters>) -> ContributorCounters,
    {
        let _guard = self.locks.lock(contributor)?;
        let current = self.get(contributor)?;
        if current.is_none() {
            debug!("creating counters for contributor {contributor}");
        }
        let next = apply(current);
        self.write_record(contributor, &next)?;
        Ok(next)
    }

    fn iterate(
        &self,
    ) -> Result<Box<dyn Iterator<Item = (ContributorId, ContributorCounters)> + Send + '_>, StoreError>
    {
        let rows = self.with_connection("snapshot contributor records", |connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM contributor_counters ORDER BY contributor_id"
            ))?;
            let rows = statement
                .query_map([], StoredRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        let records = rows
            .into_iter()
            .map(StoredRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Box::new(records.into_iter()))
    }

    fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = self.with_connection("count contributor records", |connection| {
            connection.query_row("SELECT COUNT(*) FROM contributor_counters", [], |row| {
                row.get(0)
            })
        })?;
        u64::try_from(count).map_err(|_| StoreError::OutOfRange {
            contributor: ContributorId::ANONYMOUS,
            field: "row count",
        })
    }

    fn close(&self) -> Result<(), StoreError> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        if !connection.is_readonly(rusqlite::DatabaseName::Main).unwrap_or(true) {
            connection
                .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|source| StoreError::Database {
                    operation: "checkpoint the write-ahead log",
                    source,
                })?;
            connection
                .query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))
                .map_err(|source| StoreError::Database {
                    operation: "leave WAL mode",
                    source,
                })?;
        }
        connection
            .close()
            .map_err(|(_, source)| StoreError::Database {
                operation: "close the database",
                source,
            })?;
        info!("closed counter store at {}", self.path.display());
        Ok(())
    }
}

/// Raw column values of one stored record.
struct StoredRow {
    contributor: i64,
    display_name: Option<String>,
    counts: [i64; 12],
    first_activity_ms: i64,
    last_activity_ms: i64,
}

impl StoredRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut counts = [0_i64; 12];
        for (offset, slot) in counts.iter_mut().enumerate() {
            *slot = row.get(offset + 2)?;
        }
        Ok(Self {
            contributor: row.get(0)?,
            display_name: row.get(1)?,
            counts,
            first_activity_ms: row.get(14)?,
            last_activity_ms: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<(ContributorId, ContributorCounters), StoreError> {
        let contributor = ContributorId::new(self.contributor);
        let mut values = [0_u64; 12];
        for ((slot, raw), field) in values.iter_mut().zip(self.counts).zip(COUNT_COLUMNS) {
            *slot = u64::try_from(raw)
                .map_err(|_| StoreError::OutOfRange { contributor, field })?;
        }
        let [pt, pc, pcur, nt, nc, ncur, wt, wc, wcur, rt, rc, rcur] = values;
        let counts = [
            kind_counters(pt, pc, pcur),
            kind_counters(nt, nc, ncur),
            kind_counters(wt, wc, wcur),
            kind_counters(rt, rc, rcur),
        ];
        let first = stored_timestamp(contributor, self.first_activity_ms, "first_activity_ms")?;
        let last = stored_timestamp(contributor, self.last_activity_ms, "last_activity_ms")?;
        let record = ContributorCounters::from_parts(counts, first, last, self.display_name)
            .map_err(|source| StoreError::InvalidRecord {
                contributor,
                source,
            })?;
        Ok((contributor, record))
    }
}

const fn kind_counters(total: u64, created: u64, currently_owned: u64) -> KindCounters {
    KindCounters {
        total,
        created,
        currently_owned,
    }
}

fn stored_timestamp(
    contributor: ContributorId,
    millis: i64,
    field: &'static str,
) -> Result<Timestamp, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(StoreError::OutOfRange { contributor, field })
}

fn stored_counts(
    contributor: ContributorId,
    record: &ContributorCounters,
) -> Result<[i64; 12], StoreError> {
    let mut stored = [0_i64; 12];
    let values = record
        .counts()
        .into_iter()
        .flat_map(|counts| [counts.total, counts.created, counts.currently_owned]);
    for ((slot, value), field) in stored.iter_mut().zip(values).zip(COUNT_COLUMNS) {
        *slot =
            i64::try_from(value).map_err(|_| StoreError::OutOfRange { contributor, field })?;
    }
    Ok(stored)
}

fn open_error(path: &Path, source: rusqlite::Error) -> StoreError {
    StoreError::OpenDatabase {
        path: path.to_path_buf(),
        source,
    }
}

fn ensure_location(path: &Path) -> Result<(), StoreError> {
    let unavailable = |reason| StoreError::Unavailable {
        path: path.to_path_buf(),
        reason,
    };
    if path.is_dir() {
        return Err(unavailable("store path is a directory"));
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let metadata = fs::metadata(parent)
        .map_err(|_| unavailable("containing directory does not exist"))?;
    if !metadata.is_dir() {
        return Err(unavailable("containing path is not a directory"));
    }
    if metadata.permissions().readonly() {
        return Err(unavailable("containing directory is read-only"));
    }
    Ok(())
}

fn remove_previous_store(path: &Path) -> Result<(), StoreError> {
    let side_files = SIDE_FILE_SUFFIXES.iter().map(|suffix| {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    });
    for candidate in std::iter::once(path.to_path_buf()).chain(side_files) {
        match fs::remove_file(&candidate) {
            Ok(()) => debug!("removed previous store file {}", candidate.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StoreError::RemoveStale {
                    path: candidate,
                    source,
                });
            }
        }
    }
    Ok(())
}

fn configure_connection(connection: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!("counter store journal mode: {mode}");
    connection.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

fn initialise_schema(connection: &mut Connection) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    create_tables(&transaction)?;
    transaction.execute(
        "INSERT INTO counter_schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    transaction.commit()
}

fn create_tables(transaction: &Transaction<'_>) -> rusqlite::Result<()> {
    transaction.execute(
        "CREATE TABLE contributor_counters (
            contributor_id INTEGER PRIMARY KEY,
            display_name TEXT,
            point_total INTEGER NOT NULL CHECK (point_total >= 0),
            point_created INTEGER NOT NULL CHECK (point_created >= 0),
            point_current INTEGER NOT NULL CHECK (point_current >= 0),
            node_total INTEGER NOT NULL CHECK (node_total >= 0),
            node_created INTEGER NOT NULL CHECK (node_created >= 0),
            node_current INTEGER NOT NULL CHECK (node_current >= 0),
            way_total INTEGER NOT NULL CHECK (way_total >= 0),
            way_created INTEGER NOT NULL CHECK (way_created >= 0),
            way_current INTEGER NOT NULL CHECK (way_current >= 0),
            relation_total INTEGER NOT NULL CHECK (relation_total >= 0),
            relation_created INTEGER NOT NULL CHECK (relation_created >= 0),
            relation_current INTEGER NOT NULL CHECK (relation_current >= 0),
            first_activity_ms INTEGER NOT NULL,
            last_activity_ms INTEGER NOT NULL CHECK (last_activity_ms >= first_activity_ms)
        )",
        [],
    )?;
    transaction.execute(
        "CREATE TABLE counter_schema_version (
            version INTEGER PRIMARY KEY CHECK (version > 0),
            created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
        [],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FeatureKind;
    use chrono::TimeZone;
    use rstest::{fixture, rstest};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn at(day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2014, 5, day, 8, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    fn sample_record() -> ContributorCounters {
        let mut record = ContributorCounters::new(at(2));
        record.record_activity(at(9));
        record.kind_mut(FeatureKind::Node).total = 4;
        record.kind_mut(FeatureKind::Node).created = 2;
        record.kind_mut(FeatureKind::Relation).currently_owned = 1;
        record.set_display_name(Some("mapper"));
        record
    }

    #[rstest]
    fn missing_records_read_as_none(temp_dir: TempDir) {
        let store = SqliteCounterStore::open_in_dir(temp_dir.path()).expect("open store");
        let found = store.get(ContributorId::new(1)).expect("read");
        assert!(found.is_none());
    }

    #[rstest]
    fn upsert_then_get_round_trips(temp_dir: TempDir) {
        let store = SqliteCounterStore::open_in_dir(temp_dir.path()).expect("open store");
        let record = sample_record();
        store
            .upsert(ContributorId::new(7), &record)
            .expect("upsert");
        let stored = store.get(ContributorId::new(7)).expect("read");
        assert_eq!(stored, Some(record));
        assert_eq!(store.count().expect("count"), 1);
    }

    #[rstest]
    fn open_discards_previous_contents(temp_dir: TempDir) {
        let path = temp_dir.path().join("counters.sqlite");
        let first = SqliteCounterStore::open(&path).expect("open store");
        first
            .upsert(ContributorId::new(1), &sample_record())
            .expect("upsert");
        first.close().expect("close");

        let second = SqliteCounterStore::open(&path).expect("reopen fresh");
        assert_eq!(second.count().expect("count"), 0);
    }

    #[rstest]
    fn missing_directory_is_unavailable(temp_dir: TempDir) {
        let path = temp_dir.path().join("absent").join("counters.sqlite");
        let err = SqliteCounterStore::open(&path).expect_err("missing parent");
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[rstest]
    fn directory_path_is_unavailable(temp_dir: TempDir) {
        let err = SqliteCounterStore::open(temp_dir.path()).expect_err("directory path");
        assert!(matches!(err, StoreError::Unavailable { .. }));
    }

    #[rstest]
    fn closed_store_rejects_operations(temp_dir: TempDir) {
        let store = SqliteCounterStore::open_in_dir(temp_dir.path()).expect("open store");
        store.close().expect("close");
        store.close().expect("second close is a no-op");
        assert!(matches!(
            store.get(ContributorId::new(1)),
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.upsert(ContributorId::new(1), &sample_record()),
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.count(), Err(StoreError::Closed)));
        assert!(store.iterate().is_err());
    }

    #[rstest]
    fn iterate_is_ordered_and_restartable(temp_dir: TempDir) {
        let store = SqliteCounterStore::open_in_dir(temp_dir.path()).expect("open store");
        for id in [30, 10, 20] {
            store
                .upsert(ContributorId::new(id), &sample_record())
                .expect("upsert");
        }
        let ids = |store: &SqliteCounterStore| -> Vec<i64> {
            store
                .iterate()
                .expect("iterate")
                .map(|(id, _)| id.get())
                .collect()
        };
        assert_eq!(ids(&store), vec![10, 20, 30]);
        assert_eq!(ids(&store), vec![10, 20, 30]);
    }

    #[rstest]
    fn read_only_reopen_sees_closed_contents(temp_dir: TempDir) {
        let path = temp_dir.path().join(COUNTER_STORE_FILE_NAME);
        let store = SqliteCounterStore::open(&path).expect("open store");
        store
            .upsert(ContributorId::new(3), &sample_record())
            .expect("upsert");
        let before: Vec<_> = store.iterate().expect("iterate").collect();
        store.close().expect("close");

        let reopened = SqliteCounterStore::open_read_only(&path).expect("reopen");
        let after: Vec<_> = reopened.iterate().expect("iterate").collect();
        assert_eq!(before, after);
    }

    #[rstest]
    fn read_only_open_rejects_foreign_database(temp_dir: TempDir) {
        let path = temp_dir.path().join("other.sqlite");
        let connection = Connection::open(&path).expect("create database");
        connection
            .execute("CREATE TABLE counter_schema_version (version INTEGER)", [])
            .expect("create table");
        connection
            .execute("INSERT INTO counter_schema_version (version) VALUES (9)", [])
            .expect("insert version");
        drop(connection);

        let err = SqliteCounterStore::open_read_only(&path).expect_err("version mismatch");
        assert!(matches!(
            err,
            StoreError::SchemaVersion {
                found: Some(9),
                ..
            }
        ));
    }

    #[rstest]
    fn concurrent_updates_to_one_key_are_not_lost(temp_dir: TempDir) {
        let store = Arc::new(SqliteCounterStore::open_in_dir(temp_dir.path()).expect("open store"));
        let contributor = ContributorId::new(42);
        let workers: Vec<_> = FeatureKind::ALL
            .into_iter()
            .map(|kind| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..50 {
                        store
                            .update(contributor, |current| {
                                let mut record =
                                    current.unwrap_or_else(|| ContributorCounters::new(at(1)));
                                record.kind_mut(kind).total += 1;
                                record
                            })
                            .expect("update");
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker thread");
        }

        let record = store
            .get(contributor)
            .expect("read")
            .expect("record exists");
        assert_eq!(record.total_features(), 200);
        for kind in FeatureKind::ALL {
            assert_eq!(record.kind(kind).total, 50);
        }
    }
}
