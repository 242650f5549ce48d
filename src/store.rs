//! Staging Store (spec.md C5, §4.5).
//!
//! One SQLite table per sensor series (spec.md §6 "single file per
//! configured database name"), grounded in
//! `services/receiver/src/db.rs`'s `Db` wrapper: `open`/`open_in_memory`,
//! `apply_pragmas`, `apply_schema`. Durability is periodic rather than
//! per-`append` (spec.md §9 open question 3): WAL mode keeps every append
//! crash-safe in its own right, and `commit()` additionally checkpoints
//! the WAL into the main database file so the on-disk file itself is
//! current without a checkpoint.
//!
//! All access is serialised behind a `std::sync::Mutex` (`rusqlite::Connection`
//! is `Send` but not `Sync`) — acceptable per spec.md §4.5's "implementations
//! may serialise all access".

use crate::error::StoreError;
use rusqlite::Connection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// A single stored point (spec.md §3 `Sample`, minus the sensor name).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub time: f64,
    pub value: f64,
}

pub struct Store {
    conn: Mutex<Connection>,
    known_series: Mutex<HashSet<String>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(Store {
            conn: Mutex::new(conn),
            known_series: Mutex::new(HashSet::new()),
        })
    }

    /// Idempotent: creates the series' table if absent (spec.md §4.5).
    pub fn ensure_series(&self, name: &str) -> Result<(), StoreError> {
        let mut known = self.known_series.lock().expect("store mutex poisoned");
        if known.contains(name) {
            return Ok(());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (\
                time REAL NOT NULL, \
                value REAL NOT NULL\
             ); \
             CREATE INDEX IF NOT EXISTS \"{table}_time_idx\" ON \"{table}\" (time);",
            table = quote_identifier(name),
        ))?;
        known.insert(name.to_owned());
        Ok(())
    }

    /// Append a sample. `UnknownSensor` if `ensure_series` was never
    /// called for `name` (spec.md §4.5).
    pub fn append(&self, name: &str, epoch: f64, value: f64) -> Result<(), StoreError> {
        if !self.known_series.lock().expect("store mutex poisoned").contains(name) {
            return Err(StoreError::UnknownSensor(name.to_owned()));
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            &format!(
                "INSERT INTO \"{table}\" (time, value) VALUES (?1, ?2)",
                table = quote_identifier(name)
            ),
            rusqlite::params![epoch, value],
        )?;
        Ok(())
    }

    /// The `n` samples with the greatest epoch, newest-first.
    pub fn top_n(&self, name: &str, n: u32) -> Result<Vec<Point>, StoreError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT time, value FROM \"{table}\" ORDER BY time DESC, rowid DESC LIMIT ?1",
            table = quote_identifier(name)
        ))?;
        let rows = stmt.query_map(rusqlite::params![n], row_to_point)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Samples with `t_lo <= epoch <= t_hi`, in insertion order.
    pub fn range(&self, name: &str, t_lo: f64, t_hi: f64) -> Result<Vec<Point>, StoreError> {
        if t_lo > t_hi {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT time, value FROM \"{table}\" WHERE time >= ?1 AND time <= ?2 \
             ORDER BY time ASC, rowid ASC",
            table = quote_identifier(name)
        ))?;
        let rows = stmt.query_map(rusqlite::params![t_lo, t_hi], row_to_point)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The `n` greatest-epoch samples in `[t_lo, t_hi]`, newest-first.
    pub fn top_n_in_range(
        &self,
        name: &str,
        n: u32,
        t_lo: f64,
        t_hi: f64,
    ) -> Result<Vec<Point>, StoreError> {
        if n == 0 || t_lo > t_hi {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT time, value FROM \"{table}\" WHERE time >= ?1 AND time <= ?2 \
             ORDER BY time DESC, rowid DESC LIMIT ?3",
            table = quote_identifier(name)
        ))?;
        let rows = stmt.query_map(rusqlite::params![t_lo, t_hi, n], row_to_point)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Guarantee durability of all prior `append`s (spec.md §4.5). Called
    /// on a fixed interval by the Controller and once more on shutdown.
    pub fn commit(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}

fn row_to_point(row: &rusqlite::Row<'_>) -> rusqlite::Result<Point> {
    Ok(Point {
        time: row.get(0)?,
        value: row.get(1)?,
    })
}

/// SQLite has no parameter binding for identifiers; sensor names come
/// from configuration (not untrusted network input), so escaping
/// embedded quotes is sufficient to keep the identifier well-formed.
fn quote_identifier(name: &str) -> String {
    name.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_series_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 100.0).unwrap();
        assert_eq!(store.top_n("rpm", 10).unwrap().len(), 1);
    }

    #[test]
    fn append_to_unknown_sensor_fails() {
        let store = Store::open_in_memory().unwrap();
        let err = store.append("missing", 1.0, 1.0).unwrap_err();
        assert!(matches!(err, StoreError::UnknownSensor(name) if name == "missing"));
    }

    #[test]
    fn top_n_returns_newest_first() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 100.0).unwrap();
        store.append("rpm", 2.0, 200.0).unwrap();
        store.append("rpm", 3.0, 300.0).unwrap();

        let top2 = store.top_n("rpm", 2).unwrap();
        assert_eq!(
            top2,
            vec![
                Point { time: 3.0, value: 300.0 },
                Point { time: 2.0, value: 200.0 },
            ]
        );
    }

    #[test]
    fn top_n_zero_is_empty() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 1.0).unwrap();
        assert!(store.top_n("rpm", 0).unwrap().is_empty());
    }

    #[test]
    fn top_n_larger_than_series_returns_entire_series() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 10.0).unwrap();
        store.append("rpm", 2.0, 20.0).unwrap();
        assert_eq!(store.top_n("rpm", 50).unwrap().len(), 2);
    }

    #[test]
    fn range_is_insertion_ordered_and_inclusive() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 10.0).unwrap();
        store.append("rpm", 2.0, 20.0).unwrap();
        store.append("rpm", 3.0, 30.0).unwrap();

        let result = store.range("rpm", 1.0, 2.0).unwrap();
        assert_eq!(
            result,
            vec![
                Point { time: 1.0, value: 10.0 },
                Point { time: 2.0, value: 20.0 },
            ]
        );
    }

    #[test]
    fn range_with_inverted_bounds_is_empty() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        store.append("rpm", 1.0, 10.0).unwrap();
        assert!(store.range("rpm", 5.0, 1.0).unwrap().is_empty());
    }

    #[test]
    fn top_n_in_range_combines_both_filters() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_series("rpm").unwrap();
        for (t, v) in [(1.0, 10.0), (2.0, 20.0), (3.0, 30.0), (4.0, 40.0)] {
            store.append("rpm", t, v).unwrap();
        }
        let result = store.top_n_in_range("rpm", 2, 1.0, 3.0).unwrap();
        assert_eq!(
            result,
            vec![
                Point { time: 3.0, value: 30.0 },
                Point { time: 2.0, value: 20.0 },
            ]
        );
    }

    #[test]
    fn commit_then_reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.sqlite3");

        {
            let store = Store::open(&path).unwrap();
            store.ensure_series("rpm").unwrap();
            store.append("rpm", 5.0, 999.0).unwrap();
            store.commit().unwrap();
        }

        let reopened = Store::open(&path).unwrap();
        reopened.ensure_series("rpm").unwrap();
        let points = reopened.top_n("rpm", 10).unwrap();
        assert_eq!(points, vec![Point { time: 5.0, value: 999.0 }]);
    }
}
