//! Dependency store: a variant-partitioned, durable SQLite database holding
//! per-test outcomes and per-file block-checksum dependency lists.
//!
//! Schema is the literal three-table shape this system has always used
//! (`metadata`, `node`, `node_file`), not a reinvention: `node_file` carries
//! a foreign key to `node` with `ON DELETE CASCADE` so garbage-collecting a
//! test automatically drops its file-dependency rows.

use crate::solver::NodeData;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

pub const DATA_FILE_NAME: &str = ".testmondata";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dependency store I/O or schema error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to (de)serialize stored checksums: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One test's recorded outcome: whether it failed last time, and the
/// serialized failure report (empty when it passed).
#[derive(Debug, Clone, Default)]
pub struct TestRecord {
    pub failed: bool,
    pub result_blob: String,
}

pub struct DependencyStore {
    conn: Connection,
    variant: String,
}

impl DependencyStore {
    /// Open (creating if absent) the store at `<rootdir>/.testmondata`,
    /// scoped to `variant`. Nothing here is fatal per §7 except the
    /// underlying connection failing to open at all.
    pub fn open(rootdir: &Path, variant: impl Into<String>) -> Result<Self, StoreError> {
        let path = rootdir.join(DATA_FILE_NAME);
        let is_new = !path.exists();
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA recursive_triggers = TRUE;")?;

        let store = Self {
            conn,
            variant: variant.into(),
        };
        if is_new {
            store.create_schema()?;
        }
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory(variant: impl Into<String>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn,
            variant: variant.into(),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE metadata (dataid TEXT PRIMARY KEY, data TEXT);
             CREATE TABLE node (
                 variant TEXT,
                 name TEXT,
                 result TEXT,
                 failed INTEGER,
                 PRIMARY KEY (variant, name)
             );
             CREATE TABLE node_file (
                 node_variant TEXT,
                 node_name TEXT,
                 file_name TEXT,
                 checksums TEXT,
                 FOREIGN KEY(node_variant, node_name)
                     REFERENCES node(variant, name) ON DELETE CASCADE
             );",
        )?;
        Ok(())
    }

    /// Load all test records for the active variant: `test -> file ->
    /// checksums` plus the failure report for each test that last failed.
    pub fn read_data(&self) -> Result<(NodeData, HashMap<String, TestRecord>), StoreError> {
        let mut node_data: NodeData = HashMap::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT node_name, file_name, checksums FROM node_file WHERE node_variant = ?1",
            )?;
            let mut rows = stmt.query([&self.variant])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let file: String = row.get(1)?;
                let checksums_json: String = row.get(2)?;
                let checksums: Vec<u32> = serde_json::from_str(&checksums_json)?;
                node_data.entry(name).or_default().insert(file, checksums);
            }
        }

        let mut fail_reports = HashMap::new();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT name, result, failed FROM node WHERE variant = ?1")?;
            let mut rows = stmt.query([&self.variant])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(0)?;
                let result: String = row.get(1)?;
                let failed: i64 = row.get(2)?;
                fail_reports.insert(
                    name,
                    TestRecord {
                        failed: failed != 0,
                        result_blob: result,
                    },
                );
            }
        }

        Ok((node_data, fail_reports))
    }

    /// Flush source-tree mtimes and content hashes to the metadata table.
    pub fn write_data(
        &self,
        mtimes: &HashMap<String, f64>,
        checksums: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        self.write_attribute("mtimes", mtimes)?;
        self.write_attribute("file_checksums", checksums)?;
        Ok(())
    }

    pub fn read_mtimes(&self) -> Result<HashMap<String, f64>, StoreError> {
        self.read_attribute("mtimes")
    }

    pub fn read_checksums(&self) -> Result<HashMap<String, String>, StoreError> {
        self.read_attribute("file_checksums")
    }

    fn read_attribute<T: serde::de::DeserializeOwned + Default>(
        &self,
        attribute: &str,
    ) -> Result<T, StoreError> {
        let dataid = format!("{}:{}", self.variant, attribute);
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM metadata WHERE dataid = ?1")?;
        let mut rows = stmt.query([&dataid])?;
        match rows.next()? {
            Some(row) => {
                let data: String = row.get(0)?;
                Ok(serde_json::from_str(&data)?)
            }
            None => Ok(T::default()),
        }
    }

    fn write_attribute<T: serde::Serialize>(
        &self,
        attribute: &str,
        data: &T,
    ) -> Result<(), StoreError> {
        let dataid = format!("{}:{}", self.variant, attribute);
        let json = serde_json::to_string(data)?;
        self.conn.execute(
            "INSERT INTO metadata (dataid, data) VALUES (?1, ?2)
             ON CONFLICT(dataid) DO UPDATE SET data = excluded.data",
            rusqlite::params![dataid, json],
        )?;
        Ok(())
    }

    /// Upsert one test's record and atomically replace its `node_file`
    /// rows. On failure, nothing is left half-written — the whole op runs
    /// in one transaction (§7: `StoreError` aborts persistence for this
    /// test only, the run continues).
    pub fn set_dependencies(
        &mut self,
        test_id: &str,
        dependency_map: &HashMap<String, Vec<u32>>,
        failed: bool,
        result_blob: &str,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            tx.execute(
                "INSERT INTO node (variant, name, result, failed) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(variant, name) DO UPDATE SET result = excluded.result, failed = excluded.failed",
                rusqlite::params![self.variant, test_id, result_blob, failed as i64],
            )?;
            tx.execute(
                "DELETE FROM node_file WHERE node_variant = ?1 AND node_name = ?2",
                rusqlite::params![self.variant, test_id],
            )?;
            for (file_name, checksums) in dependency_map {
                let checksums_json = serde_json::to_string(checksums)?;
                tx.execute(
                    "INSERT INTO node_file (node_variant, node_name, file_name, checksums) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![self.variant, test_id, file_name, checksums_json],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete node (and, via cascade, node_file) rows for test ids no
    /// longer discovered by the runner.
    pub fn collect_garbage(&mut self, removed_test_ids: &[String]) -> Result<(), StoreError> {
        if removed_test_ids.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for test_id in removed_test_ids {
            tx.execute(
                "DELETE FROM node WHERE variant = ?1 AND name = ?2",
                rusqlite::params![self.variant, test_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<(), StoreError> {
        if let Err(e) = self.conn.execute_batch("PRAGMA optimize;") {
            warn!(error = %e, "failed to optimize dependency store on close");
        }
        Ok(())
    }

    /// Counts for the `testmon store info` display.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let (total_tests, failed_tests): (i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(*), SUM(failed) FROM node WHERE variant = ?1",
            [&self.variant],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let total_file_rows: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM node_file WHERE node_variant = ?1",
            [&self.variant],
            |row| row.get(0),
        )?;
        let failed_tests = failed_tests.unwrap_or(0) as usize;
        let total_tests = total_tests as usize;
        Ok(StoreStats {
            total_tests,
            passed_tests: total_tests.saturating_sub(failed_tests),
            failed_tests,
            total_file_rows: total_file_rows as usize,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_tests: usize,
    pub passed_tests: usize,
    pub failed_tests: usize,
    pub total_file_rows: usize,
}
