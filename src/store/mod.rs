//! Durable task records and key/value settings.
//!
//! [`TaskStore`] is the seam the queue persists through; [`SqliteStore`] is
//! the implementation used by the binary and by tests (in-memory).

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::Result;
use crate::job::{NewTask, Task, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    input_path TEXT NOT NULL,
    output_path TEXT NOT NULL,
    type TEXT NOT NULL,
    params TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    progress REAL NOT NULL DEFAULT 0,
    error_log TEXT,
    delete_original INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS cancel_requests (
    task_id INTEGER PRIMARY KEY,
    requested_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

const TASK_COLUMNS: &str = "id, input_path, output_path, type, params, status, progress, \
                            error_log, delete_original, created_at, updated_at";

/// Persistence operations the task pipeline depends on
pub trait TaskStore: Send + Sync {
    /// Insert a pending task and return it with its assigned id
    fn create(&self, task: &NewTask) -> Result<Task>;

    fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        progress: f64,
        error: Option<&str>,
    ) -> Result<()>;

    fn update_progress(&self, id: i64, progress: f64) -> Result<()>;

    /// Pending and running tasks, oldest first
    fn list_unfinished(&self) -> Result<Vec<Task>>;

    /// Pending tasks only, oldest first
    fn list_pending(&self) -> Result<Vec<Task>>;

    /// Every task, newest first
    fn list_all(&self) -> Result<Vec<Task>>;

    fn get(&self, id: i64) -> Result<Option<Task>>;

    /// Returns whether a record was removed
    fn delete(&self, id: i64) -> Result<bool>;

    /// Record that another process asked for `id` to be canceled
    fn request_cancel(&self, id: i64) -> Result<()>;

    /// Remove and return outstanding cancel requests, oldest first
    fn take_cancel_requests(&self) -> Result<Vec<i64>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed store; a single connection serialised behind a mutex
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file and ensure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!("Opened task database: {:?}", path);
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic while holding the lock cannot leave the connection half-written
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_tasks(&self, filter: &str) -> Result<Vec<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks {filter}"))?;
        let tasks = stmt
            .query_map([], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(5)?;
    let status = status.parse::<TaskStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })?;

    Ok(Task {
        id: row.get(0)?,
        input_path: PathBuf::from(row.get::<_, String>(1)?),
        output_path: PathBuf::from(row.get::<_, String>(2)?),
        kind: row.get(3)?,
        params: row.get(4)?,
        status,
        progress: row.get(6)?,
        error_log: row.get(7)?,
        delete_original: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl TaskStore for SqliteStore {
    fn create(&self, task: &NewTask) -> Result<Task> {
        let now = Utc::now();
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO tasks (input_path, output_path, type, params, status, progress, \
             delete_original, created_at, updated_at) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )?;
        let id = stmt.insert(params![
            task.input_path.to_string_lossy(),
            task.output_path.to_string_lossy(),
            task.kind,
            task.params,
            TaskStatus::Pending.as_str(),
            task.delete_original,
            now,
            now,
        ])?;
        debug!("Created task {} ({})", id, task.kind);

        Ok(Task {
            id,
            input_path: task.input_path.clone(),
            output_path: task.output_path.clone(),
            kind: task.kind.clone(),
            params: task.params.clone(),
            status: TaskStatus::Pending,
            progress: 0.0,
            error_log: None,
            delete_original: task.delete_original,
            created_at: now,
            updated_at: now,
        })
    }

    fn update_status(
        &self,
        id: i64,
        status: TaskStatus,
        progress: f64,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET status = ?, progress = ?, error_log = ?, updated_at = ? WHERE id = ?",
            params![status.as_str(), progress, error, Utc::now(), id],
        )?;
        Ok(())
    }

    fn update_progress(&self, id: i64, progress: f64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE tasks SET progress = ?, updated_at = ? WHERE id = ?",
            params![progress, Utc::now(), id],
        )?;
        Ok(())
    }

    fn list_unfinished(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            "WHERE status IN ('pending', 'running') ORDER BY created_at ASC, id ASC",
        )
    }

    fn list_pending(&self) -> Result<Vec<Task>> {
        self.query_tasks("WHERE status = 'pending' ORDER BY created_at ASC, id ASC")
    }

    fn list_all(&self) -> Result<Vec<Task>> {
        self.query_tasks("ORDER BY created_at DESC, id DESC")
    }

    fn get(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))?;
        Ok(stmt.query_row([id], task_from_row).optional()?)
    }

    fn delete(&self, id: i64) -> Result<bool> {
        let conn = self.conn();
        let removed = conn.execute("DELETE FROM tasks WHERE id = ?", [id])?;
        Ok(removed > 0)
    }

    fn request_cancel(&self, id: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO cancel_requests (task_id, requested_at) VALUES (?, ?)",
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    fn take_cancel_requests(&self) -> Result<Vec<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt =
                tx.prepare_cached("SELECT task_id FROM cancel_requests ORDER BY requested_at, task_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<i64>>>()?;
            ids
        };
        {
            let mut delete = tx.prepare_cached("DELETE FROM cancel_requests WHERE task_id = ?")?;
            for id in &ids {
                delete.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        Ok(conn
            .query_row("SELECT value FROM settings WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, Utc::now()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_task(name: &str) -> NewTask {
        NewTask::new(format!("/in/{name}.mkv"), format!("/out/{name}.mp4"), "transcode")
    }

    #[test]
    fn test_create_assigns_increasing_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create(&new_task("a")).unwrap();
        let b = store.create(&new_task("b")).unwrap();

        assert!(b.id > a.id);
        assert_eq!(a.status, TaskStatus::Pending);
        assert_eq!(a.progress, 0.0);

        let stored = store.get(a.id).unwrap().unwrap();
        assert_eq!(stored.input_path, PathBuf::from("/in/a.mkv"));
        assert_eq!(stored.kind, "transcode");
    }

    #[test]
    fn test_cancel_requests_are_taken_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.request_cancel(7).unwrap();
        store.request_cancel(3).unwrap();
        store.request_cancel(7).unwrap();

        let mut taken = store.take_cancel_requests().unwrap();
        taken.sort();
        assert_eq!(taken, vec![3, 7]);
        assert!(store.take_cancel_requests().unwrap().is_empty());
    }

    #[test]
    fn test_ids_are_never_reused() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create(&new_task("a")).unwrap();
        assert!(store.delete(a.id).unwrap());
        let b = store.create(&new_task("b")).unwrap();
        assert!(b.id > a.id);
        assert!(!store.delete(a.id).unwrap());
    }

    #[test]
    fn test_status_and_progress_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        let task = store.create(&new_task("a")).unwrap();

        store
            .update_status(task.id, TaskStatus::Running, 0.0, None)
            .unwrap();
        store.update_progress(task.id, 37.5).unwrap();
        let running = store.get(task.id).unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.progress, 37.5);

        store
            .update_status(task.id, TaskStatus::Error, 37.5, Some("exit status: 1"))
            .unwrap();
        let failed = store.get(task.id).unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error_log.as_deref(), Some("exit status: 1"));
    }

    #[test]
    fn test_unfinished_listing_is_oldest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create(&new_task("a")).unwrap();
        let b = store.create(&new_task("b")).unwrap();
        let c = store.create(&new_task("c")).unwrap();
        store
            .update_status(a.id, TaskStatus::Running, 10.0, None)
            .unwrap();
        store
            .update_status(b.id, TaskStatus::Finished, 100.0, None)
            .unwrap();

        let ids: Vec<i64> = store.list_unfinished().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, c.id]);

        let pending: Vec<i64> = store.list_pending().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(pending, vec![c.id]);

        let all: Vec<i64> = store.list_all().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(all, vec![c.id, b.id, a.id]);
    }

    #[test]
    fn test_settings_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting("last_scan_directory").unwrap(), None);

        store.set_setting("last_scan_directory", "/media").unwrap();
        store.set_setting("last_scan_directory", "/media/tv").unwrap();
        assert_eq!(
            store.get_setting("last_scan_directory").unwrap().as_deref(),
            Some("/media/tv")
        );
    }

    #[test]
    fn test_open_file_persists_between_connections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db").join("videoforge.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.create(&new_task("a")).unwrap().id
        };

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get(id).unwrap().is_some());
    }
}
