mod document_repository;
mod models;
mod task_repository;

use crate::errors::Error;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;

pub use document_repository::*;
pub use models::*;
pub use task_repository::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    subject_id TEXT NOT NULL,
    task_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    progress INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    error_reason TEXT,
    result TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_subject ON tasks(subject_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status_priority ON tasks(status, priority DESC, created_at ASC);
CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_subject_active ON tasks(subject_id)
    WHERE status IN ('pending', 'in_progress', 'downloading', 'analyzing');

CREATE TABLE IF NOT EXISTS task_steps (
    task_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    position INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT,
    result TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    PRIMARY KEY (task_id, step_name),
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_task_steps_order ON task_steps(task_id, position);

CREATE TABLE IF NOT EXISTS documents (
    subject_id TEXT PRIMARY KEY NOT NULL,
    source_url TEXT,
    content_type TEXT,
    content TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    analysis TEXT,
    analyzed_at TEXT
);
"#;

/// Per-connection pragmas. WAL lets the API read while the orchestrator writes.
#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub type SqlitePooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

#[derive(Clone, Debug)]
pub struct Database {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl Database {
    /// Opens (or creates) the SQLite database at `db_path` and bootstraps the schema.
    pub fn new(db_path: &str) -> Result<Self, Error> {
        let manager = ConnectionManager::<SqliteConnection>::new(db_path);
        let pool = Pool::builder()
            .connection_timeout(Duration::from_secs(10))
            .connection_customizer(Box::new(SqlitePragmas))
            .build(manager)?;

        let database = Database {
            pool: Arc::new(pool),
        };
        database.get_conn()?.batch_execute(SCHEMA)?;
        Ok(database)
    }

    pub fn get_conn(&self) -> Result<SqlitePooledConnection, Error> {
        Ok(self.pool.get()?)
    }
}
