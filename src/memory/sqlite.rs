use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{format_turn, truncate_front, Memory};

/// History persisted in SQLite; survives restarts.
#[derive(Clone)]
pub struct SqliteMemory {
    conn: Arc<Mutex<Connection>>,
    window: usize,
    max_length: usize,
}

impl SqliteMemory {
    pub fn open(path: &Path, window: usize, max_length: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        info!("Memory store initialized at: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            window,
            max_length,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(window: usize, max_length: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            window,
            max_length,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                human TEXT NOT NULL,
                ai TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_turns_session
                ON turns(session_id, id);
            ",
        )
        .context("Failed to create memory tables")?;
        Ok(())
    }
}

#[async_trait]
impl Memory for SqliteMemory {
    async fn load_history(&self, session_id: &str) -> Result<String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT human, ai FROM turns
             WHERE session_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let mut turns = stmt
            .query_map(
                rusqlite::params![session_id, self.window as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to load history")?;
        turns.reverse();

        let mut history: String = turns
            .iter()
            .map(|(human, ai)| format_turn(human, ai))
            .collect();
        truncate_front(&mut history, self.max_length);
        Ok(history)
    }

    async fn save_turn(&self, session_id: &str, input: &str, output: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO turns (session_id, human, ai) VALUES (?1, ?2, ?3)",
            rusqlite::params![session_id, input, output],
        )
        .context("Failed to save turn")?;
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM turns WHERE session_id = ?1",
            rusqlite::params![session_id],
        )?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM turns", [])?;
        Ok(())
    }

    fn kind(&self) -> &str {
        "sqlite"
    }
}
