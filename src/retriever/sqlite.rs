use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::{Document, Retriever};

/// Knowledge base in SQLite, searched through an FTS5 index
#[derive(Clone)]
pub struct SqliteRetriever {
    conn: Arc<Mutex<Connection>>,
    top_k: usize,
}

impl SqliteRetriever {
    pub fn open(path: &Path, top_k: usize) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // journal_mode PRAGMA returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;
        info!("Knowledge base opened at: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            top_k,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(top_k: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            top_k,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_documents_source_content
                ON documents(source, content);

            CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
                content,
                content=documents,
                content_rowid=rowid
            );

            CREATE TRIGGER IF NOT EXISTS documents_fts_insert AFTER INSERT ON documents BEGIN
                INSERT INTO documents_fts(rowid, content) VALUES (NEW.rowid, NEW.content);
            END;

            CREATE TRIGGER IF NOT EXISTS documents_fts_delete AFTER DELETE ON documents BEGIN
                INSERT INTO documents_fts(documents_fts, rowid, content)
                    VALUES('delete', OLD.rowid, OLD.content);
            END;
            ",
        )
        .context("Failed to create knowledge base tables")?;
        Ok(())
    }

    /// Store a document; returns false when an identical one already exists
    pub async fn add_document(&self, doc: &Document) -> Result<bool> {
        let conn = self.conn.lock().await;
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO documents (id, content, source) VALUES (?1, ?2, ?3)",
                rusqlite::params![Uuid::new_v4().to_string(), &doc.page_content, &doc.source],
            )
            .context("Failed to store document")?;
        Ok(rows > 0)
    }

    pub async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT count(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Turn free text into an FTS5 query: every alphanumeric term quoted and
/// OR-ed together.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl Retriever for SqliteRetriever {
    async fn relevant_documents(&self, query: &str) -> Result<Vec<Document>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT d.content, d.source
             FROM documents d
             JOIN documents_fts fts ON d.rowid = fts.rowid
             WHERE documents_fts MATCH ?1
             ORDER BY fts.rank
             LIMIT ?2",
        )?;

        let documents = stmt
            .query_map(rusqlite::params![match_expr, self.top_k as i64], |row| {
                Ok(Document {
                    page_content: row.get(0)?,
                    source: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to search knowledge base")?;

        Ok(documents)
    }

    fn kind(&self) -> &str {
        "sqlite-fts"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded(top_k: usize) -> SqliteRetriever {
        let kb = SqliteRetriever::open_in_memory(top_k).unwrap();
        kb.add_document(&Document::new(
            "Rust is a systems programming language focused on safety",
            "rust",
        ))
        .await
        .unwrap();
        kb.add_document(&Document::new(
            "Telegram bots receive updates through long polling or webhooks",
            "telegram",
        ))
        .await
        .unwrap();
        kb.add_document(&Document::new(
            "SQLite is an embedded database engine",
            "sqlite",
        ))
        .await
        .unwrap();
        kb
    }

    #[test]
    fn test_fts_query_sanitizes() {
        assert_eq!(
            fts_query("What's \"NEAR\" (Rust)?").as_deref(),
            Some("\"what\" OR \"s\" OR \"near\" OR \"rust\"")
        );
        assert_eq!(fts_query("?!  ..."), None);
    }

    #[tokio::test]
    async fn test_search_finds_matching_document() {
        let kb = seeded(4).await;
        let docs = kb
            .relevant_documents("How do Telegram bots get updates?")
            .await
            .unwrap();

        assert!(!docs.is_empty());
        assert_eq!(docs[0].source, "telegram");
    }

    #[tokio::test]
    async fn test_search_respects_top_k() {
        let kb = seeded(1).await;
        let docs = kb
            .relevant_documents("rust telegram sqlite")
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_punctuation_only_query_returns_nothing() {
        let kb = seeded(4).await;
        assert!(kb.relevant_documents("???").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_documents_ignored() {
        let kb = seeded(4).await;
        let added = kb
            .add_document(&Document::new("SQLite is an embedded database engine", "sqlite"))
            .await
            .unwrap();

        assert!(!added);
        assert_eq!(kb.len().await.unwrap(), 3);
    }
}
