pub mod buffer;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::{MemoryBackend, MemoryConfig};

pub use buffer::BufferMemory;
pub use sqlite::SqliteMemory;

/// Conversation memory keyed by session id.
///
/// History is handed to the chain as one string of `Human:` / `AI:` lines.
#[async_trait]
pub trait Memory: Send + Sync {
    async fn load_history(&self, session_id: &str) -> Result<String>;

    async fn save_turn(&self, session_id: &str, input: &str, output: &str) -> Result<()>;

    async fn clear_session(&self, session_id: &str) -> Result<()>;

    /// Forget every session
    #[allow(dead_code)]
    async fn clear(&self) -> Result<()>;

    fn kind(&self) -> &str;
}

/// Format one exchange the way it is appended to the history string
pub(crate) fn format_turn(input: &str, output: &str) -> String {
    format!("\nHuman: {}\nAI: {}", input, output)
}

/// Cut bytes from the front of `history` until it fits in `max_length`,
/// moving forward to the next char boundary if needed.
pub(crate) fn truncate_front(history: &mut String, max_length: usize) {
    if history.len() <= max_length {
        return;
    }
    let mut excess = history.len() - max_length;
    while !history.is_char_boundary(excess) {
        excess += 1;
    }
    history.drain(..excess);
}

pub fn build_memory(config: &MemoryConfig) -> Result<Arc<dyn Memory>> {
    match config.backend {
        MemoryBackend::Buffer => Ok(Arc::new(BufferMemory::new(config.max_length))),
        MemoryBackend::Sqlite => Ok(Arc::new(SqliteMemory::open(
            &config.database_path,
            config.window,
            config.max_length,
        )?)),
    }
}
