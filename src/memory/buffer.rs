use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{format_turn, truncate_front, Memory};

/// In-process history: one string per session, trimmed from the front once
/// it grows past `max_length` bytes.
pub struct BufferMemory {
    sessions: Mutex<HashMap<String, String>>,
    max_length: usize,
}

impl BufferMemory {
    pub fn new(max_length: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_length,
        }
    }
}

#[async_trait]
impl Memory for BufferMemory {
    async fn load_history(&self, session_id: &str) -> Result<String> {
        let sessions = self.sessions.lock().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn save_turn(&self, session_id: &str, input: &str, output: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let history = sessions.entry(session_id.to_string()).or_default();
        history.push_str(&format_turn(input, output));
        truncate_front(history, self.max_length);
        Ok(())
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.sessions.lock().await.clear();
        Ok(())
    }

    fn kind(&self) -> &str {
        "buffer"
    }
}
