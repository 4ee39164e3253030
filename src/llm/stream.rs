use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental parser for an OpenAI-style `text/event-stream` body.
///
/// Bytes are buffered until a full line is available, so a UTF-8 sequence
/// or a JSON payload split across network chunks is reassembled first.
#[derive(Debug, Default)]
pub struct SseAccumulator {
    partial: Vec<u8>,
    content: String,
    done: bool,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw body bytes; returns the text deltas completed by this chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut deltas = Vec::new();
        if self.done {
            return deltas;
        }

        self.partial.extend_from_slice(bytes);

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.handle_line(&line) {
                deltas.push(delta);
            }
            if self.done {
                self.partial.clear();
                break;
            }
        }

        deltas
    }

    /// Flush a trailing line without newline and return the full text.
    pub fn finish(mut self) -> String {
        if !self.done && !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&rest).into_owned();
            self.handle_line(&line);
        }
        self.content
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    #[cfg(test)]
    pub fn content(&self) -> &str {
        &self.content
    }

    fn handle_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line == "data: [DONE]" {
            self.done = true;
            return None;
        }
        // Comments (": OPENROUTER PROCESSING") and other fields carry no text
        let data = line.strip_prefix("data: ")?;

        match serde_json::from_str::<StreamChunk>(data) {
            Ok(chunk) => {
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta)
                    .and_then(|d| d.content)
                    .filter(|c| !c.is_empty())?;
                self.content.push_str(&content);
                Some(content)
            }
            Err(_) => {
                warn!("Failed to parse stream line: {}", line);
                None
            }
        }
    }
}
