pub mod loader;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::config::{RetrieverBackend, RetrieverConfig};

pub use sqlite::SqliteRetriever;

/// A piece of retrievable text and where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub page_content: String,
    pub source: String,
}

impl Document {
    pub fn new(page_content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            source: source.into(),
        }
    }
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn relevant_documents(&self, query: &str) -> Result<Vec<Document>>;

    fn kind(&self) -> &str;
}

/// Fallback retriever used when nothing else is wired in: a handful of
/// documents matched by case-insensitive substring.
pub struct SimpleInMemoryRetriever {
    documents: Vec<Document>,
}

impl SimpleInMemoryRetriever {
    pub fn new() -> Self {
        Self::with_documents(vec![
            Document::new(
                "ragbot is a Telegram bot that answers questions using a retrieval chain",
                "ragbot docs",
            ),
            Document::new(
                "A retrieval chain rewrites a question, fetches context and asks a language model to answer",
                "ragbot docs",
            ),
            Document::new(
                "Telegram is a cloud-based instant messaging service",
                "Telegram website",
            ),
        ])
    }

    pub fn with_documents(documents: Vec<Document>) -> Self {
        Self { documents }
    }
}

impl Default for SimpleInMemoryRetriever {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Retriever for SimpleInMemoryRetriever {
    async fn relevant_documents(&self, query: &str) -> Result<Vec<Document>> {
        let query = query.to_lowercase();
        Ok(self
            .documents
            .iter()
            .filter(|doc| doc.page_content.to_lowercase().contains(&query))
            .cloned()
            .collect())
    }

    fn kind(&self) -> &str {
        "simple-in-memory"
    }
}

/// Build the retriever selected in configuration, loading the documents
/// directory into it.
pub async fn build_retriever(config: &RetrieverConfig) -> Result<Arc<dyn Retriever>> {
    let documents = loader::load_documents_from_dir(&config.documents_dir).await?;

    match config.backend {
        RetrieverBackend::Simple => {
            if documents.is_empty() {
                info!("No documents loaded, using built-in fallback documents");
                Ok(Arc::new(SimpleInMemoryRetriever::new()))
            } else {
                Ok(Arc::new(SimpleInMemoryRetriever::with_documents(documents)))
            }
        }
        RetrieverBackend::Sqlite => {
            let retriever = SqliteRetriever::open(&config.database_path, config.top_k)?;
            for doc in &documents {
                retriever.add_document(doc).await?;
            }
            info!(
                "Knowledge base ready: {} documents",
                retriever.len().await?
            );
            Ok(Arc::new(retriever))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_retriever_substring_match() {
        let retriever = SimpleInMemoryRetriever::new();

        let docs = retriever.relevant_documents("TELEGRAM").await.unwrap();
        assert_eq!(docs.len(), 2);

        let docs = retriever.relevant_documents("cloud-based").await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source, "Telegram website");
    }

    #[tokio::test]
    async fn test_simple_retriever_whole_question_rarely_matches() {
        let retriever = SimpleInMemoryRetriever::new();
        let docs = retriever
            .relevant_documents("What is Telegram used for?")
            .await
            .unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn test_build_simple_falls_back_without_documents() {
        let config = RetrieverConfig {
            documents_dir: "does/not/exist".into(),
            ..RetrieverConfig::default()
        };
        let retriever = build_retriever(&config).await.unwrap();
        assert_eq!(retriever.kind(), "simple-in-memory");
        assert!(!retriever
            .relevant_documents("messaging")
            .await
            .unwrap()
            .is_empty());
    }
}
