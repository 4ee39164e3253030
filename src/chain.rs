use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::llm::ChatModel;
use crate::prompt::ChatPromptTemplate;
use crate::retriever::Retriever;

#[derive(Debug, Clone)]
pub struct ChainInput {
    pub question: String,
    pub chat_history: String,
}

/// Condense -> retrieve -> answer.
///
/// The follow-up question is first rewritten into a standalone question
/// using the chat history; that question drives both retrieval and the
/// final answer. Saving the exchange is left to the caller.
pub struct RetrievalChain {
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    condense: ChatPromptTemplate,
    qa: ChatPromptTemplate,
}

impl RetrievalChain {
    pub fn new(
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        condense: ChatPromptTemplate,
        qa: ChatPromptTemplate,
    ) -> Self {
        Self {
            model,
            retriever,
            condense,
            qa,
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn retriever(&self) -> &Arc<dyn Retriever> {
        &self.retriever
    }

    pub async fn invoke(&self, input: &ChainInput) -> Result<String> {
        let standalone = self
            .standalone_question(&input.question, &input.chat_history)
            .await?;
        debug!("Standalone question: {}", standalone);

        let context = self.context_for(&standalone).await?;
        debug!("Retrieved context: {} chars", context.len());

        let vars = HashMap::from([
            ("context", context.as_str()),
            ("question", standalone.as_str()),
        ]);
        let messages = self.qa.format_messages(&vars);
        self.model
            .invoke(&messages)
            .await
            .context("Answer generation failed")
    }

    async fn standalone_question(&self, question: &str, chat_history: &str) -> Result<String> {
        let vars = HashMap::from([("chat_history", chat_history), ("question", question)]);
        let messages = self.condense.format_messages(&vars);
        let rewritten = self
            .model
            .invoke(&messages)
            .await
            .context("Question condensing failed")?;
        Ok(rewritten.trim().to_string())
    }

    async fn context_for(&self, question: &str) -> Result<String> {
        let documents = self
            .retriever
            .relevant_documents(question)
            .await
            .context("Retrieval failed")?;

        Ok(documents
            .iter()
            .map(|doc| doc.page_content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use crate::retriever::{Document, SimpleInMemoryRetriever};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Replays canned answers and records every prompt it receives
    pub(crate) struct ScriptedModel {
        answers: Mutex<VecDeque<Result<String>>>,
        pub(crate) calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(answers: Vec<Result<String>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn invoke(&self, messages: &[ChatMessage]) -> Result<String> {
            self.calls.lock().await.push(messages.to_vec());
            self.answers
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }

        fn model_type(&self) -> &str {
            "scripted"
        }
    }

    fn chain(model: Arc<ScriptedModel>, retriever: Arc<dyn Retriever>) -> RetrievalChain {
        RetrievalChain::new(
            model,
            retriever,
            ChatPromptTemplate::condense(None),
            ChatPromptTemplate::qa(None),
        )
    }

    #[tokio::test]
    async fn test_pipeline_stages_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("  cloud-based  ".to_string()),
            Ok("It is a messenger.".to_string()),
        ]));
        let retriever = Arc::new(SimpleInMemoryRetriever::new());
        let chain = chain(model.clone(), retriever);

        let answer = chain
            .invoke(&ChainInput {
                question: "what kind of service?".to_string(),
                chat_history: "\nHuman: tell me about Telegram\nAI: sure".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(answer, "It is a messenger.");

        let calls = model.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0][1].content.contains("tell me about Telegram"));
        assert!(calls[0][1].content.contains("Follow Up Question: what kind of service?"));
        assert_eq!(
            calls[1][1].content,
            "Context: Telegram is a cloud-based instant messaging service\n\n\
             Question: cloud-based\n\nAnswer:"
        );
    }

    #[tokio::test]
    async fn test_no_documents_gives_empty_context() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("unrelated".to_string()),
            Ok("I don't know.".to_string()),
        ]));
        let retriever = Arc::new(SimpleInMemoryRetriever::with_documents(vec![Document::new(
            "nothing relevant",
            "x",
        )]));
        let chain = chain(model.clone(), retriever);

        let answer = chain
            .invoke(&ChainInput {
                question: "q".to_string(),
                chat_history: String::new(),
            })
            .await
            .unwrap();

        assert_eq!(answer, "I don't know.");
        let calls = model.calls.lock().await;
        assert!(calls[1][1].content.starts_with("Context: \n\nQuestion: unrelated"));
    }

    #[tokio::test]
    async fn test_model_error_aborts_chain() {
        let model = Arc::new(ScriptedModel::new(vec![Err(anyhow::anyhow!("boom"))]));
        let chain = chain(model.clone(), Arc::new(SimpleInMemoryRetriever::new()));

        let err = chain
            .invoke(&ChainInput {
                question: "q".to_string(),
                chat_history: String::new(),
            })
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("boom"));
        assert_eq!(model.calls.lock().await.len(), 1);
    }
}
