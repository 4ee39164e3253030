use std::collections::HashMap;

use crate::llm::ChatMessage;

pub const CONDENSE_SYSTEM: &str = "Given the following conversation and a follow up question, \
     rephrase the follow up question to be a standalone question. \
     If the follow up question is not related to the conversation, just repeat the follow up question.";

pub const CONDENSE_HUMAN: &str =
    "{chat_history}\n\nFollow Up Question: {question}\n\nStandalone question:";

pub const QA_SYSTEM: &str = "You are a helpful AI assistant. \
     Use the following pieces of context to answer the human's question. \
     If you don't know the answer, just say that you don't know, don't try to make up an answer.";

pub const QA_HUMAN: &str = "Context: {context}\n\nQuestion: {question}\n\nAnswer:";

/// A string with `{name}` placeholders.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Substitute every `{name}` found in `vars`. Unknown placeholders are
    /// left as written; substituted values are never re-scanned.
    pub fn format(&self, vars: &HashMap<&str, &str>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match vars.get(name) {
                        Some(value) => out.push_str(value),
                        None => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// System + human message pair.
#[derive(Debug, Clone)]
pub struct ChatPromptTemplate {
    system: PromptTemplate,
    human: PromptTemplate,
}

impl ChatPromptTemplate {
    pub fn new(system: impl Into<String>, human: impl Into<String>) -> Self {
        Self {
            system: PromptTemplate::new(system),
            human: PromptTemplate::new(human),
        }
    }

    /// Prompt that rewrites a follow-up into a standalone question
    pub fn condense(system_override: Option<&str>) -> Self {
        Self::new(system_override.unwrap_or(CONDENSE_SYSTEM), CONDENSE_HUMAN)
    }

    /// Prompt that answers a question from retrieved context
    pub fn qa(system_override: Option<&str>) -> Self {
        Self::new(system_override.unwrap_or(QA_SYSTEM), QA_HUMAN)
    }

    pub fn format_messages(&self, vars: &HashMap<&str, &str>) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.format(vars)),
            ChatMessage::user(self.human.format(vars)),
        ]
    }
}
