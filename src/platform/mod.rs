pub mod telegram;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::chain::{ChainInput, RetrievalChain};
use crate::members::{ChatKind, Classifier, MemberDirectory, Sender, SenderKind};
use crate::memory::Memory;

use self::telegram::Command;

pub const ERROR_REPLY: &str = "Sorry, I encountered an error while processing your message.";
pub const EMPTY_REPLY: &str = "Sorry, I couldn't generate a response.";
pub const NOT_TEXT_REPLY: &str = "Sorry, I can only process text messages.";
pub const ADMIN_ONLY_REPLY: &str = "Only group administrators can use this command.";
const EMPTY_MENTION_QUESTION: &str = "Hello!";

/// A message received from Telegram, reduced to what the bot acts on
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub chat_kind: ChatKind,
    pub user_id: u64,
    pub username: Option<String>,
    pub is_bot: bool,
    /// `None` for stickers, photos and other non-text messages
    pub text: Option<String>,
    /// The message replies to one of this bot's messages
    pub replies_to_bot: bool,
}

impl IncomingMessage {
    /// Memory key: the user in private chats, the whole chat in groups
    pub fn session_id(&self) -> String {
        match self.chat_kind {
            ChatKind::Private => self.user_id.to_string(),
            ChatKind::Group => self.chat_id.to_string(),
        }
    }

    fn sender(&self) -> Sender<'_> {
        Sender {
            user_id: self.user_id,
            username: self.username.as_deref(),
            is_bot: self.is_bot,
            text: self.text.as_deref().unwrap_or(""),
        }
    }
}

/// A free-text message the bot has decided to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    /// Reply without consulting the model
    Notice(String),
    Question { session_id: String, question: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Chain answer; the exchange is saved once the reply is delivered
    Answer {
        session_id: String,
        question: String,
        text: String,
    },
    /// Plain reply that is not remembered
    Notice(String),
}

/// Everything the update handlers share
pub struct BotState {
    chain: RetrievalChain,
    memory: Arc<dyn Memory>,
    classifier: Classifier,
    paused: Mutex<HashSet<i64>>,
    username: String,
    reply_to_bots: bool,
}

impl BotState {
    pub fn new(
        chain: RetrievalChain,
        memory: Arc<dyn Memory>,
        classifier: Classifier,
        username: impl Into<String>,
        reply_to_bots: bool,
    ) -> Self {
        Self {
            chain,
            memory,
            classifier,
            paused: Mutex::new(HashSet::new()),
            username: username.into(),
            reply_to_bots,
        }
    }

    pub fn chain(&self) -> &RetrievalChain {
        &self.chain
    }

    /// Decide what to do with a free-text (non-command) message before any
    /// model call. `None` means the message is ignored.
    pub async fn intake(
        &self,
        directory: &dyn MemberDirectory,
        incoming: &IncomingMessage,
    ) -> Option<Intake> {
        let Some(text) = incoming.text.as_deref() else {
            return match incoming.chat_kind {
                ChatKind::Private => Some(Intake::Notice(NOT_TEXT_REPLY.to_string())),
                ChatKind::Group => None,
            };
        };

        let kind = self
            .classifier
            .classify(
                directory,
                incoming.chat_id,
                incoming.chat_kind,
                &incoming.sender(),
            )
            .await;
        match kind {
            SenderKind::ThisBot => return None,
            SenderKind::OtherBot if !self.reply_to_bots => {
                debug!("Ignoring message from bot {}", incoming.user_id);
                return None;
            }
            _ => {}
        }

        if self.is_paused(incoming.chat_id).await {
            debug!("Chat {} is paused, ignoring message", incoming.chat_id);
            return None;
        }

        let question = match incoming.chat_kind {
            ChatKind::Private => text.trim().to_string(),
            ChatKind::Group => {
                group_question(text, &self.username, incoming.replies_to_bot)?
            }
        };

        info!(
            "Processing message from user {} in chat {}: {:?}",
            incoming.user_id, incoming.chat_id, question
        );

        Some(Intake::Question {
            session_id: incoming.session_id(),
            question,
        })
    }

    /// Run the chain for an accepted question
    pub async fn answer(&self, session_id: String, question: String) -> Outcome {
        match self.run_chain(&session_id, &question).await {
            Ok(text) => Outcome::Answer {
                session_id,
                question,
                text,
            },
            Err(e) => {
                error!("Error processing message: {:#}", e);
                Outcome::Notice(ERROR_REPLY.to_string())
            }
        }
    }

    #[cfg(test)]
    async fn respond(
        &self,
        directory: &dyn MemberDirectory,
        incoming: &IncomingMessage,
    ) -> Option<Outcome> {
        match self.intake(directory, incoming).await? {
            Intake::Notice(text) => Some(Outcome::Notice(text)),
            Intake::Question {
                session_id,
                question,
            } => Some(self.answer(session_id, question).await),
        }
    }

    async fn run_chain(&self, session_id: &str, question: &str) -> Result<String> {
        let chat_history = self.memory.load_history(session_id).await?;
        debug!("Chat history length: {}", chat_history.len());

        let result = self
            .chain
            .invoke(&ChainInput {
                question: question.to_string(),
                chat_history,
            })
            .await?;

        if result.trim().is_empty() {
            Ok(EMPTY_REPLY.to_string())
        } else {
            Ok(result)
        }
    }

    pub async fn save_turn(&self, session_id: &str, question: &str, answer: &str) -> Result<()> {
        self.memory.save_turn(session_id, question, answer).await
    }

    pub async fn run_command(
        &self,
        directory: &dyn MemberDirectory,
        incoming: &IncomingMessage,
        command: &Command,
    ) -> Result<String> {
        let chat_id = incoming.chat_id;

        if command.admin_only() && incoming.chat_kind == ChatKind::Group {
            self.classifier.ensure_loaded(directory, chat_id).await;
            if !self.classifier.is_admin(chat_id, incoming.user_id).await {
                return Ok(ADMIN_ONLY_REPLY.to_string());
            }
        }

        let session_id = incoming.session_id();
        match command {
            Command::Start => {
                self.paused.lock().await.remove(&chat_id);
                Ok("Welcome! I'm your AI assistant with Retrieval Chain capabilities.".to_string())
            }
            Command::Help => Ok(self.help_text(incoming.chat_kind)),
            Command::Debug => self.debug_report(incoming).await,
            Command::Stop => {
                self.paused.lock().await.insert(chat_id);
                info!("Paused chat {}", chat_id);
                Ok("Paused. Send /start to resume.".to_string())
            }
            Command::StopClear => {
                self.paused.lock().await.insert(chat_id);
                self.memory.clear_session(&session_id).await?;
                info!("Paused chat {} and cleared session {}", chat_id, session_id);
                Ok("Paused and memory cleared. Send /start to resume.".to_string())
            }
            Command::ClearMemory => {
                self.memory.clear_session(&session_id).await?;
                info!("Cleared session {}", session_id);
                Ok("Conversation memory cleared.".to_string())
            }
            Command::UpdateMembers => {
                if incoming.chat_kind == ChatKind::Private {
                    return Ok("Member list is only tracked in group chats.".to_string());
                }
                let count = self.classifier.refresh(directory, chat_id).await?;
                Ok(format!("Member list updated: {} administrators.", count))
            }
        }
    }

    fn help_text(&self, chat_kind: ChatKind) -> String {
        let mut text = String::from(
            "I can assist you with various tasks and provide information from my knowledge base. \
             Just send me a message!\n\n\
             Commands:\n\
             /start - Start or resume the bot in this chat\n\
             /help - Show this message\n\
             /debug - Show diagnostics\n\
             /stop - Pause replies in this chat\n\
             /stopclear - Pause and clear conversation memory\n\
             /clearmemory - Clear conversation memory\n\
             /update_members - Refresh the group administrator list",
        );
        if chat_kind == ChatKind::Group {
            text.push_str(&format!(
                "\n\nIn groups, mention @{} or reply to my messages.",
                self.username
            ));
        }
        text
    }

    async fn debug_report(&self, incoming: &IncomingMessage) -> Result<String> {
        let session_id = incoming.session_id();
        let history = self.memory.load_history(&session_id).await?;
        let paused = self.is_paused(incoming.chat_id).await;
        let members = self.classifier.cached_members(incoming.chat_id).await;

        Ok(format!(
            "Model: {}\nMemory: {}\nRetriever: {}\nSession: {}\nHistory length: {}\nPaused: {}\nCached members: {}\nTime: {}",
            self.chain.model().model_type(),
            self.memory.kind(),
            self.chain.retriever().kind(),
            session_id,
            history.len(),
            paused,
            members,
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        ))
    }

    async fn is_paused(&self, chat_id: i64) -> bool {
        self.paused.lock().await.contains(&chat_id)
    }
}

/// In a group, the bot only answers when mentioned or replied to.
/// Returns the question with the mention removed.
fn group_question(text: &str, username: &str, replies_to_bot: bool) -> Option<String> {
    let mention = format!("@{}", username.to_lowercase());
    let lower = text.to_lowercase();
    let mentioned = !username.is_empty() && lower.contains(&mention);

    if !mentioned && !replies_to_bot {
        return None;
    }

    let mut question = String::with_capacity(text.len());
    let mut rest = text;
    if mentioned {
        // Lowercasing can change byte lengths, so match char by char
        while let Some(pos) = find_ignore_case(rest, &mention) {
            question.push_str(&rest[..pos]);
            rest = &rest[pos + mention.len()..];
        }
    }
    question.push_str(rest);

    let question = question.split_whitespace().collect::<Vec<_>>().join(" ");
    if question.is_empty() {
        Some(EMPTY_MENTION_QUESTION.to_string())
    } else {
        Some(question)
    }
}

/// Byte offset of an ASCII `needle` in `haystack`, ignoring ASCII case
fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| {
            haystack
                .get(i..i + needle.len())
                .is_some_and(|s| s.eq_ignore_ascii_case(needle))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::ScriptedModel;
    use crate::members::tests::FakeDirectory;
    use crate::members::MemberInfo;
    use crate::memory::BufferMemory;
    use crate::prompt::ChatPromptTemplate;
    use crate::retriever::SimpleInMemoryRetriever;

    const BOT_ID: u64 = 1;

    fn state(answers: Vec<Result<String>>) -> (BotState, Arc<ScriptedModel>, Arc<BufferMemory>) {
        let model = Arc::new(ScriptedModel::new(answers));
        let memory = Arc::new(BufferMemory::new(1000));
        let chain = RetrievalChain::new(
            model.clone(),
            Arc::new(SimpleInMemoryRetriever::new()),
            ChatPromptTemplate::condense(None),
            ChatPromptTemplate::qa(None),
        );
        let state = BotState::new(
            chain,
            memory.clone(),
            Classifier::new(BOT_ID, [], "[bot]"),
            "RagBot",
            false,
        );
        (state, model, memory)
    }

    fn private(text: Option<&str>) -> IncomingMessage {
        IncomingMessage {
            chat_id: 42,
            chat_kind: ChatKind::Private,
            user_id: 42,
            username: Some("alice".to_string()),
            is_bot: false,
            text: text.map(str::to_string),
            replies_to_bot: false,
        }
    }

    fn group(user_id: u64, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id: -100,
            chat_kind: ChatKind::Group,
            user_id,
            username: None,
            is_bot: false,
            text: Some(text.to_string()),
            replies_to_bot: false,
        }
    }

    fn admins() -> FakeDirectory {
        FakeDirectory::new(vec![(
            7,
            MemberInfo {
                is_bot: false,
                is_admin: true,
            },
        )])
    }

    #[test]
    fn test_group_question_requires_mention_or_reply() {
        assert_eq!(group_question("hello all", "RagBot", false), None);
        assert_eq!(
            group_question("hey @ragbot what is rust?", "RagBot", false).as_deref(),
            Some("hey what is rust?")
        );
        assert_eq!(
            group_question("what is rust?", "RagBot", true).as_deref(),
            Some("what is rust?")
        );
        assert_eq!(
            group_question("@RAGBOT", "RagBot", false).as_deref(),
            Some(EMPTY_MENTION_QUESTION)
        );
    }

    #[test]
    fn test_session_id_per_user_or_chat() {
        assert_eq!(private(Some("x")).session_id(), "42");
        assert_eq!(group(7, "x").session_id(), "-100");
    }

    #[tokio::test]
    async fn test_private_message_answered() {
        let (state, model, _) = state(vec![Ok("q".to_string()), Ok("answer".to_string())]);
        let dir = FakeDirectory::new(vec![]);

        let outcome = state.respond(&dir, &private(Some(" hi "))).await;

        assert_eq!(
            outcome,
            Some(Outcome::Answer {
                session_id: "42".to_string(),
                question: "hi".to_string(),
                text: "answer".to_string(),
            })
        );
        assert_eq!(model.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_non_text_private_gets_notice() {
        let (state, _, _) = state(vec![]);
        let dir = FakeDirectory::new(vec![]);

        let outcome = state.respond(&dir, &private(None)).await;
        assert_eq!(outcome, Some(Outcome::Notice(NOT_TEXT_REPLY.to_string())));
    }

    #[tokio::test]
    async fn test_empty_answer_replaced() {
        let (state, _, _) = state(vec![Ok("q".to_string()), Ok("   ".to_string())]);
        let dir = FakeDirectory::new(vec![]);

        match state.respond(&dir, &private(Some("hi"))).await {
            Some(Outcome::Answer { text, .. }) => assert_eq!(text, EMPTY_REPLY),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_chain_error_becomes_error_reply() {
        let (state, _, _) = state(vec![Err(anyhow::anyhow!("model down"))]);
        let dir = FakeDirectory::new(vec![]);

        let outcome = state.respond(&dir, &private(Some("hi"))).await;
        assert_eq!(outcome, Some(Outcome::Notice(ERROR_REPLY.to_string())));
    }

    #[tokio::test]
    async fn test_history_feeds_next_question() {
        let (state, model, _) = state(vec![
            Ok("q1".to_string()),
            Ok("a1".to_string()),
            Ok("q2".to_string()),
            Ok("a2".to_string()),
        ]);
        let dir = FakeDirectory::new(vec![]);

        state.respond(&dir, &private(Some("first"))).await;
        state.save_turn("42", "first", "a1").await.unwrap();
        state.respond(&dir, &private(Some("second"))).await;

        let calls = model.calls.lock().await;
        assert!(calls[2][1].content.starts_with("\nHuman: first\nAI: a1"));
    }

    #[tokio::test]
    async fn test_group_ignores_unmentioned_and_bots() {
        let (state, model, _) = state(vec![]);
        let dir = admins();

        assert_eq!(state.respond(&dir, &group(7, "just chatting")).await, None);

        let mut from_bot = group(9, "@RagBot ping");
        from_bot.is_bot = true;
        assert_eq!(state.respond(&dir, &from_bot).await, None);

        assert_eq!(state.respond(&dir, &group(BOT_ID, "@RagBot loop")).await, None);
        assert!(model.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_start_in_private() {
        let (state, _, memory) = state(vec![]);
        let dir = FakeDirectory::new(vec![]);
        memory.save_turn("42", "a", "b").await.unwrap();

        let reply = state
            .run_command(&dir, &private(Some("/stopclear")), &Command::StopClear)
            .await
            .unwrap();
        assert!(reply.starts_with("Paused"));
        assert_eq!(memory.load_history("42").await.unwrap(), "");
        assert_eq!(state.respond(&dir, &private(Some("hi"))).await, None);

        state
            .run_command(&dir, &private(Some("/start")), &Command::Start)
            .await
            .unwrap();
        assert!(!state.is_paused(42).await);
    }

    #[tokio::test]
    async fn test_group_admin_commands() {
        let (state, _, _) = state(vec![]);
        let dir = admins();

        let denied = state
            .run_command(&dir, &group(8, "/stop"), &Command::Stop)
            .await
            .unwrap();
        assert_eq!(denied, ADMIN_ONLY_REPLY);
        assert!(!state.is_paused(-100).await);

        let allowed = state
            .run_command(&dir, &group(7, "/update_members"), &Command::UpdateMembers)
            .await
            .unwrap();
        assert_eq!(allowed, "Member list updated: 1 administrators.");

        // Help and debug stay open to everyone
        let help = state
            .run_command(&dir, &group(8, "/help"), &Command::Help)
            .await
            .unwrap();
        assert!(help.contains("@RagBot"));
    }

    #[tokio::test]
    async fn test_admin_commands_recover_after_failed_fetch() {
        let (state, _, _) = state(vec![]);
        let mut dir = admins();
        dir.fail = true;

        assert_eq!(state.respond(&dir, &group(8, "hello")).await, None);

        dir.fail = false;
        let reply = state
            .run_command(&dir, &group(7, "/update_members"), &Command::UpdateMembers)
            .await
            .unwrap();

        assert_eq!(reply, "Member list updated: 1 administrators.");
        assert!(state.classifier.is_admin(-100, 7).await);
    }

    #[tokio::test]
    async fn test_group_reply_to_bot_answered_without_mention() {
        let (state, _, _) = state(vec![Ok("q".to_string()), Ok("sure".to_string())]);
        let dir = admins();

        let mut reply = group(8, "  and what about async? ");
        reply.replies_to_bot = true;

        assert_eq!(
            state.respond(&dir, &reply).await,
            Some(Outcome::Answer {
                session_id: "-100".to_string(),
                question: "and what about async?".to_string(),
                text: "sure".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_other_bots_answered_when_enabled() {
        let (mut state, model, _) = state(vec![Ok("q".to_string()), Ok("pong".to_string())]);
        state.reply_to_bots = true;
        let dir = admins();

        let mut from_bot = group(9, "@RagBot ping");
        from_bot.is_bot = true;

        match state.respond(&dir, &from_bot).await {
            Some(Outcome::Answer { text, .. }) => assert_eq!(text, "pong"),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(model.calls.lock().await.len(), 2);

        // Own messages stay ignored
        assert_eq!(state.respond(&dir, &group(BOT_ID, "@RagBot loop")).await, None);
    }

    #[tokio::test]
    async fn test_intake_does_not_touch_model_when_paused() {
        let (state, model, _) = state(vec![]);
        let dir = FakeDirectory::new(vec![]);

        assert_eq!(
            state.intake(&dir, &private(Some(" hi "))).await,
            Some(Intake::Question {
                session_id: "42".to_string(),
                question: "hi".to_string(),
            })
        );

        state
            .run_command(&dir, &private(Some("/stop")), &Command::Stop)
            .await
            .unwrap();
        assert_eq!(state.intake(&dir, &private(Some("hi"))).await, None);
        assert!(model.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_debug_report() {
        let (state, _, memory) = state(vec![]);
        let dir = FakeDirectory::new(vec![]);
        memory.save_turn("42", "hi", "hello").await.unwrap();

        let report = state
            .run_command(&dir, &private(Some("/debug")), &Command::Debug)
            .await
            .unwrap();

        assert!(report.contains("Model: scripted"));
        assert!(report.contains("Memory: buffer"));
        assert!(report.contains("Retriever: simple-in-memory"));
        assert!(report.contains("History length: 20"));
        assert!(report.contains("Paused: false"));
    }
}
