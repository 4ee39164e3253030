use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::dispatching::ShutdownToken;
use teloxide::prelude::*;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::chain::{ChainInput, RetrievalChain};
use crate::config::{PromptsConfig, TelegramConfig};
use crate::llm::ChatModel;
use crate::members::Classifier;
use crate::memory::{BufferMemory, Memory};
use crate::platform::{telegram, BotState};
use crate::prompt::ChatPromptTemplate;
use crate::retriever::{Retriever, SimpleInMemoryRetriever};

/// Memory budget of the fallback buffer, in bytes
const FALLBACK_MEMORY_LENGTH: usize = 1000;

/// One entry of a node's declarative input schema
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(dead_code)]
pub struct InputParam {
    pub label: &'static str,
    pub name: &'static str,
    pub kind: &'static str,
    pub optional: bool,
    pub list: bool,
    pub placeholder: Option<&'static str>,
}

/// Host-side secret lookup
pub trait CredentialProvider: Send + Sync {
    fn credential(&self, name: &str) -> Option<String>;
}

/// Reads credentials from environment variables
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn credential(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Inputs wired into a node by the host
#[derive(Default, Clone)]
pub struct NodeData {
    pub bot_token: Option<String>,
    pub chat_model: Option<Arc<dyn ChatModel>>,
    pub memory: Option<Arc<dyn Memory>>,
    pub retriever: Option<Arc<dyn Retriever>>,
}

#[derive(Debug, Clone, Default)]
#[allow(dead_code)]
pub struct RunOptions {
    /// Deliver the input to this chat instead of running the chain
    pub chat_id: Option<i64>,
}

/// Lifecycle a host drives: `init` once, `run` any number of times, `stop`.
#[async_trait]
pub trait Node: Send + Sync {
    #[allow(dead_code)]
    fn label(&self) -> &str;

    fn name(&self) -> &str;

    #[allow(dead_code)]
    fn inputs(&self) -> Vec<InputParam>;

    async fn init(&mut self, data: NodeData) -> Result<()>;

    #[allow(dead_code)]
    async fn run(&self, input: &str, options: &RunOptions) -> Result<String>;

    async fn stop(&mut self) -> Result<()>;
}

/// Inputs after defaults have been applied
struct Resolved {
    bot_token: String,
    chat_model: Arc<dyn ChatModel>,
    memory: Arc<dyn Memory>,
    retriever: Arc<dyn Retriever>,
}

/// What `run` needs once the node is initialized
struct Active {
    bot: Bot,
    state: Arc<BotState>,
}

/// The background update dispatcher
struct Dispatch {
    shutdown: ShutdownToken,
    task: JoinHandle<()>,
}

/// Telegram bot answering through a retrieval chain
pub struct TelegramRetrievalNode {
    telegram: TelegramConfig,
    prompts: PromptsConfig,
    credentials: Box<dyn CredentialProvider>,
    active: Option<Active>,
    dispatch: Option<Dispatch>,
}

impl TelegramRetrievalNode {
    pub fn new(
        telegram: TelegramConfig,
        prompts: PromptsConfig,
        credentials: Box<dyn CredentialProvider>,
    ) -> Self {
        Self {
            telegram,
            prompts,
            credentials,
            active: None,
            dispatch: None,
        }
    }

    #[cfg(test)]
    fn is_initialized(&self) -> bool {
        self.active.is_some()
    }

    fn resolve(&self, data: NodeData) -> Result<Resolved> {
        let bot_token = data
            .bot_token
            .filter(|t| !t.is_empty())
            .or_else(|| self.credentials.credential("TELEGRAM_BOT_TOKEN"));

        let (Some(bot_token), Some(chat_model)) = (bot_token, data.chat_model) else {
            anyhow::bail!("Missing required inputs: botToken or chatModel");
        };

        let memory = data.memory.unwrap_or_else(|| {
            info!("No memory provided, using BufferMemory as default");
            Arc::new(BufferMemory::new(FALLBACK_MEMORY_LENGTH))
        });

        let retriever = data.retriever.unwrap_or_else(|| {
            info!("No retriever provided, using SimpleInMemoryRetriever as fallback");
            Arc::new(SimpleInMemoryRetriever::new())
        });

        Ok(Resolved {
            bot_token,
            chat_model,
            memory,
            retriever,
        })
    }

    /// Wire chain, memory and classifier for a bot whose identity is known
    fn activate(&self, resolved: Resolved, bot: Bot, bot_id: u64, username: String) -> Active {
        let chain = RetrievalChain::new(
            resolved.chat_model,
            resolved.retriever,
            ChatPromptTemplate::condense(self.prompts.condense_system.as_deref()),
            ChatPromptTemplate::qa(self.prompts.qa_system.as_deref()),
        );
        let classifier = Classifier::new(
            bot_id,
            self.telegram.known_bot_ids.iter().copied(),
            &self.telegram.bot_message_prefix,
        );
        let state = Arc::new(BotState::new(
            chain,
            resolved.memory,
            classifier,
            username,
            self.telegram.reply_to_bots,
        ));

        Active { bot, state }
    }
}

#[async_trait]
impl Node for TelegramRetrievalNode {
    fn label(&self) -> &str {
        "Telegram Bot with Retrieval Chain"
    }

    fn name(&self) -> &str {
        "telegramBotRetrievalChain"
    }

    fn inputs(&self) -> Vec<InputParam> {
        vec![
            InputParam {
                label: "Bot Token",
                name: "botToken",
                kind: "password",
                optional: false,
                list: false,
                placeholder: Some("Enter your Telegram Bot Token"),
            },
            InputParam {
                label: "Chat Model",
                name: "chatModel",
                kind: "BaseChatModel",
                optional: false,
                list: false,
                placeholder: None,
            },
            InputParam {
                label: "Memory",
                name: "memory",
                kind: "BaseMemory",
                optional: true,
                list: false,
                placeholder: None,
            },
            InputParam {
                label: "Retriever",
                name: "retriever",
                kind: "BaseRetriever",
                optional: true,
                list: false,
                placeholder: None,
            },
        ]
    }

    async fn init(&mut self, data: NodeData) -> Result<()> {
        info!("Initializing {} node", self.name());

        if self.active.is_some() {
            anyhow::bail!("Node is already initialized");
        }

        let resolved = self.resolve(data)?;
        info!(
            "Bot token (first 5 chars): {}",
            resolved.bot_token.chars().take(5).collect::<String>()
        );
        info!("LLM type: {}", resolved.chat_model.model_type());
        info!("Memory type: {}", resolved.memory.kind());
        info!("Retriever type: {}", resolved.retriever.kind());

        let bot = Bot::new(&resolved.bot_token);
        let me = bot
            .get_me()
            .await
            .context("Failed to fetch bot identity from Telegram")?;
        let username = me.username().to_string();
        info!("Authorized as @{} ({})", username, me.user.id);

        let active = self.activate(resolved, bot, me.user.id.0, username);
        let (shutdown, task) = telegram::launch(active.bot.clone(), active.state.clone());
        self.active = Some(active);
        self.dispatch = Some(Dispatch { shutdown, task });

        info!("{} node initialized", self.name());
        Ok(())
    }

    async fn run(&self, input: &str, options: &RunOptions) -> Result<String> {
        let Some(active) = &self.active else {
            anyhow::bail!("Bot or chain is not initialized");
        };

        if let Some(chat_id) = options.chat_id {
            active
                .bot
                .send_message(ChatId(chat_id), input)
                .await
                .map_err(|e| {
                    error!("Error sending message: {}", e);
                    anyhow::anyhow!("Error sending message")
                })?;
            return Ok("Message sent successfully".to_string());
        }

        active
            .state
            .chain()
            .invoke(&ChainInput {
                question: input.to_string(),
                chat_history: String::new(),
            })
            .await
            .map_err(|e| {
                error!("Error processing input through chain: {:#}", e);
                anyhow::anyhow!("Error processing input")
            })
    }

    async fn stop(&mut self) -> Result<()> {
        self.active = None;
        let Some(dispatch) = self.dispatch.take() else {
            return Ok(());
        };

        match dispatch.shutdown.shutdown() {
            Ok(done) => done.await,
            Err(_) => {
                // An idle dispatcher ignores the token and would never return
                debug!("Dispatcher has not started yet, aborting it");
                dispatch.task.abort();
            }
        }

        match dispatch.task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(e).context("Telegram dispatcher task failed"),
        }

        info!("Telegram bot has been stopped");
        Ok(())
    }
}
