use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberInfo {
    pub is_bot: bool,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Human,
    ThisBot,
    OtherBot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

/// The parts of an incoming message the classifier looks at
#[derive(Debug, Clone, Copy)]
pub struct Sender<'a> {
    pub user_id: u64,
    pub username: Option<&'a str>,
    pub is_bot: bool,
    pub text: &'a str,
}

/// Remote membership lookups (the Bot API in production)
#[async_trait]
pub trait MemberDirectory: Send + Sync {
    async fn administrators(&self, chat_id: i64) -> Result<Vec<(u64, MemberInfo)>>;

    async fn member(&self, chat_id: i64, user_id: u64) -> Result<MemberInfo>;
}

#[async_trait]
impl MemberDirectory for Bot {
    async fn administrators(&self, chat_id: i64) -> Result<Vec<(u64, MemberInfo)>> {
        let admins = self
            .get_chat_administrators(ChatId(chat_id))
            .await
            .with_context(|| format!("Failed to fetch administrators of chat {}", chat_id))?;

        Ok(admins
            .into_iter()
            .map(|m| {
                (
                    m.user.id.0,
                    MemberInfo {
                        is_bot: m.user.is_bot,
                        is_admin: m.kind.is_privileged(),
                    },
                )
            })
            .collect())
    }

    async fn member(&self, chat_id: i64, user_id: u64) -> Result<MemberInfo> {
        let m = self
            .get_chat_member(ChatId(chat_id), UserId(user_id))
            .await
            .with_context(|| format!("Failed to fetch member {} of chat {}", user_id, chat_id))?;

        Ok(MemberInfo {
            is_bot: m.user.is_bot,
            is_admin: m.kind.is_privileged(),
        })
    }
}

/// Decides whether a message comes from a human, from this bot or from
/// another bot, caching group membership per chat.
pub struct Classifier {
    self_id: u64,
    known_bot_ids: HashSet<u64>,
    bot_prefix: String,
    groups: Mutex<HashMap<i64, HashMap<u64, MemberInfo>>>,
    /// Chats whose administrator list has been fetched successfully
    admins_loaded: Mutex<HashSet<i64>>,
}

impl Classifier {
    pub fn new(self_id: u64, known_bot_ids: impl IntoIterator<Item = u64>, bot_prefix: &str) -> Self {
        Self {
            self_id,
            known_bot_ids: known_bot_ids.into_iter().collect(),
            bot_prefix: bot_prefix.to_string(),
            groups: Mutex::new(HashMap::new()),
            admins_loaded: Mutex::new(HashSet::new()),
        }
    }

    pub async fn classify(
        &self,
        directory: &dyn MemberDirectory,
        chat_id: i64,
        chat_kind: ChatKind,
        sender: &Sender<'_>,
    ) -> SenderKind {
        if sender.user_id == self.self_id {
            return SenderKind::ThisBot;
        }

        let is_bot = match chat_kind {
            ChatKind::Group => self.group_member(directory, chat_id, sender).await.is_bot,
            ChatKind::Private => self.private_sender_is_bot(directory, chat_id, sender).await,
        };

        if is_bot {
            SenderKind::OtherBot
        } else {
            SenderKind::Human
        }
    }

    async fn group_member(
        &self,
        directory: &dyn MemberDirectory,
        chat_id: i64,
        sender: &Sender<'_>,
    ) -> MemberInfo {
        self.ensure_loaded(directory, chat_id).await;

        if let Some(info) = self.cached(chat_id, sender.user_id).await {
            return info;
        }

        let mut groups = self.groups.lock().await;
        *groups
            .entry(chat_id)
            .or_default()
            .entry(sender.user_id)
            .or_insert(MemberInfo {
                is_bot: sender.is_bot,
                is_admin: false,
            })
    }

    async fn private_sender_is_bot(
        &self,
        directory: &dyn MemberDirectory,
        chat_id: i64,
        sender: &Sender<'_>,
    ) -> bool {
        if sender
            .username
            .is_some_and(|u| u.to_lowercase().ends_with("bot"))
        {
            return true;
        }
        if self.known_bot_ids.contains(&sender.user_id) {
            return true;
        }
        if !self.bot_prefix.is_empty() && sender.text.starts_with(&self.bot_prefix) {
            return true;
        }

        match directory.member(chat_id, sender.user_id).await {
            Ok(info) => info.is_bot,
            Err(e) => {
                warn!("Member lookup failed, assuming human: {:#}", e);
                false
            }
        }
    }

    /// Re-fetch a group's administrators into the cache.
    /// Returns how many administrators are cached.
    pub async fn refresh(&self, directory: &dyn MemberDirectory, chat_id: i64) -> Result<usize> {
        let admins = directory.administrators(chat_id).await?;
        let count = admins.len();

        let mut groups = self.groups.lock().await;
        let members = groups.entry(chat_id).or_default();
        for info in members.values_mut() {
            info.is_admin = false;
        }
        for (user_id, info) in admins {
            members.insert(user_id, info);
        }
        drop(groups);
        self.admins_loaded.lock().await.insert(chat_id);

        info!("Cached {} administrators for chat {}", count, chat_id);
        Ok(count)
    }

    pub async fn is_admin(&self, chat_id: i64, user_id: u64) -> bool {
        self.cached(chat_id, user_id)
            .await
            .is_some_and(|info| info.is_admin)
    }

    /// Fetch a group's administrators unless a previous fetch succeeded.
    /// A failed fetch is retried on the next call.
    pub async fn ensure_loaded(&self, directory: &dyn MemberDirectory, chat_id: i64) {
        if self.admins_loaded.lock().await.contains(&chat_id) {
            return;
        }
        if let Err(e) = self.refresh(directory, chat_id).await {
            warn!("{:#}", e);
        }
    }

    pub async fn cached_members(&self, chat_id: i64) -> usize {
        self.groups
            .lock()
            .await
            .get(&chat_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    async fn cached(&self, chat_id: i64, user_id: u64) -> Option<MemberInfo> {
        let info = self
            .groups
            .lock()
            .await
            .get(&chat_id)
            .and_then(|m| m.get(&user_id))
            .copied();
        if info.is_some() {
            debug!("Member cache hit: chat={} user={}", chat_id, user_id);
        }
        info
    }
}
