use std::sync::Arc;

use teloxide::dispatching::{HandlerExt, ShutdownToken};
use teloxide::prelude::*;
use teloxide::types::{ChatAction, Me};
use teloxide::utils::command::BotCommands;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{BotState, IncomingMessage, Intake, Outcome, ERROR_REPLY};
use crate::members::ChatKind;

/// Telegram's limit is 4096; leave some headroom
const MAX_MESSAGE_LEN: usize = 4000;

#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "start or resume the bot in this chat")]
    Start,
    #[command(description = "show help")]
    Help,
    #[command(description = "show diagnostics")]
    Debug,
    #[command(description = "pause replies in this chat")]
    Stop,
    #[command(description = "pause replies and clear memory")]
    StopClear,
    #[command(description = "clear conversation memory")]
    ClearMemory,
    #[command(rename = "update_members", description = "refresh the administrator list")]
    UpdateMembers,
}

impl Command {
    /// Commands restricted to administrators in group chats
    pub fn admin_only(&self) -> bool {
        matches!(
            self,
            Command::Stop | Command::StopClear | Command::ClearMemory | Command::UpdateMembers
        )
    }
}

/// Split a reply into chunks of at most `max_len` bytes, breaking at a
/// newline or space when one is available.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // Limit narrower than one character: emit that character whole
            end += text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Start update dispatch in a background task.
pub fn launch(bot: Bot, state: Arc<BotState>) -> (ShutdownToken, JoinHandle<()>) {
    let handler = Update::filter_message()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(dptree::endpoint(handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .build();

    let token = dispatcher.shutdown_token();
    let task = tokio::spawn(async move {
        info!("Starting Telegram dispatcher...");
        dispatcher.dispatch().await;
        info!("Telegram dispatcher stopped");
    });

    (token, task)
}

fn to_incoming(msg: &Message, me: &Me) -> Option<IncomingMessage> {
    let user = msg.from.as_ref()?;

    let chat_kind = if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_group() || msg.chat.is_supergroup() {
        ChatKind::Group
    } else {
        return None;
    };

    let replies_to_bot = msg
        .reply_to_message()
        .and_then(|r| r.from.as_ref())
        .is_some_and(|u| u.id == me.user.id);

    Some(IncomingMessage {
        chat_id: msg.chat.id.0,
        chat_kind,
        user_id: user.id.0,
        username: user.username.clone(),
        is_bot: user.is_bot,
        text: msg.text().map(str::to_string),
        replies_to_bot,
    })
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    me: Me,
    cmd: Command,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(incoming) = to_incoming(&msg, &me) else {
        return Ok(());
    };

    info!(
        "Command {:?} from user {} in chat {}",
        cmd, incoming.user_id, incoming.chat_id
    );

    let reply = match state.run_command(&bot, &incoming, &cmd).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("Error running command {:?}: {:#}", cmd, e);
            ERROR_REPLY.to_string()
        }
    };

    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    me: Me,
    state: Arc<BotState>,
) -> ResponseResult<()> {
    let Some(incoming) = to_incoming(&msg, &me) else {
        return Ok(());
    };

    let outcome = match state.intake(&bot, &incoming).await {
        None => return Ok(()),
        Some(Intake::Notice(text)) => Outcome::Notice(text),
        Some(Intake::Question {
            session_id,
            question,
        }) => {
            bot.send_chat_action(msg.chat.id, ChatAction::Typing)
                .await
                .ok();
            state.answer(session_id, question).await
        }
    };

    match outcome {
        Outcome::Notice(text) => {
            bot.send_message(msg.chat.id, text).await?;
        }
        Outcome::Answer {
            session_id,
            question,
            text,
        } => {
            for chunk in split_message(&text, MAX_MESSAGE_LEN) {
                bot.send_message(msg.chat.id, chunk).await?;
            }

            if let Err(e) = state.save_turn(&session_id, &question, &text).await {
                error!("Failed to save conversation turn: {:#}", e);
                bot.send_message(msg.chat.id, ERROR_REPLY).await?;
            }
        }
    }

    Ok(())
}
