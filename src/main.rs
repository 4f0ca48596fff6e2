mod config;
mod database;
mod gate;
mod messages;
mod oracle;
mod telegram;

use dptree::deps;
use teloxide::adaptors::throttle::Limits;
use teloxide::adaptors::Throttle;
use teloxide::macros::BotCommands;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, ParseMode, ReplyParameters};

use config::BotConfig;
use database::Database;
use gate::{ChannelRef, ChatContext, GateError, GateResult, OwnerChannels, SubscriptionGate};
use oracle::{AdminOracle, ChannelIdent};
use telegram::TelegramOracle;

pub type Bot = Throttle<teloxide::Bot>;

type Gate = SubscriptionGate<TelegramOracle, TelegramOracle, Database>;

/// Bits of identity the handlers need over and over.
#[derive(Clone)]
struct BotInfo {
    username: String,
    owner: UserId,
}

#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
enum Command {
    #[command(description = "start the bot.")]
    Start,
    #[command(description = "show this text.")]
    Help,
    #[command(description = "show group statistics.")]
    Stats,
    #[command(description = "show the force subscription status.")]
    Status,
    #[command(description = "explain how to configure force subscription.")]
    Setjoin,
    #[command(description = "configure force subscription, see /setjoin.")]
    Join(String),
    #[command(description = "broadcast a message to every group (owner only).")]
    Broadcast(String),
    #[command(description = "ban a user from the bot (owner only).")]
    Ban(String),
    #[command(description = "lift a ban (owner only).")]
    Unban(String),
}

#[tokio::main]
async fn main() {
    env_logger::init();
    log::info!("Starting force subscription bot...");

    let config = BotConfig::from_env().unwrap();
    let bot = teloxide::Bot::from_env().throttle(Limits::default());
    let me = bot.get_me().await.unwrap();
    let database = Database::new(&config.database_url).await.unwrap();

    let oracle = TelegramOracle::new(bot.clone(), config.owner_id);
    let gate = SubscriptionGate::new(
        OwnerChannels {
            owner: config.owner_id,
            channels: config.force_sub.clone(),
        },
        me.user.id,
        oracle.clone(),
        oracle.clone(),
        database.clone(),
    );
    let info = BotInfo {
        username: me.username().to_string(),
        owner: config.owner_id,
    };

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(answer),
        )
        .branch(Update::filter_message().endpoint(watch_group_message));

    Dispatcher::builder(bot, handler)
        .dependencies(deps![gate, database, oracle, info])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await
}

fn chat_context(msg: &Message) -> ChatContext {
    if msg.chat.is_private() {
        ChatContext::Private
    } else {
        ChatContext::Group(msg.chat.id)
    }
}

async fn reply(
    bot: &Bot,
    msg: &Message,
    text: String,
    keyboard: Option<InlineKeyboardMarkup>,
) -> ResponseResult<()> {
    let mut request = bot
        .send_message(msg.chat.id, text)
        .parse_mode(ParseMode::MarkdownV2)
        .reply_parameters(ReplyParameters::new(msg.id));
    if let Some(keyboard) = keyboard {
        request = request.reply_markup(keyboard);
    }
    request.await?;
    Ok(())
}

/// Render a `Blocked` result: one join button per missing channel. Channels
/// without a public username get a fresh invite link; channels that yield
/// neither are skipped.
async fn send_join_prompt(bot: &Bot, msg: &Message, missing: &[ChannelRef]) -> ResponseResult<()> {
    let mut buttons = Vec::with_capacity(missing.len());
    for channel in missing {
        let url = match &channel.username {
            Some(username) => format!("https://t.me/{username}"),
            None => match bot.export_chat_invite_link(channel.id).await {
                Ok(link) => link,
                Err(e) => {
                    log::warn!("cannot create an invite link for {}: {e}", channel.id);
                    continue;
                }
            },
        };
        buttons.push((format!("Join {}", channel.title), url));
    }

    reply(
        bot,
        msg,
        messages::access_restricted(),
        Some(messages::url_keyboard(&buttons)),
    )
    .await
}

async fn answer(
    bot: Bot,
    msg: Message,
    cmd: Command,
    gate: Gate,
    db: Database,
    oracle: TelegramOracle,
    info: BotInfo,
) -> ResponseResult<()> {
    log::info!("{:?}", cmd);
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };

    if user.id != info.owner {
        match db.is_banned(user.id).await {
            Ok(true) => {
                log::debug!("ignoring banned user {}", user.id);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => log::error!("Database error: {e}"),
        }
    }

    let context = chat_context(&msg);

    // Runs the gate before the command body; start, stats, status and
    // setjoin are gated, the owner utilities and /help are not.
    macro_rules! require_subscribed {
        () => {
            if let GateResult::Blocked(missing) = gate.evaluate(user.id, context).await {
                send_join_prompt(&bot, &msg, &missing).await?;
                return Ok(());
            }
        };
    }

    macro_rules! require_group_admin {
        () => {{
            let ChatContext::Group(chat_id) = context else {
                return reply(&bot, &msg, messages::group_only(), None).await;
            };
            match oracle.is_admin_or_owner(chat_id, user.id).await {
                Ok(true) => chat_id,
                Ok(false) => {
                    return reply(&bot, &msg, messages::admins_only(), None).await;
                }
                Err(e) => {
                    log::warn!("admin check in {chat_id} failed: {e}");
                    return reply(&bot, &msg, messages::internal_error(), None).await;
                }
            }
        }};
    }

    match cmd {
        Command::Start => {
            require_subscribed!();
            if let Err(e) = db
                .upsert_user(user.id, user.username.as_deref(), &user.first_name)
                .await
            {
                log::error!("Database error: {e}");
            }
            if msg.chat.is_private() {
                reply(
                    &bot,
                    &msg,
                    messages::start_private(&user.first_name),
                    Some(messages::add_to_group_button(&info.username)),
                )
                .await?;
            } else {
                reply(&bot, &msg, messages::start_group(), None).await?;
            }
        }
        Command::Help => {
            reply(&bot, &msg, messages::help(), None).await?;
        }
        Command::Stats => {
            require_subscribed!();
            let chat_id = require_group_admin!();
            let stats = match db.group_stats(chat_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    log::error!("Database error: {e}");
                    return reply(&bot, &msg, messages::internal_error(), None).await;
                }
            };
            let enforced = match db.group_config(chat_id).await {
                Ok(Some(config)) => config.enabled && !config.effective_channels().is_empty(),
                Ok(None) => false,
                Err(e) => {
                    log::error!("Database error: {e}");
                    false
                }
            };
            reply(&bot, &msg, messages::group_stats(&stats, enforced), None).await?;
        }
        Command::Status => {
            require_subscribed!();
            let chat_id = require_group_admin!();
            let text = match db.group_config(chat_id).await {
                Ok(Some(config)) => messages::status(&config),
                Ok(None) => messages::no_config(),
                Err(e) => {
                    log::error!("Database error: {e}");
                    messages::internal_error()
                }
            };
            reply(&bot, &msg, text, None).await?;
        }
        Command::Setjoin => {
            require_subscribed!();
            let _chat_id = require_group_admin!();
            reply(&bot, &msg, messages::setjoin(), None).await?;
        }
        Command::Join(args) => {
            handle_join(&bot, &msg, &gate, &db, user.id, &info, args.trim()).await?;
        }
        Command::Broadcast(text) => {
            if user.id != info.owner {
                return Ok(());
            }
            handle_broadcast(&bot, &msg, &db, text.trim()).await?;
        }
        Command::Ban(args) => {
            if user.id != info.owner {
                return Ok(());
            }
            handle_ban(&bot, &msg, &db, args.trim(), true).await?;
        }
        Command::Unban(args) => {
            if user.id != info.owner {
                return Ok(());
            }
            handle_ban(&bot, &msg, &db, args.trim(), false).await?;
        }
    }

    Ok(())
}

async fn handle_join(
    bot: &Bot,
    msg: &Message,
    gate: &Gate,
    db: &Database,
    user_id: UserId,
    info: &BotInfo,
    args: &str,
) -> ResponseResult<()> {
    if msg.chat.is_private() {
        return reply(bot, msg, messages::group_only(), None).await;
    }
    let chat_id = msg.chat.id;

    match args.to_lowercase().as_str() {
        "off" | "disable" => {
            let text = match gate.set_enabled(chat_id, user_id, false).await {
                Ok(()) => messages::enforcement_disabled(),
                Err(e) => messages::mutation_failed(&e),
            };
            reply(bot, msg, text, None).await
        }
        "on" | "enable" => match gate.set_enabled(chat_id, user_id, true).await {
            Ok(()) => {
                let channels = match db.group_config(chat_id).await {
                    Ok(Some(config)) => config.effective_channels(),
                    _ => Vec::new(),
                };
                reply(bot, msg, messages::enforcement_enabled(&channels), None).await
            }
            Err(e) => reply(bot, msg, messages::mutation_failed(&e), None).await,
        },
        "clear" | "reset" => {
            let text = match gate.clear(chat_id, user_id).await {
                Ok(()) => messages::config_cleared(),
                Err(e) => messages::mutation_failed(&e),
            };
            reply(bot, msg, text, None).await
        }
        "" => {
            let text = match db.group_config(chat_id).await {
                Ok(Some(config)) => messages::status(&config),
                Ok(None) => messages::join_usage(),
                Err(e) => {
                    log::error!("Database error: {e}");
                    messages::internal_error()
                }
            };
            reply(bot, msg, text, None).await
        }
        _ => {
            let mut idents = Vec::new();
            for token in args.split_whitespace() {
                match ChannelIdent::parse(token) {
                    Ok(ident) => idents.push(ident),
                    Err(e) => {
                        return reply(bot, msg, messages::bad_channel(&e), None).await;
                    }
                }
            }
            match gate.set_channels(chat_id, user_id, &idents).await {
                Ok(config) => {
                    reply(bot, msg, messages::channels_configured(&config.channels), None).await
                }
                Err(e @ GateError::BotNotAdmin(_)) => {
                    reply(
                        bot,
                        msg,
                        messages::mutation_failed(&e),
                        Some(messages::add_to_channel_button(&info.username)),
                    )
                    .await
                }
                Err(e) => reply(bot, msg, messages::mutation_failed(&e), None).await,
            }
        }
    }
}

async fn handle_broadcast(
    bot: &Bot,
    msg: &Message,
    db: &Database,
    text: &str,
) -> ResponseResult<()> {
    if text.is_empty() {
        return reply(bot, msg, messages::broadcast_usage(), None).await;
    }

    let groups = match db.known_group_ids().await {
        Ok(groups) => groups,
        Err(e) => {
            log::error!("Database error: {e}");
            return reply(bot, msg, messages::internal_error(), None).await;
        }
    };

    // Sequential on purpose; the throttle adaptor paces the requests.
    let mut delivered = 0usize;
    let mut failed = 0usize;
    for chat_id in groups {
        match bot.send_message(chat_id, text.to_string()).await {
            Ok(_) => delivered += 1,
            Err(e) => {
                log::warn!("broadcast to {chat_id} failed: {e}");
                failed += 1;
            }
        }
    }

    log::info!("Broadcast finished: {delivered} delivered, {failed} failed");
    reply(bot, msg, messages::broadcast_report(delivered, failed), None).await
}

fn target_user(msg: &Message, args: &str) -> Option<UserId> {
    if let Ok(id) = args.parse::<u64>() {
        return Some(UserId(id));
    }
    msg.reply_to_message()
        .and_then(|m| m.from.as_ref())
        .map(|u| u.id)
}

async fn handle_ban(
    bot: &Bot,
    msg: &Message,
    db: &Database,
    args: &str,
    banned: bool,
) -> ResponseResult<()> {
    let Some(target) = target_user(msg, args) else {
        return reply(bot, msg, messages::ban_usage(), None).await;
    };

    match db.set_banned(target, banned).await {
        Ok(()) => {
            let text = if banned {
                messages::user_banned(target)
            } else {
                messages::user_unbanned(target)
            };
            reply(bot, msg, text, None).await
        }
        Err(e) => {
            log::error!("Database error: {e}");
            reply(bot, msg, messages::internal_error(), None).await
        }
    }
}

/// Plain group traffic: keep the activity counters current and enforce the
/// subscription requirement on everyone who is not an admin.
async fn watch_group_message(
    bot: Bot,
    msg: Message,
    gate: Gate,
    db: Database,
    oracle: TelegramOracle,
) -> ResponseResult<()> {
    if !(msg.chat.is_group() || msg.chat.is_supergroup()) {
        return Ok(());
    }
    let Some(user) = msg.from.clone() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }

    if let Err(e) = db.record_group_message(msg.chat.id, user.id).await {
        log::error!("Database error: {e}");
    }

    match oracle.is_admin_or_owner(msg.chat.id, user.id).await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) => log::warn!("admin check in {} failed: {e}", msg.chat.id),
    }

    let result = gate.evaluate(user.id, ChatContext::Group(msg.chat.id)).await;
    if let GateResult::Blocked(missing) = result {
        if let Err(e) = bot.delete_message(msg.chat.id, msg.id).await {
            log::warn!("cannot delete message {} in {}: {e}", msg.id.0, msg.chat.id);
        }
        send_join_prompt(&bot, &msg, &missing).await?;
    }

    Ok(())
}
