//! All user-visible reply texts, pre-escaped for MarkdownV2, plus the inline
//! keyboards that go with them.

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, UserId};
use teloxide::utils::markdown::{bold, code_inline, escape};

use crate::database::GroupStats;
use crate::gate::{ChannelRef, GateError, GroupSubscriptionConfig, MAX_CHANNELS};
use crate::oracle::InvalidChannelIdent;

pub fn start_private(first_name: &str) -> String {
    bold(&escape(&format!("👋 Hello {first_name}!")))
        + "\n\n"
        + &escape(
            "I am a force subscription bot. Add me to your group and I will \
            make sure members join your channels before they can chat.",
        )
        + "\n\n"
        + &bold(&escape("Commands:"))
        + "\n"
        + &escape(
            "• /setjoin – how to set up force subscription\n\
            • /join – configure, enable or disable it\n\
            • /status – current force subscription status\n\
            • /stats – group statistics\n\
            • /broadcast – broadcast a message (owner only)\n\
            • /ban, /unban – manage the bot ban list (owner only)",
        )
        + "\n\n"
        + &escape(&format!(
            "Note: up to {MAX_CHANNELS} channels can be required at once."
        ))
}

pub fn start_group() -> String {
    escape("I'm alive! Use /help to see available commands.")
}

pub fn help() -> String {
    bold(&escape("📚 Force subscription bot"))
        + "\n\n"
        + &bold(&escape("Admin commands:"))
        + "\n"
        + &escape(&format!(
            "• /join <channel …> – require up to {MAX_CHANNELS} channels\n\
            • /join on|off – toggle enforcement\n\
            • /join clear – remove the configuration\n\
            • /status – current configuration\n\
            • /stats – group statistics",
        ))
        + "\n\n"
        + &bold(&escape("How to use:"))
        + "\n"
        + &escape(
            "1. Add me to your group as admin\n\
            2. Make me admin in every channel you want to require\n\
            3. Use /join in your group",
        )
}

pub fn setjoin() -> String {
    bold(&escape("📝 How to use force subscription"))
        + "\n\n"
        + &bold(&escape("Single channel:"))
        + "\n"
        + &escape("• /join @channel\n• /join -100123456789")
        + "\n\n"
        + &bold(&escape(&format!("Multiple channels (max {MAX_CHANNELS}):")))
        + "\n"
        + &escape("• /join @ch1 @ch2 @ch3\n• /join -100123456789 -100987654321")
        + "\n\n"
        + &bold(&escape("Disable or remove:"))
        + "\n"
        + &escape("• /join off\n• /join clear")
        + "\n\n"
        + &escape("Note: make sure I'm an admin in all channels.")
}

pub fn access_restricted() -> String {
    bold(&escape("⚠️ Access restricted"))
        + "\n\n"
        + &escape(
            "You must join the channel(s) below first. \
            Tap the buttons, join, then try again.",
        )
}

pub fn group_only() -> String {
    escape("⚠️ This command can only be used in groups.")
}

pub fn admins_only() -> String {
    escape("🚫 Only group admins can use this command.")
}

pub fn join_usage() -> String {
    escape(
        "Usage: /join <channel …> to require channels, /join on|off to toggle \
        enforcement, /join clear to remove the configuration. See /setjoin.",
    )
}

fn channel_line(channel: &ChannelRef) -> String {
    let mut line = escape(&channel.title);
    if let Some(username) = &channel.username {
        line += &escape(&format!(" (@{username})"));
    }
    line + " " + &code_inline(&channel.id.to_string())
}

pub fn status(config: &GroupSubscriptionConfig) -> String {
    let channels = config.effective_channels();
    let mut text = bold(&escape("📱 Force subscription status"))
        + "\n\n"
        + &escape(&format!(
            "State: {}\nMode: {}\nChannels: {}",
            if config.enabled { "enabled" } else { "disabled" },
            config.mode.as_str(),
            channels.len()
        ));

    if !channels.is_empty() {
        text += "\n\n";
        text += &bold(&escape("Configured channels:"));
        for (i, channel) in channels.iter().enumerate() {
            text += &format!("\n{} {}", escape(&format!("{}.", i + 1)), channel_line(channel));
        }
    }

    text
}

pub fn no_config() -> String {
    escape("Force subscription is not configured for this group. Use /setjoin to get started.")
}

pub fn group_stats(stats: &GroupStats, enforced: bool) -> String {
    bold(&escape("📊 Group statistics"))
        + "\n\n"
        + &escape(&format!(
            "Total messages: {}\nActive users: {}\nForce subscription: {}",
            stats.total_messages,
            stats.active_users,
            if enforced { "enabled" } else { "disabled" }
        ))
}

pub fn channels_configured(channels: &[ChannelRef]) -> String {
    let mut text = escape(&format!(
        "🎉 Successfully configured {} channel(s). Force subscription is now enabled.",
        channels.len()
    ));
    for channel in channels {
        text += &format!("\n{} {}", escape("•"), channel_line(channel));
    }
    text
}

pub fn enforcement_enabled(channels: &[ChannelRef]) -> String {
    let mut text = escape("✅ Force subscription has been enabled.");
    if !channels.is_empty() {
        text += "\n\n";
        text += &bold(&escape("Required channels:"));
        for channel in channels {
            text += &format!("\n{} {}", escape("•"), channel_line(channel));
        }
    }
    text
}

pub fn enforcement_disabled() -> String {
    escape("❌ Force subscription has been disabled.")
}

pub fn config_cleared() -> String {
    escape("Force subscription has been removed for this group.")
}

pub fn bad_channel(err: &InvalidChannelIdent) -> String {
    escape(&format!(
        "I don't understand \"{}\". Pass a numeric channel id, a @username or a t.me link.",
        err.0
    ))
}

pub fn mutation_failed(err: &GateError) -> String {
    match err {
        GateError::ConfigNotFound => {
            escape("No channels configured yet. Use /join <channels> first, see /setjoin.")
        }
        GateError::ChannelResolutionFailed(ident) => escape(&format!(
            "I cannot find the channel {ident}. Check the username or id, and make sure I can see it."
        )),
        GateError::BotNotAdmin(channel) => escape(&format!(
            "🚫 I'm not an admin in {}. Promote me there first, then try again.",
            channel.title
        )),
        GateError::TooManyChannels(n) => escape(&format!(
            "⚠️ Got {n} channels, at most {MAX_CHANNELS} are allowed."
        )),
        GateError::PermissionDenied => admins_only(),
        GateError::OracleUnavailable | GateError::Store(_) => internal_error(),
    }
}

pub fn broadcast_usage() -> String {
    escape("Usage: /broadcast <text>")
}

pub fn broadcast_report(delivered: usize, failed: usize) -> String {
    bold(&escape("📢 Broadcast completed"))
        + "\n\n"
        + &escape(&format!("Delivered: {delivered}\nFailed: {failed}"))
}

pub fn ban_usage() -> String {
    escape("Reply to a message from the user or pass a numeric user id.")
}

pub fn user_banned(user_id: UserId) -> String {
    escape(&format!("✅ User {user_id} can no longer use the bot."))
}

pub fn user_unbanned(user_id: UserId) -> String {
    escape(&format!("✅ User {user_id} has been unbanned."))
}

pub fn internal_error() -> String {
    escape("Sorry, an internal error occurred :(")
}

/// One URL button per row. Entries whose URL does not parse are dropped.
pub fn url_keyboard(buttons: &[(String, String)]) -> InlineKeyboardMarkup {
    let rows: Vec<_> = buttons
        .iter()
        .filter_map(|(label, url)| {
            let url = url.parse().ok()?;
            Some(vec![InlineKeyboardButton::url(label.clone(), url)])
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

pub fn add_to_group_button(bot_username: &str) -> InlineKeyboardMarkup {
    url_keyboard(&[(
        "➕ Add me to your group".to_string(),
        format!("https://t.me/{bot_username}?startgroup=true"),
    )])
}

pub fn add_to_channel_button(bot_username: &str) -> InlineKeyboardMarkup {
    url_keyboard(&[(
        "➕ Add me to your channel".to_string(),
        format!("https://t.me/{bot_username}?startchannel=true&admin=invite_users"),
    )])
}
