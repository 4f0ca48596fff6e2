//! Read-only capabilities the gate consults: channel membership, channel
//! resolution and chat-admin lookups. The traits are implemented against the
//! Bot API in [`crate::telegram`] and replaced by deterministic fakes in
//! tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use teloxide::types::{ChatId, UserId};
use thiserror::Error;

use crate::gate::ChannelRef;

/// Answer to a single membership lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Member,
    NotMember,
}

/// Role an account holds in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Admin,
    Creator,
    Other,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("unknown channel {0}")]
    UnknownChannel(String),
    #[error("invite links cannot be inspected: {0}")]
    UnresolvableInvite(String),
    #[error("telegram request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_member(&self, channel: ChatId, user: UserId) -> Result<Membership, OracleError>;

    async fn resolve_channel(&self, ident: &ChannelIdent) -> Result<ChannelRef, OracleError>;

    async fn role_of(&self, channel: ChatId, user: UserId) -> Result<ChannelRole, OracleError>;
}

/// The one factored-out admin check. Group commands and the gate's mutation
/// operations both go through this instead of iterating participants
/// themselves.
#[async_trait]
pub trait AdminOracle: Send + Sync {
    async fn is_admin_or_owner(&self, chat: ChatId, user: UserId) -> Result<bool, OracleError>;
}

#[async_trait]
impl<T: MembershipOracle + ?Sized> MembershipOracle for Arc<T> {
    async fn is_member(&self, channel: ChatId, user: UserId) -> Result<Membership, OracleError> {
        (**self).is_member(channel, user).await
    }

    async fn resolve_channel(&self, ident: &ChannelIdent) -> Result<ChannelRef, OracleError> {
        (**self).resolve_channel(ident).await
    }

    async fn role_of(&self, channel: ChatId, user: UserId) -> Result<ChannelRole, OracleError> {
        (**self).role_of(channel, user).await
    }
}

#[async_trait]
impl<T: AdminOracle + ?Sized> AdminOracle for Arc<T> {
    async fn is_admin_or_owner(&self, chat: ChatId, user: UserId) -> Result<bool, OracleError> {
        (**self).is_admin_or_owner(chat, user).await
    }
}

/// A channel reference as users type it: a numeric id, a `@username` (with
/// or without the `t.me` prefix) or an invite link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIdent {
    Id(ChatId),
    /// Stored without the leading `@`.
    Username(String),
    /// Full invite link. Parses fine, but the Bot API offers no way to look
    /// behind it, so resolution always fails.
    Invite(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0:?} is not a channel id, @username or t.me link")]
pub struct InvalidChannelIdent(pub String);

lazy_static! {
    static ref USERNAME_RE: Regex = Regex::new("^@?([A-Za-z][A-Za-z0-9_]{3,31})$").unwrap();
    static ref LINK_RE: Regex = Regex::new("^(?:https?://)?t\\.me/(.+)$").unwrap();
}

impl ChannelIdent {
    pub fn parse(input: &str) -> Result<Self, InvalidChannelIdent> {
        let input = input.trim();
        if let Ok(id) = input.parse::<i64>() {
            return Ok(ChannelIdent::Id(ChatId(id)));
        }

        let rest = match LINK_RE.captures(input) {
            Some(caps) => {
                let rest = caps[1].trim_end_matches('/');
                if rest.starts_with('+') || rest.starts_with("joinchat/") {
                    return Ok(ChannelIdent::Invite(format!("https://t.me/{rest}")));
                }
                rest.to_string()
            }
            None => input.to_string(),
        };

        match USERNAME_RE.captures(&rest) {
            Some(caps) => Ok(ChannelIdent::Username(caps[1].to_string())),
            None => Err(InvalidChannelIdent(input.to_string())),
        }
    }
}

impl fmt::Display for ChannelIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelIdent::Id(id) => write!(f, "{id}"),
            ChannelIdent::Username(name) => write!(f, "@{name}"),
            ChannelIdent::Invite(link) => f.write_str(link),
        }
    }
}
