use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatMemberStatus, Recipient};
use teloxide::{ApiError, RequestError};

use crate::gate::ChannelRef;
use crate::oracle::{
    AdminOracle, ChannelIdent, ChannelRole, Membership, MembershipOracle, OracleError,
};
use crate::Bot;

/// Oracle implementation backed by the Bot API.
#[derive(Clone)]
pub struct TelegramOracle {
    bot: Bot,
    owner: UserId,
}

impl TelegramOracle {
    pub fn new(bot: Bot, owner: UserId) -> Self {
        Self { bot, owner }
    }
}

fn recipient(ident: &ChannelIdent) -> Result<Recipient, OracleError> {
    match ident {
        ChannelIdent::Id(id) => Ok(Recipient::Id(*id)),
        ChannelIdent::Username(name) => Ok(Recipient::ChannelUsername(format!("@{name}"))),
        ChannelIdent::Invite(link) => Err(OracleError::UnresolvableInvite(link.clone())),
    }
}

fn request_error(e: RequestError) -> OracleError {
    OracleError::Request(e.to_string())
}

#[async_trait]
impl MembershipOracle for TelegramOracle {
    async fn is_member(&self, channel: ChatId, user: UserId) -> Result<Membership, OracleError> {
        match self.bot.get_chat_member(channel, user).await {
            Ok(member) => Ok(match member.status() {
                ChatMemberStatus::Left | ChatMemberStatus::Banned => Membership::NotMember,
                _ => Membership::Member,
            }),
            // The API reports users it has never seen in the channel this way.
            Err(RequestError::Api(ApiError::UserNotFound)) => Ok(Membership::NotMember),
            Err(e) => Err(request_error(e)),
        }
    }

    async fn resolve_channel(&self, ident: &ChannelIdent) -> Result<ChannelRef, OracleError> {
        let chat = self
            .bot
            .get_chat(recipient(ident)?)
            .await
            .map_err(|e| match e {
                RequestError::Api(ApiError::ChatNotFound) => {
                    OracleError::UnknownChannel(ident.to_string())
                }
                e => request_error(e),
            })?;

        let username = chat.username().map(str::to_owned);
        let title = chat
            .title()
            .map(str::to_owned)
            .or_else(|| username.clone())
            .unwrap_or_else(|| chat.id.to_string());

        Ok(ChannelRef {
            id: chat.id,
            title,
            username,
        })
    }

    async fn role_of(&self, channel: ChatId, user: UserId) -> Result<ChannelRole, OracleError> {
        match self.bot.get_chat_member(channel, user).await {
            Ok(member) => Ok(match member.status() {
                ChatMemberStatus::Owner => ChannelRole::Creator,
                ChatMemberStatus::Administrator => ChannelRole::Admin,
                _ => ChannelRole::Other,
            }),
            Err(RequestError::Api(ApiError::UserNotFound)) => Ok(ChannelRole::Other),
            Err(e) => Err(request_error(e)),
        }
    }
}

#[async_trait]
impl AdminOracle for TelegramOracle {
    async fn is_admin_or_owner(&self, chat: ChatId, user: UserId) -> Result<bool, OracleError> {
        if user == self.owner {
            return Ok(true);
        }
        let member = self
            .bot
            .get_chat_member(chat, user)
            .await
            .map_err(request_error)?;
        Ok(member.is_privileged())
    }
}
