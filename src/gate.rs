//! The force-subscription gate.
//!
//! Decides whether a user may act in a given chat context by combining the
//! owner-level channel list (private chats) with the per-group configuration
//! (group chats). Lookups go through the [`MembershipOracle`]; configuration
//! lives behind the [`GroupConfigStore`]. The gate holds no mutable state of
//! its own, so concurrent evaluations for different chats are independent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teloxide::types::{ChatId, UserId};
use thiserror::Error;

use crate::oracle::{AdminOracle, ChannelIdent, ChannelRole, Membership, MembershipOracle};

/// Hard cap on required channels, for groups and the owner list alike.
pub const MAX_CHANNELS: usize = 4;

/// A channel users can be required to join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: ChatId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionMode {
    Single,
    Multiple,
}

impl SubscriptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionMode::Single => "single",
            SubscriptionMode::Multiple => "multiple",
        }
    }

    pub fn for_channel_count(count: usize) -> Self {
        if count > 1 {
            SubscriptionMode::Multiple
        } else {
            SubscriptionMode::Single
        }
    }
}

/// Per-group force-subscription record, one per configured chat.
///
/// `channel_id`/`channel_username` are what the retired single-channel
/// command wrote. They are still honored when reading old records, but every
/// new write goes through `channels` and clears them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSubscriptionConfig {
    pub chat_id: ChatId,
    pub mode: SubscriptionMode,
    pub channels: Vec<ChannelRef>,
    pub enabled: bool,
    pub channel_id: Option<ChatId>,
    pub channel_username: Option<String>,
}

impl GroupSubscriptionConfig {
    /// The channels enforcement applies to. The multi-channel list wins;
    /// otherwise a legacy single-channel pair is synthesized into a ref.
    pub fn effective_channels(&self) -> Vec<ChannelRef> {
        if !self.channels.is_empty() {
            return self.channels.clone();
        }
        let Some(id) = self.channel_id else {
            return Vec::new();
        };
        // The legacy username column held an invite link when the channel
        // had no public handle.
        let username = self
            .channel_username
            .as_deref()
            .filter(|u| !u.contains('/'))
            .map(|u| u.trim_start_matches('@').to_string());
        let title = username.clone().unwrap_or_else(|| id.to_string());
        vec![ChannelRef {
            id,
            title,
            username,
        }]
    }
}

/// Chat context an update arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatContext {
    Private,
    Group(ChatId),
}

/// Outcome of an access evaluation. `Blocked` carries the channels the user
/// still has to join, in configured order, so prompts render
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateResult {
    Allowed,
    Blocked(Vec<ChannelRef>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("config store error: {0}")]
pub struct StoreError(pub String);

#[async_trait]
pub trait GroupConfigStore: Send + Sync {
    async fn get(&self, chat_id: ChatId) -> Result<Option<GroupSubscriptionConfig>, StoreError>;

    async fn upsert(&self, config: &GroupSubscriptionConfig) -> Result<(), StoreError>;

    async fn delete(&self, chat_id: ChatId) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: GroupConfigStore + ?Sized> GroupConfigStore for std::sync::Arc<T> {
    async fn get(&self, chat_id: ChatId) -> Result<Option<GroupSubscriptionConfig>, StoreError> {
        (**self).get(chat_id).await
    }

    async fn upsert(&self, config: &GroupSubscriptionConfig) -> Result<(), StoreError> {
        (**self).upsert(config).await
    }

    async fn delete(&self, chat_id: ChatId) -> Result<(), StoreError> {
        (**self).delete(chat_id).await
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("force subscription is not configured for this chat")]
    ConfigNotFound,
    #[error("cannot resolve channel {0}")]
    ChannelResolutionFailed(ChannelIdent),
    #[error("bot is not an admin in {}", .0.title)]
    BotNotAdmin(ChannelRef),
    #[error("got {0} channels, at most {MAX_CHANNELS} are allowed")]
    TooManyChannels(usize),
    #[error("only chat admins or the bot owner may change this")]
    PermissionDenied,
    #[error("membership lookup is currently unavailable")]
    OracleUnavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Owner-level force-subscription list, fixed at startup.
#[derive(Debug, Clone)]
pub struct OwnerChannels {
    pub owner: UserId,
    pub channels: Vec<ChatId>,
}

#[derive(Clone)]
pub struct SubscriptionGate<M, A, S> {
    owner: OwnerChannels,
    bot_id: UserId,
    membership: M,
    admins: A,
    store: S,
}

impl<M, A, S> SubscriptionGate<M, A, S>
where
    M: MembershipOracle,
    A: AdminOracle,
    S: GroupConfigStore,
{
    pub fn new(owner: OwnerChannels, bot_id: UserId, membership: M, admins: A, store: S) -> Self {
        Self {
            owner,
            bot_id,
            membership,
            admins,
            store,
        }
    }

    /// Decide whether `user` may act in `context`. Never fails: a store
    /// outage or a failed per-channel lookup degrades to "allowed" so a
    /// flaky backend cannot lock a whole group out.
    pub async fn evaluate(&self, user: UserId, context: ChatContext) -> GateResult {
        match context {
            ChatContext::Private => self.evaluate_private(user).await,
            ChatContext::Group(chat_id) => self.evaluate_group(chat_id, user).await,
        }
    }

    async fn evaluate_private(&self, user: UserId) -> GateResult {
        if self.owner.channels.is_empty() || user == self.owner.owner {
            return GateResult::Allowed;
        }

        let mut missing = Vec::new();
        for &channel_id in &self.owner.channels {
            match self.membership.is_member(channel_id, user).await {
                Ok(Membership::Member) => {}
                Ok(Membership::NotMember) => {
                    match self
                        .membership
                        .resolve_channel(&ChannelIdent::Id(channel_id))
                        .await
                    {
                        Ok(channel) => missing.push(channel),
                        Err(e) => {
                            log::warn!("required channel {channel_id} does not resolve: {e}")
                        }
                    }
                }
                Err(e) => log::warn!("membership lookup in {channel_id} failed, letting {user} pass: {e}"),
            }
        }

        if missing.is_empty() {
            GateResult::Allowed
        } else {
            GateResult::Blocked(missing)
        }
    }

    async fn evaluate_group(&self, chat_id: ChatId, user: UserId) -> GateResult {
        let config = match self.store.get(chat_id).await {
            Ok(Some(config)) => config,
            Ok(None) => return GateResult::Allowed,
            Err(e) => {
                log::error!("config lookup for {chat_id} failed, not enforcing: {e}");
                return GateResult::Allowed;
            }
        };

        if !config.enabled {
            return GateResult::Allowed;
        }

        // An enabled record without any channel data is a contradiction;
        // treat it as "not enforced".
        let mut missing = Vec::new();
        for channel in config.effective_channels() {
            match self.membership.is_member(channel.id, user).await {
                Ok(Membership::Member) => {}
                Ok(Membership::NotMember) => missing.push(channel),
                Err(e) => log::warn!(
                    "membership lookup in {} failed, letting {user} pass: {e}",
                    channel.id
                ),
            }
        }

        if missing.is_empty() {
            GateResult::Allowed
        } else {
            GateResult::Blocked(missing)
        }
    }

    /// Replace the group's required channels. Resolves every identifier and
    /// verifies the bot can administer each channel before anything is
    /// written; a single failure aborts the whole operation with the store
    /// untouched.
    pub async fn set_channels(
        &self,
        chat_id: ChatId,
        requester: UserId,
        channels: &[ChannelIdent],
    ) -> Result<GroupSubscriptionConfig, GateError> {
        if channels.len() > MAX_CHANNELS {
            return Err(GateError::TooManyChannels(channels.len()));
        }
        self.require_admin(chat_id, requester).await?;

        let mut resolved = Vec::with_capacity(channels.len());
        for ident in channels {
            let channel = self.membership.resolve_channel(ident).await.map_err(|e| {
                log::info!("channel {ident} did not resolve: {e}");
                GateError::ChannelResolutionFailed(ident.clone())
            })?;
            match self.membership.role_of(channel.id, self.bot_id).await {
                Ok(ChannelRole::Admin | ChannelRole::Creator) => resolved.push(channel),
                Ok(ChannelRole::Other) => return Err(GateError::BotNotAdmin(channel)),
                Err(e) => {
                    log::warn!("role lookup in {} failed: {e}", channel.id);
                    return Err(GateError::OracleUnavailable);
                }
            }
        }

        let config = GroupSubscriptionConfig {
            chat_id,
            mode: SubscriptionMode::for_channel_count(resolved.len()),
            channels: resolved,
            enabled: true,
            channel_id: None,
            channel_username: None,
        };
        self.store.upsert(&config).await?;
        log::info!(
            "force subscription for {chat_id} now requires {} channel(s)",
            config.channels.len()
        );
        Ok(config)
    }

    /// Toggle enforcement without touching the channel list. Enabling
    /// requires an existing configuration with channels; disabling something
    /// that was never configured is already done.
    pub async fn set_enabled(
        &self,
        chat_id: ChatId,
        requester: UserId,
        enabled: bool,
    ) -> Result<(), GateError> {
        self.require_admin(chat_id, requester).await?;

        let Some(mut config) = self.store.get(chat_id).await? else {
            if enabled {
                return Err(GateError::ConfigNotFound);
            }
            return Ok(());
        };
        if enabled && config.effective_channels().is_empty() {
            return Err(GateError::ConfigNotFound);
        }

        config.enabled = enabled;
        self.store.upsert(&config).await?;
        Ok(())
    }

    /// Remove the configuration entirely (the old "off" semantics).
    pub async fn clear(&self, chat_id: ChatId, requester: UserId) -> Result<(), GateError> {
        self.require_admin(chat_id, requester).await?;
        self.store.delete(chat_id).await?;
        Ok(())
    }

    async fn require_admin(&self, chat_id: ChatId, requester: UserId) -> Result<(), GateError> {
        match self.admins.is_admin_or_owner(chat_id, requester).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(GateError::PermissionDenied),
            Err(e) => {
                log::warn!("admin lookup in {chat_id} failed: {e}");
                Err(GateError::OracleUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::oracle::OracleError;

    const OWNER: UserId = UserId(1000);
    const BOT: UserId = UserId(2000);
    const USER: UserId = UserId(3000);
    const GROUP: ChatId = ChatId(-555);

    const CH_A: ChatId = ChatId(-100_111);
    const CH_B: ChatId = ChatId(-100_222);
    const CH_C: ChatId = ChatId(-100_333);
    const CH_D: ChatId = ChatId(-100_444);
    const CH_E: ChatId = ChatId(-100_555);

    fn channel(id: ChatId, title: &str) -> ChannelRef {
        ChannelRef {
            id,
            title: title.to_string(),
            username: None,
        }
    }

    #[derive(Default)]
    struct FakeOracle {
        members: HashSet<(ChatId, UserId)>,
        channels: HashMap<ChatId, ChannelRef>,
        bot_admin_in: HashSet<ChatId>,
        failing: HashSet<ChatId>,
        unresolvable: HashSet<ChatId>,
        lookups: AtomicUsize,
    }

    impl FakeOracle {
        fn with_channels(channels: &[ChannelRef]) -> Self {
            Self {
                channels: channels.iter().map(|c| (c.id, c.clone())).collect(),
                ..Self::default()
            }
        }

        fn member(mut self, channel: ChatId, user: UserId) -> Self {
            self.members.insert((channel, user));
            self
        }

        fn bot_admin_in(mut self, channel: ChatId) -> Self {
            self.bot_admin_in.insert(channel);
            self
        }

        fn failing(mut self, channel: ChatId) -> Self {
            self.failing.insert(channel);
            self
        }

        fn unresolvable(mut self, channel: ChatId) -> Self {
            self.unresolvable.insert(channel);
            self
        }

        fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MembershipOracle for FakeOracle {
        async fn is_member(
            &self,
            channel: ChatId,
            user: UserId,
        ) -> Result<Membership, OracleError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&channel) {
                return Err(OracleError::Request("timeout".into()));
            }
            Ok(if self.members.contains(&(channel, user)) {
                Membership::Member
            } else {
                Membership::NotMember
            })
        }

        async fn resolve_channel(&self, ident: &ChannelIdent) -> Result<ChannelRef, OracleError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let id = match ident {
                ChannelIdent::Id(id) => *id,
                other => return Err(OracleError::UnknownChannel(other.to_string())),
            };
            if self.unresolvable.contains(&id) {
                return Err(OracleError::UnknownChannel(id.to_string()));
            }
            self.channels
                .get(&id)
                .cloned()
                .ok_or_else(|| OracleError::UnknownChannel(id.to_string()))
        }

        async fn role_of(&self, channel: ChatId, _user: UserId) -> Result<ChannelRole, OracleError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(&channel) {
                return Err(OracleError::Request("timeout".into()));
            }
            Ok(if self.bot_admin_in.contains(&channel) {
                ChannelRole::Admin
            } else {
                ChannelRole::Other
            })
        }
    }

    struct FakeAdmins {
        admins: HashSet<(ChatId, UserId)>,
        failing: bool,
    }

    impl FakeAdmins {
        fn with(chat: ChatId, user: UserId) -> Self {
            Self {
                admins: HashSet::from([(chat, user)]),
                failing: false,
            }
        }

        fn nobody() -> Self {
            Self {
                admins: HashSet::new(),
                failing: false,
            }
        }

        fn down() -> Self {
            Self {
                admins: HashSet::new(),
                failing: true,
            }
        }
    }

    #[async_trait]
    impl AdminOracle for FakeAdmins {
        async fn is_admin_or_owner(&self, chat: ChatId, user: UserId) -> Result<bool, OracleError> {
            if self.failing {
                return Err(OracleError::Request("timeout".into()));
            }
            Ok(user == OWNER || self.admins.contains(&(chat, user)))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        configs: Mutex<HashMap<ChatId, GroupSubscriptionConfig>>,
        failing: bool,
    }

    impl MemoryStore {
        fn with(config: GroupSubscriptionConfig) -> Self {
            Self {
                configs: Mutex::new(HashMap::from([(config.chat_id, config)])),
                failing: false,
            }
        }

        fn down() -> Self {
            Self {
                configs: Mutex::default(),
                failing: true,
            }
        }

        fn stored(&self, chat_id: ChatId) -> Option<GroupSubscriptionConfig> {
            self.configs.lock().unwrap().get(&chat_id).cloned()
        }
    }

    #[async_trait]
    impl GroupConfigStore for MemoryStore {
        async fn get(
            &self,
            chat_id: ChatId,
        ) -> Result<Option<GroupSubscriptionConfig>, StoreError> {
            if self.failing {
                return Err(StoreError("store down".into()));
            }
            Ok(self.configs.lock().unwrap().get(&chat_id).cloned())
        }

        async fn upsert(&self, config: &GroupSubscriptionConfig) -> Result<(), StoreError> {
            if self.failing {
                return Err(StoreError("store down".into()));
            }
            self.configs
                .lock()
                .unwrap()
                .insert(config.chat_id, config.clone());
            Ok(())
        }

        async fn delete(&self, chat_id: ChatId) -> Result<(), StoreError> {
            if self.failing {
                return Err(StoreError("store down".into()));
            }
            self.configs.lock().unwrap().remove(&chat_id);
            Ok(())
        }
    }

    type TestGate = SubscriptionGate<Arc<FakeOracle>, Arc<FakeAdmins>, Arc<MemoryStore>>;

    fn gate(
        owner_channels: Vec<ChatId>,
        oracle: &Arc<FakeOracle>,
        admins: FakeAdmins,
        store: &Arc<MemoryStore>,
    ) -> TestGate {
        SubscriptionGate::new(
            OwnerChannels {
                owner: OWNER,
                channels: owner_channels,
            },
            BOT,
            oracle.clone(),
            Arc::new(admins),
            store.clone(),
        )
    }

    fn group_config(enabled: bool, channels: Vec<ChannelRef>) -> GroupSubscriptionConfig {
        GroupSubscriptionConfig {
            chat_id: GROUP,
            mode: SubscriptionMode::for_channel_count(channels.len()),
            channels,
            enabled,
            channel_id: None,
            channel_username: None,
        }
    }

    #[tokio::test]
    async fn group_without_config_is_allowed() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
        assert_eq!(oracle.lookups(), 0);
    }

    #[tokio::test]
    async fn disabled_config_is_allowed_without_lookups() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::with(group_config(
            false,
            vec![channel(CH_A, "A")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
        assert_eq!(oracle.lookups(), 0);
    }

    #[tokio::test]
    async fn enabled_config_without_channels_is_allowed() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::with(group_config(true, vec![])));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
    }

    #[tokio::test]
    async fn member_of_all_channels_passes() {
        let oracle = Arc::new(
            FakeOracle::default()
                .member(CH_A, USER)
                .member(CH_B, USER),
        );
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A"), channel(CH_B, "B")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
    }

    #[tokio::test]
    async fn missing_channels_keep_configured_order() {
        let oracle = Arc::new(FakeOracle::default().member(CH_B, USER));
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A"), channel(CH_B, "B"), channel(CH_C, "C")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(
            result,
            GateResult::Blocked(vec![channel(CH_A, "A"), channel(CH_C, "C")])
        );
    }

    #[tokio::test]
    async fn member_of_subset_is_blocked_on_the_complement() {
        let oracle = Arc::new(FakeOracle::default().member(CH_A, USER));
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A"), channel(CH_B, "B")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Blocked(vec![channel(CH_B, "B")]));
    }

    #[tokio::test]
    async fn membership_lookup_error_fails_open() {
        let oracle = Arc::new(FakeOracle::default().member(CH_B, USER).failing(CH_A));
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A"), channel(CH_B, "B")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
    }

    #[tokio::test]
    async fn store_failure_fails_open() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::down());
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
    }

    #[tokio::test]
    async fn legacy_single_channel_record_still_blocks() {
        let oracle = Arc::new(FakeOracle::default());
        let mut config = group_config(true, vec![]);
        config.channel_id = Some(CH_A);
        config.channel_username = Some("@legacy_chan".into());
        let store = Arc::new(MemoryStore::with(config));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(
            result,
            GateResult::Blocked(vec![ChannelRef {
                id: CH_A,
                title: "legacy_chan".into(),
                username: Some("legacy_chan".into()),
            }])
        );
    }

    #[tokio::test]
    async fn multi_channel_list_wins_over_legacy_fields() {
        let oracle = Arc::new(FakeOracle::default().member(CH_B, USER));
        let mut config = group_config(true, vec![channel(CH_B, "B")]);
        config.channel_id = Some(CH_A);
        config.channel_username = Some("@legacy_chan".into());
        let store = Arc::new(MemoryStore::with(config));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        // Member of the multi-channel list; the legacy channel is ignored.
        let result = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(result, GateResult::Allowed);
    }

    #[tokio::test]
    async fn owner_bypasses_private_gate_without_lookups() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![CH_A, CH_B], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(OWNER, ChatContext::Private).await;
        assert_eq!(result, GateResult::Allowed);
        assert_eq!(oracle.lookups(), 0);
    }

    #[tokio::test]
    async fn empty_owner_list_allows_anyone() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Private).await;
        assert_eq!(result, GateResult::Allowed);
        assert_eq!(oracle.lookups(), 0);
    }

    #[tokio::test]
    async fn private_blocked_lists_every_unjoined_channel_in_order() {
        let refs = [channel(CH_A, "A"), channel(CH_B, "B"), channel(CH_C, "C")];
        let oracle = Arc::new(FakeOracle::with_channels(&refs));
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![CH_A, CH_B, CH_C], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Private).await;
        assert_eq!(result, GateResult::Blocked(refs.to_vec()));
    }

    #[tokio::test]
    async fn unresolvable_owner_channel_is_skipped() {
        let refs = [channel(CH_A, "A"), channel(CH_B, "B")];
        let oracle = Arc::new(FakeOracle::with_channels(&refs).unresolvable(CH_A));
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![CH_A, CH_B], &oracle, FakeAdmins::nobody(), &store);

        let result = gate.evaluate(USER, ChatContext::Private).await;
        assert_eq!(result, GateResult::Blocked(vec![channel(CH_B, "B")]));
    }

    #[tokio::test]
    async fn evaluate_is_idempotent() {
        let oracle = Arc::new(FakeOracle::default().member(CH_A, USER));
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A"), channel(CH_B, "B")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let first = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        let second = gate.evaluate(USER, ChatContext::Group(GROUP)).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn set_channels_rejects_five_before_any_lookup() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        let idents: Vec<_> = [CH_A, CH_B, CH_C, CH_D, CH_E]
            .into_iter()
            .map(ChannelIdent::Id)
            .collect();
        let result = gate.set_channels(GROUP, USER, &idents).await;
        assert!(matches!(result, Err(GateError::TooManyChannels(5))));
        assert_eq!(oracle.lookups(), 0);
    }

    #[tokio::test]
    async fn set_channels_aborts_atomically_when_bot_lacks_rights() {
        let refs = [
            channel(CH_A, "A"),
            channel(CH_B, "B"),
            channel(CH_C, "C"),
            channel(CH_D, "D"),
        ];
        let oracle = Arc::new(
            FakeOracle::with_channels(&refs)
                .bot_admin_in(CH_A)
                .bot_admin_in(CH_B)
                .bot_admin_in(CH_D),
        );
        let before = group_config(true, vec![channel(CH_E, "E")]);
        let store = Arc::new(MemoryStore::with(before.clone()));
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        let idents: Vec<_> = [CH_A, CH_B, CH_C, CH_D]
            .into_iter()
            .map(ChannelIdent::Id)
            .collect();
        let result = gate.set_channels(GROUP, USER, &idents).await;
        assert!(
            matches!(result, Err(GateError::BotNotAdmin(ref c)) if c.id == CH_C),
            "unexpected result: {result:?}"
        );
        assert_eq!(store.stored(GROUP), Some(before));
    }

    #[tokio::test]
    async fn set_channels_stores_resolved_list_and_enables() {
        let refs = [channel(CH_A, "A"), channel(CH_B, "B")];
        let oracle = Arc::new(
            FakeOracle::with_channels(&refs)
                .bot_admin_in(CH_A)
                .bot_admin_in(CH_B),
        );
        let mut old = group_config(true, vec![]);
        old.channel_id = Some(CH_E);
        old.channel_username = Some("@old_chan".into());
        let store = Arc::new(MemoryStore::with(old));
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        let idents = [ChannelIdent::Id(CH_A), ChannelIdent::Id(CH_B)];
        let config = gate.set_channels(GROUP, USER, &idents).await.unwrap();
        assert_eq!(config.channels, refs.to_vec());
        assert_eq!(config.mode, SubscriptionMode::Multiple);
        assert!(config.enabled);

        let stored = store.stored(GROUP).unwrap();
        assert_eq!(stored, config);
        // Reconfiguration migrates away from the legacy columns.
        assert_eq!(stored.channel_id, None);
        assert_eq!(stored.channel_username, None);
    }

    #[tokio::test]
    async fn unresolvable_channel_fails_the_mutation() {
        let refs = [channel(CH_A, "A")];
        let oracle = Arc::new(FakeOracle::with_channels(&refs).bot_admin_in(CH_A));
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        let idents = [ChannelIdent::Id(CH_A), ChannelIdent::Id(CH_B)];
        let result = gate.set_channels(GROUP, USER, &idents).await;
        assert!(matches!(
            result,
            Err(GateError::ChannelResolutionFailed(ChannelIdent::Id(CH_B)))
        ));
        assert_eq!(store.stored(GROUP), None);
    }

    #[tokio::test]
    async fn non_admin_cannot_reconfigure() {
        let refs = [channel(CH_A, "A")];
        let oracle = Arc::new(FakeOracle::with_channels(&refs).bot_admin_in(CH_A));
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate
            .set_channels(GROUP, USER, &[ChannelIdent::Id(CH_A)])
            .await;
        assert!(matches!(result, Err(GateError::PermissionDenied)));
        assert_eq!(store.stored(GROUP), None);

        let result = gate.set_enabled(GROUP, USER, false).await;
        assert!(matches!(result, Err(GateError::PermissionDenied)));
    }

    #[tokio::test]
    async fn owner_may_always_reconfigure() {
        let refs = [channel(CH_A, "A")];
        let oracle = Arc::new(FakeOracle::with_channels(&refs).bot_admin_in(CH_A));
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::nobody(), &store);

        let result = gate
            .set_channels(GROUP, OWNER, &[ChannelIdent::Id(CH_A)])
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn set_enabled_flips_the_flag_in_place() {
        let oracle = Arc::new(FakeOracle::default());
        let channels = vec![channel(CH_A, "A"), channel(CH_B, "B")];
        let store = Arc::new(MemoryStore::with(group_config(true, channels.clone())));
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        gate.set_enabled(GROUP, USER, false).await.unwrap();
        let stored = store.stored(GROUP).unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.channels, channels);

        gate.set_enabled(GROUP, USER, true).await.unwrap();
        assert!(store.stored(GROUP).unwrap().enabled);
    }

    #[tokio::test]
    async fn enabling_without_channels_is_rejected() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        let result = gate.set_enabled(GROUP, USER, true).await;
        assert!(matches!(result, Err(GateError::ConfigNotFound)));

        // Disabling an unconfigured chat is a no-op, not an error.
        assert!(gate.set_enabled(GROUP, USER, false).await.is_ok());
    }

    #[tokio::test]
    async fn clear_removes_the_config() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::with(group_config(
            true,
            vec![channel(CH_A, "A")],
        )));
        let gate = gate(vec![], &oracle, FakeAdmins::with(GROUP, USER), &store);

        gate.clear(GROUP, USER).await.unwrap();
        assert_eq!(store.stored(GROUP), None);
        assert_eq!(
            gate.evaluate(USER, ChatContext::Group(GROUP)).await,
            GateResult::Allowed
        );
    }

    #[tokio::test]
    async fn admin_lookup_failure_is_a_hard_error_for_mutations() {
        let oracle = Arc::new(FakeOracle::default());
        let store = Arc::new(MemoryStore::default());
        let gate = gate(vec![], &oracle, FakeAdmins::down(), &store);

        let result = gate.set_enabled(GROUP, USER, false).await;
        assert!(matches!(result, Err(GateError::OracleUnavailable)));
    }
}
