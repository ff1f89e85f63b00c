use crate::Error;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;

/// A live invite link as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveInvite {
    pub code: String,
    pub uses: u64,
    pub inviter_id: Option<serenity::UserId>,
    pub inviter_name: Option<String>,
    pub max_uses: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The parts of a platform user the ledger keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: serenity::UserId,
    pub username: String,
    pub display_name: Option<String>,
    pub account_created_at: Option<DateTime<Utc>>,
    pub bot: bool,
}

impl UserProfile {
    /// Profile for a user known only by id (audit-log executors, for instance).
    pub fn from_id(user_id: serenity::UserId) -> Self {
        Self {
            user_id,
            username: user_id.get().to_string(),
            display_name: None,
            account_created_at: None,
            bot: false,
        }
    }

    pub fn from_user(user: &serenity::User) -> Self {
        Self {
            user_id: user.id,
            username: user.name.clone(),
            display_name: user.global_name.clone(),
            account_created_at: DateTime::from_timestamp(user.created_at().unix_timestamp(), 0),
            bot: user.bot,
        }
    }

    pub fn from_member(member: &serenity::Member) -> Self {
        let mut profile = Self::from_user(&member.user);
        profile.display_name = Some(member.display_name().to_string());
        profile
    }
}

/// Chat-platform capabilities the invite tracker depends on.
///
/// Every call is I/O bound and may fail transiently (rate limits, missing
/// permissions); callers decide whether a failure degrades or propagates.
#[async_trait::async_trait]
pub trait Platform: Send + Sync {
    /// Active invite links of a guild with their use counts.
    async fn invites(&self, guild_id: serenity::GuildId) -> Result<Vec<LiveInvite>, Error>;

    /// Use count of the guild's vanity link, `None` when the guild has none.
    async fn vanity_uses(&self, guild_id: serenity::GuildId) -> Result<Option<u64>, Error>;

    /// Executor of an audit-log entry that brought `user_id` into the guild
    /// at or after `since`.
    async fn audit_inviter(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<serenity::UserId>, Error>;

    /// Current roles of a member, `None` when the user is not in the guild.
    async fn member_roles(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<Vec<serenity::RoleId>>, Error>;

    async fn grant_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error>;

    async fn revoke_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error>;

    /// Full member list of a guild.
    async fn members(&self, guild_id: serenity::GuildId) -> Result<Vec<UserProfile>, Error>;

    async fn send_message(&self, channel_id: serenity::ChannelId, content: String) -> Result<(), Error>;
}
