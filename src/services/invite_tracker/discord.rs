use super::platform::{LiveInvite, Platform, UserProfile};
use crate::Error;
use ::serenity::http::{LightMethod, Request, Route};
use ::serenity::model::guild::audit_log::{Action, MemberAction};
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use serde::Deserialize;
use std::sync::Arc;

const MEMBER_PAGE_SIZE: u64 = 1000;
const AUDIT_LOG_PAGE_SIZE: u8 = 50;

/// [`Platform`] backed by the Discord REST API.
pub struct SerenityPlatform {
    http: Arc<serenity::Http>,
}

impl SerenityPlatform {
    pub fn new(http: Arc<serenity::Http>) -> Self {
        Self { http }
    }
}

#[derive(Deserialize)]
struct VanityUrl {
    code: Option<String>,
    #[serde(default)]
    uses: u64,
}

fn to_utc(timestamp: serenity::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp.unix_timestamp(), 0)
}

#[async_trait::async_trait]
impl Platform for SerenityPlatform {
    async fn invites(&self, guild_id: serenity::GuildId) -> Result<Vec<LiveInvite>, Error> {
        let invites = guild_id.invites(&self.http).await?;

        Ok(invites
            .into_iter()
            .map(|invite| {
                let created_at = to_utc(invite.created_at);
                let expires_at = if invite.max_age > 0 {
                    created_at.map(|c| c + chrono::Duration::seconds(invite.max_age as i64))
                } else {
                    None
                };

                LiveInvite {
                    code: invite.code,
                    uses: invite.uses,
                    inviter_id: invite.inviter.as_ref().map(|u| u.id),
                    inviter_name: invite.inviter.as_ref().map(|u| u.name.clone()),
                    max_uses: (invite.max_uses > 0).then_some(invite.max_uses as u64),
                    expires_at,
                }
            })
            .collect())
    }

    async fn vanity_uses(&self, guild_id: serenity::GuildId) -> Result<Option<u64>, Error> {
        // The typed vanity endpoint drops the use count, so read it raw.
        let request = Request::new(Route::GuildVanityUrl { guild_id }, LightMethod::Get);

        match self.http.fire::<VanityUrl>(request).await {
            Ok(vanity) => Ok(vanity.code.map(|_| vanity.uses)),
            Err(::serenity::Error::Http(e)) if e.status_code().map(|s| s.as_u16()) == Some(404) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn audit_inviter(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        since: DateTime<Utc>,
    ) -> Result<Option<serenity::UserId>, Error> {
        // Bot additions are the only joins the audit log attributes to an executor.
        let logs = guild_id
            .audit_logs(
                &self.http,
                Some(Action::Member(MemberAction::BotAdd)),
                None,
                None,
                Some(AUDIT_LOG_PAGE_SIZE),
            )
            .await?;

        let executor = logs
            .entries
            .iter()
            .filter(|entry| entry.target_id.map(|t| t.get()) == Some(user_id.get()))
            .filter(|entry| to_utc(entry.id.created_at()).is_some_and(|at| at >= since))
            .map(|entry| entry.user_id)
            .next();

        Ok(executor)
    }

    async fn member_roles(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<Vec<serenity::RoleId>>, Error> {
        match guild_id.member(&self.http, user_id).await {
            Ok(member) => Ok(Some(member.roles)),
            Err(::serenity::Error::Http(e)) if e.status_code().map(|s| s.as_u16()) == Some(404) => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn grant_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error> {
        self.http
            .add_member_role(guild_id, user_id, role_id, Some("Invite reward reached"))
            .await?;
        Ok(())
    }

    async fn revoke_role(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error> {
        self.http
            .remove_member_role(guild_id, user_id, role_id, Some("Invite reward no longer met"))
            .await?;
        Ok(())
    }

    async fn members(&self, guild_id: serenity::GuildId) -> Result<Vec<UserProfile>, Error> {
        let mut profiles = Vec::new();
        let mut after = None;

        loop {
            let page = guild_id
                .members(&self.http, Some(MEMBER_PAGE_SIZE), after)
                .await?;
            let page_len = page.len() as u64;
            after = page.last().map(|m| m.user.id);

            profiles.extend(page.iter().map(UserProfile::from_member));

            if page_len < MEMBER_PAGE_SIZE {
                break;
            }
        }

        Ok(profiles)
    }

    async fn send_message(&self, channel_id: serenity::ChannelId, content: String) -> Result<(), Error> {
        channel_id.say(&self.http, content).await?;
        Ok(())
    }
}
