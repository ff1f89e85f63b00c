//! Scripted [`Platform`] used by the invite tracker tests.

use super::platform::{LiveInvite, Platform, UserProfile};
use crate::Error;
use chrono::{DateTime, Utc};
use poise::serenity_prelude as serenity;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

pub fn invite(code: &str, uses: u64, inviter: u64) -> LiveInvite {
    LiveInvite {
        code: code.to_string(),
        uses,
        inviter_id: Some(serenity::UserId::new(inviter)),
        inviter_name: Some(format!("inviter{inviter}")),
        max_uses: None,
        expires_at: None,
    }
}

pub fn member(id: u64, bot: bool) -> UserProfile {
    UserProfile {
        user_id: serenity::UserId::new(id),
        username: format!("member{id}"),
        display_name: None,
        account_created_at: Some(Utc::now() - chrono::Duration::days(365)),
        bot,
    }
}

#[derive(Default)]
struct State {
    invites: Vec<LiveInvite>,
    vanity: Option<u64>,
    fail_vanity: bool,
    fail_invites: bool,
    audit: HashMap<serenity::UserId, serenity::UserId>,
    audit_delay: Option<Duration>,
    roles: HashMap<serenity::UserId, Vec<serenity::RoleId>>,
    failing_roles: HashSet<serenity::RoleId>,
    members: Vec<UserProfile>,
    fail_members: bool,
    sent: Vec<(serenity::ChannelId, String)>,
}

#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().expect("fake platform state"))
    }

    pub fn set_invites(&self, invites: Vec<LiveInvite>) {
        self.with(|s| s.invites = invites);
    }

    pub fn set_vanity(&self, uses: Option<u64>) {
        self.with(|s| s.vanity = uses);
    }

    pub fn fail_vanity(&self, fail: bool) {
        self.with(|s| s.fail_vanity = fail);
    }

    pub fn fail_invites(&self, fail: bool) {
        self.with(|s| s.fail_invites = fail);
    }

    pub fn set_audit_inviter(&self, target: serenity::UserId, executor: serenity::UserId) {
        self.with(|s| {
            s.audit.insert(target, executor);
        });
    }

    pub fn set_audit_delay(&self, delay: Duration) {
        self.with(|s| s.audit_delay = Some(delay));
    }

    pub fn set_member_roles(&self, user_id: serenity::UserId, roles: Vec<serenity::RoleId>) {
        self.with(|s| {
            s.roles.insert(user_id, roles);
        });
    }

    pub fn member_roles_of(&self, user_id: serenity::UserId) -> Vec<serenity::RoleId> {
        self.with(|s| s.roles.get(&user_id).cloned().unwrap_or_default())
    }

    pub fn fail_role(&self, role_id: serenity::RoleId) {
        self.with(|s| {
            s.failing_roles.insert(role_id);
        });
    }

    pub fn set_members(&self, members: Vec<UserProfile>) {
        self.with(|s| s.members = members);
    }

    pub fn fail_members(&self, fail: bool) {
        self.with(|s| s.fail_members = fail);
    }

    pub fn sent_messages(&self) -> Vec<(serenity::ChannelId, String)> {
        self.with(|s| s.sent.clone())
    }
}

#[async_trait::async_trait]
impl Platform for FakePlatform {
    async fn invites(&self, _guild_id: serenity::GuildId) -> Result<Vec<LiveInvite>, Error> {
        self.with(|s| {
            if s.fail_invites {
                anyhow::bail!("Missing Permissions");
            }
            Ok(s.invites.clone())
        })
    }

    async fn vanity_uses(&self, _guild_id: serenity::GuildId) -> Result<Option<u64>, Error> {
        self.with(|s| {
            if s.fail_vanity {
                anyhow::bail!("Missing Access");
            }
            Ok(s.vanity)
        })
    }

    async fn audit_inviter(
        &self,
        _guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        _since: DateTime<Utc>,
    ) -> Result<Option<serenity::UserId>, Error> {
        let (delay, executor) = self.with(|s| (s.audit_delay, s.audit.get(&user_id).copied()));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(executor)
    }

    async fn member_roles(
        &self,
        _guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<Vec<serenity::RoleId>>, Error> {
        Ok(self.with(|s| s.roles.get(&user_id).cloned()))
    }

    async fn grant_role(
        &self,
        _guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error> {
        self.with(|s| {
            if s.failing_roles.contains(&role_id) {
                anyhow::bail!("Unknown Role");
            }
            let roles = s.roles.entry(user_id).or_default();
            if !roles.contains(&role_id) {
                roles.push(role_id);
            }
            Ok(())
        })
    }

    async fn revoke_role(
        &self,
        _guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        role_id: serenity::RoleId,
    ) -> Result<(), Error> {
        self.with(|s| {
            if s.failing_roles.contains(&role_id) {
                anyhow::bail!("Unknown Role");
            }
            if let Some(roles) = s.roles.get_mut(&user_id) {
                roles.retain(|r| *r != role_id);
            }
            Ok(())
        })
    }

    async fn members(&self, _guild_id: serenity::GuildId) -> Result<Vec<UserProfile>, Error> {
        self.with(|s| {
            if s.fail_members {
                anyhow::bail!("Missing Access");
            }
            Ok(s.members.clone())
        })
    }

    async fn send_message(&self, channel_id: serenity::ChannelId, content: String) -> Result<(), Error> {
        self.with(|s| s.sent.push((channel_id, content)));
        Ok(())
    }
}
