pub mod attribution;
pub mod backfill;
pub mod discord;
pub mod guard;
pub mod ledger;
pub mod platform;
pub mod rewards;
pub mod snapshot;
pub mod worker;

#[cfg(test)]
pub mod testing;

use crate::db::entities::invite_joins;
use crate::db::entities::{invite_rewards, invite_users};
use crate::Error;
use attribution::{Attribution, AttributionResolver};
use backfill::BackfillReport;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use guard::JoinGuard;
use ledger::{CounterDelta, GuildSettings, LedgerError, LedgerService, NewJoin};
pub use ledger::CreditOutcome;
use platform::{LiveInvite, Platform, UserProfile};
use poise::serenity_prelude as serenity;
use rewards::RewardSyncReport;
use sea_orm::DatabaseConnection;
use snapshot::InviteSnapshotCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Timing knobs of the invite tracker.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// How often every known guild's invite snapshot is refreshed.
    pub refresh_interval: Duration,
    /// How long a processed join stays guarded against re-delivery.
    pub join_guard_release: Duration,
    /// How far back an audit-log entry may be to count for a join.
    pub audit_window: Duration,
    pub audit_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            join_guard_release: Duration::from_secs(5),
            audit_window: Duration::from_secs(10),
            audit_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JoinOutcome {
    /// Same join is already being processed or was just processed.
    Duplicate,
    Recorded {
        attribution: Attribution,
        record: invite_joins::Model,
        /// Inviter's ledger row after being credited.
        inviter: Option<invite_users::Model>,
        account_valid: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct LeaveOutcome {
    pub record: Option<invite_joins::Model>,
    pub inviter: Option<invite_users::Model>,
}

pub fn account_old_enough(profile: &UserProfile, minimum_days: i32) -> bool {
    match profile.account_created_at {
        Some(created) => (Utc::now() - created).num_days() >= minimum_days as i64,
        None => true,
    }
}

fn welcome_message(
    member_id: serenity::UserId,
    attribution: &Attribution,
    inviter: Option<&invite_users::Model>,
    account_valid: bool,
) -> String {
    let mut message = match (attribution, inviter) {
        (Attribution::Vanity, _) => format!("Welcome <@{}>! You joined through the vanity URL.", member_id),
        (_, Some(inviter)) => format!(
            "Welcome <@{}>! You were invited by <@{}>, who now has {} invites.",
            member_id, inviter.user_id, inviter.total
        ),
        _ => format!("Welcome <@{}>!", member_id),
    };
    if !account_valid {
        message.push_str("\n⚠️ This account is newer than the server's minimum account age.");
    }
    message
}

/// Invite attribution and reward bookkeeping for every guild the bot is in.
pub struct InviteTrackerService {
    platform: Arc<dyn Platform>,
    ledger: LedgerService,
    cache: InviteSnapshotCache,
    guard: JoinGuard,
    settings: TrackerSettings,
    primed: DashSet<serenity::GuildId>,
    workers: DashMap<serenity::GuildId, mpsc::UnboundedSender<worker::GuildEvent>>,
}

impl InviteTrackerService {
    pub fn new(db: DatabaseConnection, platform: Arc<dyn Platform>, settings: TrackerSettings) -> Self {
        Self {
            platform,
            ledger: LedgerService::new(db),
            cache: InviteSnapshotCache::new(),
            guard: JoinGuard::new(settings.join_guard_release),
            settings,
            primed: DashSet::new(),
            workers: DashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// Invites a member created, from the cached snapshot, most used first.
    pub fn invites_of(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Option<(Vec<LiveInvite>, Option<DateTime<Utc>>)> {
        let snapshot = self.cache.get(guild_id)?;
        let mut invites: Vec<LiveInvite> = snapshot
            .invites
            .values()
            .filter(|invite| invite.inviter_id == Some(user_id))
            .cloned()
            .collect();
        invites.sort_by(|a, b| b.uses.cmp(&a.uses).then_with(|| a.code.cmp(&b.code)));
        Some((invites, snapshot.taken_at))
    }

    fn resolver(&self) -> AttributionResolver<'_> {
        AttributionResolver {
            platform: self.platform.as_ref(),
            cache: &self.cache,
            audit_window: self.settings.audit_window,
            audit_timeout: self.settings.audit_timeout,
        }
    }

    /// Attributes and records a member join, then credits the inviter.
    pub async fn on_member_join(
        &self,
        guild_id: serenity::GuildId,
        member: &UserProfile,
    ) -> Result<JoinOutcome, Error> {
        let Some(_ticket) = self.guard.try_acquire(guild_id, member.user_id) else {
            debug!("Ignoring duplicate join of {} in guild {}", member.user_id, guild_id);
            return Ok(JoinOutcome::Duplicate);
        };

        let settings = self.ledger.guild_settings(guild_id).await?;
        let account_valid = account_old_enough(member, settings.minimum_account_age_days);

        let attribution = self.resolver().resolve(guild_id, member.user_id).await;

        // Rejoining through one's own invite credits nobody.
        let inviter = match attribution.inviter_id() {
            Some(inviter_id) if inviter_id == member.user_id => {
                debug!("Member {} joined guild {} through their own invite", member.user_id, guild_id);
                None
            }
            Some(inviter_id) => Some(match &attribution {
                Attribution::Invite {
                    inviter_name: Some(name),
                    ..
                } => UserProfile {
                    username: name.clone(),
                    ..UserProfile::from_id(inviter_id)
                },
                _ => UserProfile::from_id(inviter_id),
            }),
            None => None,
        };

        let recorded = self
            .ledger
            .record_join(NewJoin {
                guild_id,
                inviter,
                invited: member.clone(),
                source: attribution.source(),
                invite_code: attribution.invite_code().map(str::to_string),
                is_valid: account_valid,
            })
            .await?;

        if let Some(stale) = &recorded.superseded {
            debug!("Closed stale join record {} of {}", stale.id, member.user_id);
        }
        for credited in [&recorded.superseded_inviter, &recorded.inviter].into_iter().flatten() {
            self.sync_rewards(guild_id, serenity::UserId::new(credited.user_id as u64))
                .await?;
        }
        let inviter = recorded.inviter;

        match &attribution {
            Attribution::Unknown => warn!(
                "Could not attribute join of {} in guild {}",
                member.user_id, guild_id
            ),
            _ => info!(
                "Member {} joined guild {} via {} (inviter: {:?}, valid account: {})",
                member.user_id,
                guild_id,
                attribution.source(),
                recorded.record.inviter_id,
                account_valid
            ),
        }

        if let Some(channel_id) = settings.welcome_channel_id {
            let content = welcome_message(member.user_id, &attribution, inviter.as_ref(), account_valid);
            if let Err(e) = self.platform.send_message(channel_id, content).await {
                warn!("Failed to send welcome message in guild {}: {:?}", guild_id, e);
            }
        }

        Ok(JoinOutcome::Recorded {
            attribution,
            record: recorded.record,
            inviter,
            account_valid,
        })
    }

    /// Closes the member's active join and charges the leave to its inviter.
    pub async fn on_member_leave(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<LeaveOutcome, Error> {
        let Some(leave) = self.ledger.record_leave(guild_id, user_id).await? else {
            debug!("Member {} left guild {} without a tracked join", user_id, guild_id);
            return Ok(LeaveOutcome::default());
        };

        let ledger::RecordedLeave { record, inviter } = leave;
        if let Some(inviter) = &inviter {
            self.sync_rewards(guild_id, serenity::UserId::new(inviter.user_id as u64))
                .await?;
        }
        info!(
            "Member {} left guild {} (inviter: {:?})",
            user_id, guild_id, record.inviter_id
        );

        Ok(LeaveOutcome {
            record: Some(record),
            inviter,
        })
    }

    /// Credits `inviter` with bringing in `invited`, bypassing attribution.
    pub async fn credit_manual_invite(
        &self,
        guild_id: serenity::GuildId,
        inviter: &UserProfile,
        invited: &UserProfile,
    ) -> Result<CreditOutcome, Error> {
        if inviter.user_id == invited.user_id {
            anyhow::bail!("A member cannot be credited with inviting themselves");
        }

        let outcome = self.ledger.credit_invite(guild_id, inviter, invited).await?;
        if outcome == CreditOutcome::AlreadyCredited {
            return Ok(outcome);
        }

        if let CreditOutcome::Reassigned {
            previous_inviter: Some(previous),
        } = outcome
        {
            self.sync_rewards(guild_id, previous).await?;
        }
        self.sync_rewards(guild_id, inviter.user_id).await?;

        info!(
            "Manually credited {} with inviting {} in guild {} ({:?})",
            inviter.user_id, invited.user_id, guild_id, outcome
        );

        Ok(outcome)
    }

    pub async fn add_bonus_invites(
        &self,
        guild_id: serenity::GuildId,
        user: &UserProfile,
        amount: u32,
    ) -> Result<invite_users::Model, Error> {
        let amount = i32::try_from(amount)?;
        self.ledger.get_or_create_user(guild_id, user).await?;
        let updated = self
            .ledger
            .adjust_counters(guild_id, user.user_id, CounterDelta::bonus(amount))
            .await?;
        self.sync_rewards(guild_id, user.user_id).await?;

        info!("Added {} bonus invites to {} in guild {}", amount, user.user_id, guild_id);
        Ok(updated)
    }

    /// Takes invites away, bonus first. The user must already be in the ledger.
    pub async fn remove_invites(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        amount: u32,
    ) -> Result<invite_users::Model, Error> {
        let updated = self.ledger.remove_invites(guild_id, user_id, amount).await?;
        self.sync_rewards(guild_id, user_id).await?;

        info!("Removed up to {} invites from {} in guild {}", amount, user_id, guild_id);
        Ok(updated)
    }

    /// Adjusts the fake counter; a negative amount clears earlier marks.
    pub async fn mark_fake(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        amount: i32,
    ) -> Result<invite_users::Model, Error> {
        let updated = self
            .ledger
            .adjust_counters(guild_id, user_id, CounterDelta::fake(amount))
            .await?;
        self.sync_rewards(guild_id, user_id).await?;
        Ok(updated)
    }

    pub async fn get_user(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<invite_users::Model>, LedgerError> {
        self.ledger.get_user(guild_id, user_id).await
    }

    pub async fn get_leaderboard(
        &self,
        guild_id: serenity::GuildId,
        limit: u64,
    ) -> Result<Vec<invite_users::Model>, LedgerError> {
        self.ledger.leaderboard(guild_id, limit).await
    }

    /// Most recent join record of a member.
    pub async fn join_info(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<invite_joins::Model>, LedgerError> {
        self.ledger.latest_join(guild_id, user_id).await
    }

    pub async fn sync_rewards(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<RewardSyncReport, LedgerError> {
        rewards::sync_rewards(self.platform.as_ref(), &self.ledger, guild_id, user_id).await
    }

    /// Re-syncs every ledger user of the guild, after the tiers changed.
    pub async fn sync_guild_rewards(&self, guild_id: serenity::GuildId) -> Result<usize, LedgerError> {
        let users = self.ledger.users_for_guild(guild_id).await?;
        let mut changed = 0;

        for user in users {
            let report = self
                .sync_rewards(guild_id, serenity::UserId::new(user.user_id as u64))
                .await?;
            if !report.granted.is_empty() || !report.revoked.is_empty() {
                changed += 1;
            }
        }

        Ok(changed)
    }

    pub async fn guild_settings(&self, guild_id: serenity::GuildId) -> Result<GuildSettings, LedgerError> {
        self.ledger.guild_settings(guild_id).await
    }

    pub async fn set_guild_settings(
        &self,
        guild_id: serenity::GuildId,
        settings: &GuildSettings,
    ) -> Result<(), LedgerError> {
        self.ledger.set_guild_settings(guild_id, settings).await
    }

    pub async fn reward_tiers(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Vec<invite_rewards::Model>, LedgerError> {
        self.ledger.reward_tiers(guild_id).await
    }

    pub async fn add_reward_tier(
        &self,
        guild_id: serenity::GuildId,
        required_invites: i32,
        role_id: serenity::RoleId,
        role_name: &str,
    ) -> Result<usize, LedgerError> {
        self.ledger
            .upsert_reward_tier(guild_id, required_invites, role_id, role_name)
            .await?;
        self.sync_guild_rewards(guild_id).await
    }

    pub async fn remove_reward_tier(
        &self,
        guild_id: serenity::GuildId,
        role_id: serenity::RoleId,
    ) -> Result<bool, LedgerError> {
        self.ledger.remove_reward_tier(guild_id, role_id).await
    }

    /// Loads the guild's invites and backfills members that joined while the
    /// bot was away. Only the first call per guild does any work.
    pub async fn prime_guild(&self, guild_id: serenity::GuildId) -> Result<Option<BackfillReport>, Error> {
        if !self.primed.insert(guild_id) {
            return Ok(None);
        }

        if let Err(e) = self.cache.refresh(self.platform.as_ref(), guild_id).await {
            warn!("Failed to load invites for guild {}: {:?}", guild_id, e);
        }

        match backfill::backfill_guild(self.platform.as_ref(), &self.ledger, guild_id).await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                // Allow a later GuildCreate to try again.
                self.primed.remove(&guild_id);
                Err(e)
            }
        }
    }

    pub async fn refresh_invites(&self, guild_id: serenity::GuildId) {
        if let Err(e) = self.cache.refresh(self.platform.as_ref(), guild_id).await {
            error!("Failed to refresh invites for guild {}: {:?}", guild_id, e);
        }
    }

    pub fn on_invite_deleted(&self, guild_id: serenity::GuildId, code: &str) {
        self.cache.remove_code(guild_id, code);
    }

    pub fn on_guild_removed(&self, guild_id: serenity::GuildId) {
        self.cache.forget(guild_id);
        self.guard.release_guild(guild_id);
        self.primed.remove(&guild_id);
        self.workers.remove(&guild_id);
    }

    /// Periodically queues a snapshot refresh on every cached guild's worker,
    /// behind any joins already waiting there.
    pub fn start_refresh_runner(self: &Arc<Self>) {
        let service = Arc::downgrade(self);
        let interval = self.settings.refresh_interval;

        tokio::spawn(async move {
            info!("Invite snapshot refresh runner started.");
            loop {
                tokio::time::sleep(interval).await;
                let Some(service) = service.upgrade() else {
                    break;
                };

                for guild_id in service.cache.guilds() {
                    service.enqueue(guild_id, worker::GuildEvent::RefreshInvites);
                }
            }
        });
    }
}
