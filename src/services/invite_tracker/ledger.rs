use super::platform::UserProfile;
use crate::db::entities::guild_configs::{self, DEFAULT_MINIMUM_ACCOUNT_AGE_DAYS};
use crate::db::entities::invite_joins::{self, JoinSource};
use crate::db::entities::{invite_rewards, invite_users};
use chrono::Utc;
use poise::serenity_prelude as serenity;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The user row must be created with `get_or_create_user` first.
    #[error("user {user_id} has no invite ledger entry in guild {guild_id}")]
    UserNotFound {
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    },
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Signed changes applied to the four invite counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub joins: i32,
    pub bonus: i32,
    pub leaves: i32,
    pub fake: i32,
}

impl CounterDelta {
    pub fn joins(n: i32) -> Self {
        Self { joins: n, ..Default::default() }
    }

    pub fn bonus(n: i32) -> Self {
        Self { bonus: n, ..Default::default() }
    }

    pub fn leaves(n: i32) -> Self {
        Self { leaves: n, ..Default::default() }
    }

    pub fn fake(n: i32) -> Self {
        Self { fake: n, ..Default::default() }
    }
}

/// Counter state of a user. `total` is derived, never stored on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub joins: i32,
    pub bonus: i32,
    pub leaves: i32,
    pub fake: i32,
}

impl Counters {
    pub fn of(user: &invite_users::Model) -> Self {
        Self {
            joins: user.joins,
            bonus: user.bonus,
            leaves: user.leaves,
            fake: user.fake,
        }
    }

    pub fn total(&self) -> i32 {
        self.joins
            .saturating_add(self.bonus)
            .saturating_sub(self.leaves)
            .saturating_sub(self.fake)
    }

    /// Adds `delta`, saturating at `i32::MAX` and clamping every counter at zero.
    pub fn apply(self, delta: CounterDelta) -> Self {
        Self {
            joins: self.joins.saturating_add(delta.joins).max(0),
            bonus: self.bonus.saturating_add(delta.bonus).max(0),
            leaves: self.leaves.saturating_add(delta.leaves).max(0),
            fake: self.fake.saturating_add(delta.fake).max(0),
        }
    }

    /// Removes up to `amount` invites, bonus first and then joins.
    ///
    /// The amount is capped at the current positive total so a removal can
    /// never push `total` below zero.
    pub fn remove(self, amount: u32) -> Self {
        let amount = (amount.min(i32::MAX as u32) as i32).min(self.total().max(0));
        let from_bonus = amount.min(self.bonus);
        let from_joins = (amount - from_bonus).min(self.joins);

        Self {
            joins: self.joins - from_joins,
            bonus: self.bonus - from_bonus,
            ..self
        }
    }
}

/// A join to be written to the ledger.
#[derive(Debug, Clone)]
pub struct NewJoin {
    pub guild_id: serenity::GuildId,
    /// Credited with one join in the same transaction as the record.
    pub inviter: Option<UserProfile>,
    pub invited: UserProfile,
    pub source: JoinSource,
    pub invite_code: Option<String>,
    pub is_valid: bool,
}

/// Result of [`LedgerService::record_join`].
#[derive(Debug, Clone)]
pub struct RecordedJoin {
    pub record: invite_joins::Model,
    /// Active record that was closed because the member joined again
    /// without a leave being seen. Its inviter is charged a leave.
    pub superseded: Option<invite_joins::Model>,
    /// Row of the superseded record's inviter after the leave.
    pub superseded_inviter: Option<invite_users::Model>,
    /// Row of the new record's inviter after the join.
    pub inviter: Option<invite_users::Model>,
}

/// Result of [`LedgerService::record_leave`].
#[derive(Debug, Clone)]
pub struct RecordedLeave {
    pub record: invite_joins::Model,
    /// Row of the record's inviter after the leave.
    pub inviter: Option<invite_users::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    Created,
    Reassigned {
        previous_inviter: Option<serenity::UserId>,
    },
    AlreadyCredited,
}

/// Per-guild settings with defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSettings {
    pub minimum_account_age_days: i32,
    pub welcome_channel_id: Option<serenity::ChannelId>,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            minimum_account_age_days: DEFAULT_MINIMUM_ACCOUNT_AGE_DAYS,
            welcome_channel_id: None,
        }
    }
}

/// Durable invite counters and join records.
#[derive(Clone)]
pub struct LedgerService {
    db: DatabaseConnection,
}

impl LedgerService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_user(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Result<Option<invite_users::Model>, LedgerError> {
        Ok(invite_users::Entity::find_by_id((guild_id.get() as i64, user_id.get() as i64))
            .one(&self.db)
            .await?)
    }

    /// Returns the user's row, inserting a zeroed one when missing.
    pub async fn get_or_create_user(
        &self,
        guild_id: serenity::GuildId,
        profile: &UserProfile,
    ) -> Result<invite_users::Model, LedgerError> {
        if let Some(user) = self.get_user(guild_id, profile.user_id).await? {
            return Ok(user);
        }

        ensure_user(&self.db, guild_id, profile).await?;

        debug!("Created invite ledger entry for {} in guild {}", profile.user_id, guild_id);

        self.get_user(guild_id, profile.user_id)
            .await?
            .ok_or(LedgerError::UserNotFound {
                guild_id,
                user_id: profile.user_id,
            })
    }

    /// Applies `delta` to the user's counters in one transaction and rewrites
    /// `total` from the clamped result.
    pub async fn adjust_counters(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        delta: CounterDelta,
    ) -> Result<invite_users::Model, LedgerError> {
        self.update_counters(guild_id, user_id, |counters| counters.apply(delta))
            .await
    }

    /// Removes invites from a user, depleting bonus before joins.
    pub async fn remove_invites(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        amount: u32,
    ) -> Result<invite_users::Model, LedgerError> {
        self.update_counters(guild_id, user_id, |counters| counters.remove(amount))
            .await
    }

    async fn update_counters(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        update: impl FnOnce(Counters) -> Counters,
    ) -> Result<invite_users::Model, LedgerError> {
        let txn = self.db.begin().await?;
        let updated = update_user_counters(&txn, guild_id, user_id, update).await?;
        txn.commit().await?;

        Ok(updated)
    }

    /// Records a join and credits its inviter in one transaction.
    ///
    /// Both users get a ledger row if missing. A record still active for the
    /// same member is closed and its inviter charged a leave, so the member
    /// never has more than one active record.
    pub async fn record_join(&self, join: NewJoin) -> Result<RecordedJoin, LedgerError> {
        let guild_id = join.guild_id;
        let txn = self.db.begin().await?;

        ensure_user(&txn, guild_id, &join.invited).await?;

        let superseded = close_active_joins(&txn, guild_id, join.invited.user_id).await?;
        let superseded_inviter = match superseded.as_ref().and_then(inviter_of) {
            Some(previous) => {
                ensure_user(&txn, guild_id, &UserProfile::from_id(previous)).await?;
                Some(charge(&txn, guild_id, previous, CounterDelta::leaves(1)).await?)
            }
            None => None,
        };

        let record = insert_join(&txn, &join).await?;

        let inviter = match &join.inviter {
            Some(inviter) => {
                ensure_user(&txn, guild_id, inviter).await?;
                Some(charge(&txn, guild_id, inviter.user_id, CounterDelta::joins(1)).await?)
            }
            None => None,
        };

        txn.commit().await?;

        Ok(RecordedJoin {
            record,
            superseded,
            superseded_inviter,
            inviter,
        })
    }

    /// Credits `inviter` with the member's active join in one transaction.
    ///
    /// A join credited to someone else is moved over and the previous
    /// inviter loses that join. Without an active join a `manual` record is
    /// created.
    pub async fn credit_invite(
        &self,
        guild_id: serenity::GuildId,
        inviter: &UserProfile,
        invited: &UserProfile,
    ) -> Result<CreditOutcome, LedgerError> {
        let txn = self.db.begin().await?;

        ensure_user(&txn, guild_id, inviter).await?;
        ensure_user(&txn, guild_id, invited).await?;

        let active = invite_joins::Entity::find()
            .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_joins::Column::InvitedUserId.eq(invited.user_id.get() as i64))
            .filter(invite_joins::Column::IsLeft.eq(false))
            .order_by_desc(invite_joins::Column::Id)
            .lock_exclusive()
            .one(&txn)
            .await?;

        let outcome = match active {
            Some(record) if inviter_of(&record) == Some(inviter.user_id) => {
                txn.commit().await?;
                return Ok(CreditOutcome::AlreadyCredited);
            }
            Some(record) => {
                let previous_inviter = inviter_of(&record);

                let mut moved: invite_joins::ActiveModel = record.into();
                moved.inviter_id = Set(Some(inviter.user_id.get() as i64));
                moved.source = Set(JoinSource::Manual);
                moved.invite_code = Set(None);
                moved.update(&txn).await?;

                if let Some(previous) = previous_inviter {
                    ensure_user(&txn, guild_id, &UserProfile::from_id(previous)).await?;
                    charge(&txn, guild_id, previous, CounterDelta::joins(-1)).await?;
                }

                CreditOutcome::Reassigned { previous_inviter }
            }
            None => {
                insert_join(
                    &txn,
                    &NewJoin {
                        guild_id,
                        inviter: Some(inviter.clone()),
                        invited: invited.clone(),
                        source: JoinSource::Manual,
                        invite_code: None,
                        is_valid: true,
                    },
                )
                .await?;
                CreditOutcome::Created
            }
        };

        charge(&txn, guild_id, inviter.user_id, CounterDelta::joins(1)).await?;
        txn.commit().await?;

        Ok(outcome)
    }

    /// Marks the member's active join record as left and charges the leave
    /// to its inviter in the same transaction.
    ///
    /// Returns `None` when there was nothing to close, which makes repeated
    /// leaves harmless.
    pub async fn record_leave(
        &self,
        guild_id: serenity::GuildId,
        invited_id: serenity::UserId,
    ) -> Result<Option<RecordedLeave>, LedgerError> {
        let txn = self.db.begin().await?;

        let Some(record) = close_active_joins(&txn, guild_id, invited_id).await? else {
            txn.commit().await?;
            debug!("No active join record for {} in guild {}", invited_id, guild_id);
            return Ok(None);
        };

        let inviter = match inviter_of(&record) {
            Some(inviter_id) => {
                ensure_user(&txn, guild_id, &UserProfile::from_id(inviter_id)).await?;
                Some(charge(&txn, guild_id, inviter_id, CounterDelta::leaves(1)).await?)
            }
            None => None,
        };

        txn.commit().await?;

        Ok(Some(RecordedLeave { record, inviter }))
    }

    #[cfg(test)]
    pub async fn active_join(
        &self,
        guild_id: serenity::GuildId,
        invited_id: serenity::UserId,
    ) -> Result<Option<invite_joins::Model>, LedgerError> {
        Ok(invite_joins::Entity::find()
            .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_joins::Column::InvitedUserId.eq(invited_id.get() as i64))
            .filter(invite_joins::Column::IsLeft.eq(false))
            .order_by_desc(invite_joins::Column::Id)
            .one(&self.db)
            .await?)
    }

    /// Most recent join record of a member, active or not.
    pub async fn latest_join(
        &self,
        guild_id: serenity::GuildId,
        invited_id: serenity::UserId,
    ) -> Result<Option<invite_joins::Model>, LedgerError> {
        Ok(invite_joins::Entity::find()
            .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_joins::Column::InvitedUserId.eq(invited_id.get() as i64))
            .order_by_desc(invite_joins::Column::Id)
            .one(&self.db)
            .await?)
    }

    /// Members that currently have an active join record.
    pub async fn active_invited_ids(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<HashSet<serenity::UserId>, LedgerError> {
        let ids: Vec<i64> = invite_joins::Entity::find()
            .select_only()
            .column(invite_joins::Column::InvitedUserId)
            .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_joins::Column::IsLeft.eq(false))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(ids
            .into_iter()
            .map(|id| serenity::UserId::new(id as u64))
            .collect())
    }

    #[cfg(test)]
    pub async fn joins_for_guild(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Vec<invite_joins::Model>, LedgerError> {
        Ok(invite_joins::Entity::find()
            .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
            .order_by_asc(invite_joins::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn users_for_guild(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Vec<invite_users::Model>, LedgerError> {
        Ok(invite_users::Entity::find()
            .filter(invite_users::Column::GuildId.eq(guild_id.get() as i64))
            .all(&self.db)
            .await?)
    }

    /// Users with a positive total, best first. Ties go to more regular
    /// joins, then to the lower user id.
    pub async fn leaderboard(
        &self,
        guild_id: serenity::GuildId,
        limit: u64,
    ) -> Result<Vec<invite_users::Model>, LedgerError> {
        Ok(invite_users::Entity::find()
            .filter(invite_users::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_users::Column::Total.gte(1))
            .order_by_desc(invite_users::Column::Total)
            .order_by_desc(invite_users::Column::Joins)
            .order_by_asc(invite_users::Column::UserId)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn guild_settings(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<GuildSettings, LedgerError> {
        let config = guild_configs::Entity::find_by_id(guild_id.get() as i64)
            .one(&self.db)
            .await?;

        Ok(config
            .map(|c| GuildSettings {
                minimum_account_age_days: c.minimum_account_age_days,
                welcome_channel_id: c
                    .welcome_channel_id
                    .map(|id| serenity::ChannelId::new(id as u64)),
            })
            .unwrap_or_default())
    }

    pub async fn set_guild_settings(
        &self,
        guild_id: serenity::GuildId,
        settings: &GuildSettings,
    ) -> Result<(), LedgerError> {
        let model = guild_configs::ActiveModel {
            guild_id: Set(guild_id.get() as i64),
            minimum_account_age_days: Set(settings.minimum_account_age_days),
            welcome_channel_id: Set(settings.welcome_channel_id.map(|id| id.get() as i64)),
            updated_at: Set(Utc::now().into()),
        };

        guild_configs::Entity::insert(model)
            .on_conflict(
                OnConflict::column(guild_configs::Column::GuildId)
                    .update_columns([
                        guild_configs::Column::MinimumAccountAgeDays,
                        guild_configs::Column::WelcomeChannelId,
                        guild_configs::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    /// Reward tiers of a guild, lowest requirement first.
    pub async fn reward_tiers(
        &self,
        guild_id: serenity::GuildId,
    ) -> Result<Vec<invite_rewards::Model>, LedgerError> {
        Ok(invite_rewards::Entity::find()
            .filter(invite_rewards::Column::GuildId.eq(guild_id.get() as i64))
            .order_by_asc(invite_rewards::Column::RequiredInvites)
            .order_by_asc(invite_rewards::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Adds a tier, or moves the role's existing tier to a new requirement.
    pub async fn upsert_reward_tier(
        &self,
        guild_id: serenity::GuildId,
        required_invites: i32,
        role_id: serenity::RoleId,
        role_name: &str,
    ) -> Result<(), LedgerError> {
        let model = invite_rewards::ActiveModel {
            guild_id: Set(guild_id.get() as i64),
            required_invites: Set(required_invites),
            role_id: Set(role_id.get() as i64),
            role_name: Set(role_name.to_string()),
            created_at: Set(Utc::now().into()),
            ..Default::default()
        };

        invite_rewards::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    invite_rewards::Column::GuildId,
                    invite_rewards::Column::RoleId,
                ])
                .update_columns([
                    invite_rewards::Column::RequiredInvites,
                    invite_rewards::Column::RoleName,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        Ok(())
    }

    /// Returns whether a tier for the role existed.
    pub async fn remove_reward_tier(
        &self,
        guild_id: serenity::GuildId,
        role_id: serenity::RoleId,
    ) -> Result<bool, LedgerError> {
        let result = invite_rewards::Entity::delete_many()
            .filter(invite_rewards::Column::GuildId.eq(guild_id.get() as i64))
            .filter(invite_rewards::Column::RoleId.eq(role_id.get() as i64))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }
}

fn inviter_of(record: &invite_joins::Model) -> Option<serenity::UserId> {
    record.inviter_id.map(|id| serenity::UserId::new(id as u64))
}

/// Inserts a zeroed ledger row unless the user already has one.
async fn ensure_user<C: ConnectionTrait>(
    conn: &C,
    guild_id: serenity::GuildId,
    profile: &UserProfile,
) -> Result<(), DbErr> {
    let now = Utc::now();
    let user = invite_users::ActiveModel {
        guild_id: Set(guild_id.get() as i64),
        user_id: Set(profile.user_id.get() as i64),
        username: Set(profile.username.clone()),
        display_name: Set(profile.display_name.clone()),
        account_created_at: Set(profile.account_created_at.map(Into::into)),
        joins: Set(0),
        bonus: Set(0),
        leaves: Set(0),
        fake: Set(0),
        total: Set(0),
        created_at: Set(now.into()),
        updated_at: Set(now.into()),
    };

    // A concurrent insert of the same user is not an error.
    invite_users::Entity::insert(user)
        .on_conflict(
            OnConflict::columns([invite_users::Column::GuildId, invite_users::Column::UserId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;

    Ok(())
}

async fn update_user_counters<C: ConnectionTrait>(
    conn: &C,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
    update: impl FnOnce(Counters) -> Counters,
) -> Result<invite_users::Model, LedgerError> {
    let user = invite_users::Entity::find_by_id((guild_id.get() as i64, user_id.get() as i64))
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or(LedgerError::UserNotFound { guild_id, user_id })?;

    let counters = update(Counters::of(&user));

    let mut active: invite_users::ActiveModel = user.into();
    active.joins = Set(counters.joins);
    active.bonus = Set(counters.bonus);
    active.leaves = Set(counters.leaves);
    active.fake = Set(counters.fake);
    active.total = Set(counters.total());
    active.updated_at = Set(Utc::now().into());

    Ok(active.update(conn).await?)
}

async fn charge<C: ConnectionTrait>(
    conn: &C,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
    delta: CounterDelta,
) -> Result<invite_users::Model, LedgerError> {
    update_user_counters(conn, guild_id, user_id, |counters| counters.apply(delta)).await
}

async fn insert_join<C: ConnectionTrait>(
    conn: &C,
    join: &NewJoin,
) -> Result<invite_joins::Model, DbErr> {
    invite_joins::ActiveModel {
        guild_id: Set(join.guild_id.get() as i64),
        inviter_id: Set(join.inviter.as_ref().map(|i| i.user_id.get() as i64)),
        invited_user_id: Set(join.invited.user_id.get() as i64),
        invited_username: Set(join.invited.username.clone()),
        source: Set(join.source),
        invite_code: Set(join.invite_code.clone()),
        is_valid: Set(join.is_valid),
        is_left: Set(false),
        left_at: Set(None),
        created_at: Set(Utc::now().into()),
        ..Default::default()
    }
    .insert(conn)
    .await
}

/// Closes every active join record of a member and returns the newest one.
async fn close_active_joins<C: ConnectionTrait>(
    conn: &C,
    guild_id: serenity::GuildId,
    invited_id: serenity::UserId,
) -> Result<Option<invite_joins::Model>, DbErr> {
    let active = invite_joins::Entity::find()
        .filter(invite_joins::Column::GuildId.eq(guild_id.get() as i64))
        .filter(invite_joins::Column::InvitedUserId.eq(invited_id.get() as i64))
        .filter(invite_joins::Column::IsLeft.eq(false))
        .order_by_desc(invite_joins::Column::Id)
        .lock_exclusive()
        .all(conn)
        .await?;

    let mut newest = None;
    for record in active {
        let mut closing: invite_joins::ActiveModel = record.into();
        closing.is_left = Set(true);
        closing.left_at = Set(Some(Utc::now().into()));
        let closed = closing.update(conn).await?;
        newest.get_or_insert(closed);
    }

    Ok(newest)
}
