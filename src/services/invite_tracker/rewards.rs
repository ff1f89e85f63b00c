use super::ledger::{LedgerError, LedgerService};
use super::platform::Platform;
use crate::db::entities::invite_rewards;
use poise::serenity_prelude as serenity;
use tracing::{debug, info, warn};

/// What a reward sync changed for one member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardSyncReport {
    pub total: i32,
    pub granted: Vec<serenity::RoleId>,
    pub revoked: Vec<serenity::RoleId>,
    pub failed: Vec<serenity::RoleId>,
}

/// Role change a tier calls for, given a total and the roles held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierAction {
    Grant,
    Revoke,
    Keep,
}

pub fn tier_action(total: i32, tier: &invite_rewards::Model, roles: &[serenity::RoleId]) -> TierAction {
    let role_id = serenity::RoleId::new(tier.role_id as u64);
    let has_role = roles.contains(&role_id);
    let qualifies = total >= tier.required_invites;

    match (qualifies, has_role) {
        (true, false) => TierAction::Grant,
        (false, true) => TierAction::Revoke,
        _ => TierAction::Keep,
    }
}

/// Brings a member's reward roles in line with their current invite total.
///
/// Every tier is handled on its own; a failed grant or revoke is logged and
/// the remaining tiers still run. Missing ledger rows and members who are no
/// longer in the guild are skipped.
pub async fn sync_rewards(
    platform: &dyn Platform,
    ledger: &LedgerService,
    guild_id: serenity::GuildId,
    user_id: serenity::UserId,
) -> Result<RewardSyncReport, LedgerError> {
    let Some(user) = ledger.get_user(guild_id, user_id).await? else {
        return Ok(RewardSyncReport::default());
    };

    let mut report = RewardSyncReport {
        total: user.total,
        ..Default::default()
    };

    let tiers = ledger.reward_tiers(guild_id).await?;
    if tiers.is_empty() {
        return Ok(report);
    }

    let roles = match platform.member_roles(guild_id, user_id).await {
        Ok(Some(roles)) => roles,
        Ok(None) => {
            debug!("Skipping reward sync for {}: not in guild {}", user_id, guild_id);
            return Ok(report);
        }
        Err(e) => {
            warn!("Failed to load roles of {} in guild {}: {:?}", user_id, guild_id, e);
            return Ok(report);
        }
    };

    for tier in &tiers {
        let role_id = serenity::RoleId::new(tier.role_id as u64);

        match tier_action(user.total, tier, &roles) {
            TierAction::Grant => match platform.grant_role(guild_id, user_id, role_id).await {
                Ok(()) => {
                    info!(
                        "Granted reward role {} to {} ({} invites, needs {})",
                        tier.role_name, user_id, user.total, tier.required_invites
                    );
                    report.granted.push(role_id);
                }
                Err(e) => {
                    warn!("Failed to grant reward role {} to {}: {:?}", tier.role_name, user_id, e);
                    report.failed.push(role_id);
                }
            },
            TierAction::Revoke => match platform.revoke_role(guild_id, user_id, role_id).await {
                Ok(()) => {
                    info!(
                        "Revoked reward role {} from {} ({} invites, needs {})",
                        tier.role_name, user_id, user.total, tier.required_invites
                    );
                    report.revoked.push(role_id);
                }
                Err(e) => {
                    warn!("Failed to revoke reward role {} from {}: {:?}", tier.role_name, user_id, e);
                    report.failed.push(role_id);
                }
            },
            TierAction::Keep => {}
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_connection;
    use crate::services::invite_tracker::ledger::CounterDelta;
    use crate::services::invite_tracker::platform::UserProfile;
    use crate::services::invite_tracker::testing::FakePlatform;

    fn guild() -> serenity::GuildId {
        serenity::GuildId::new(1)
    }

    fn user() -> serenity::UserId {
        serenity::UserId::new(42)
    }

    async fn ledger_with_total(total: i32) -> LedgerService {
        let ledger = LedgerService::new(test_connection().await);
        ledger
            .get_or_create_user(guild(), &UserProfile::from_id(user()))
            .await
            .expect("create");
        ledger
            .adjust_counters(guild(), user(), CounterDelta::joins(total))
            .await
            .expect("adjust");
        for (required, role) in [(1, 501), (5, 505), (10, 510)] {
            ledger
                .upsert_reward_tier(guild(), required, serenity::RoleId::new(role), "tier")
                .await
                .expect("tier");
        }
        ledger
    }

    #[tokio::test]
    async fn grants_exactly_the_tiers_reached() {
        let ledger = ledger_with_total(5).await;
        let platform = FakePlatform::new();
        platform.set_member_roles(user(), vec![serenity::RoleId::new(510)]);

        let report = sync_rewards(&platform, &ledger, guild(), user()).await.expect("sync");

        assert_eq!(report.granted, vec![serenity::RoleId::new(501), serenity::RoleId::new(505)]);
        assert_eq!(report.revoked, vec![serenity::RoleId::new(510)]);
        let mut roles = platform.member_roles_of(user());
        roles.sort();
        assert_eq!(roles, vec![serenity::RoleId::new(501), serenity::RoleId::new(505)]);
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let ledger = ledger_with_total(10).await;
        let platform = FakePlatform::new();
        platform.set_member_roles(user(), vec![]);

        sync_rewards(&platform, &ledger, guild(), user()).await.expect("first sync");
        let second = sync_rewards(&platform, &ledger, guild(), user()).await.expect("second sync");

        assert!(second.granted.is_empty());
        assert!(second.revoked.is_empty());
        assert_eq!(platform.member_roles_of(user()).len(), 3);
    }

    #[tokio::test]
    async fn failing_tier_does_not_stop_the_others() {
        let ledger = ledger_with_total(10).await;
        let platform = FakePlatform::new();
        platform.set_member_roles(user(), vec![]);
        platform.fail_role(serenity::RoleId::new(505));

        let report = sync_rewards(&platform, &ledger, guild(), user()).await.expect("sync");

        assert_eq!(report.failed, vec![serenity::RoleId::new(505)]);
        assert_eq!(report.granted, vec![serenity::RoleId::new(501), serenity::RoleId::new(510)]);
    }

    #[tokio::test]
    async fn absent_member_is_skipped() {
        let ledger = ledger_with_total(10).await;
        let platform = FakePlatform::new();

        let report = sync_rewards(&platform, &ledger, guild(), user()).await.expect("sync");
        assert_eq!(report.total, 10);
        assert!(report.granted.is_empty());
    }

    #[test]
    fn tier_action_depends_only_on_total_and_current_role() {
        let tier = invite_rewards::Model {
            id: 1,
            guild_id: 1,
            required_invites: 3,
            role_id: 9,
            role_name: "tier".into(),
            created_at: chrono::Utc::now().into(),
        };
        let held = [serenity::RoleId::new(9)];

        assert_eq!(tier_action(3, &tier, &[]), TierAction::Grant);
        assert_eq!(tier_action(3, &tier, &held), TierAction::Keep);
        assert_eq!(tier_action(2, &tier, &held), TierAction::Revoke);
        assert_eq!(tier_action(-1, &tier, &[]), TierAction::Keep);
    }
}
