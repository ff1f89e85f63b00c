use crate::db::entities::invite_joins::JoinSource;
use crate::db::entities::invite_users;
use crate::services::invite_tracker::ledger::{GuildSettings, LedgerError};
use crate::services::invite_tracker::platform::{LiveInvite, UserProfile};
use crate::services::invite_tracker::CreditOutcome;
use crate::{Context, Error};
use poise::serenity_prelude as serenity;

const MAX_ADJUSTMENT: i32 = 10000;

const RETRY_LATER: &str = "Something went wrong while loading invite data. Please try again later.";

async fn reply(ctx: Context<'_>, content: impl Into<String>, ephemeral: bool) -> Result<(), Error> {
    ctx.send(
        poise::CreateReply::default()
            .content(content)
            .ephemeral(ephemeral),
    )
    .await?;
    Ok(())
}

fn guild_id(ctx: Context<'_>) -> Result<serenity::GuildId, Error> {
    ctx.guild_id()
        .ok_or_else(|| anyhow::anyhow!("command used outside of a guild"))
}

/// Message shown to an admin whose request was rejected.
fn admin_error_message(e: &Error) -> String {
    match e.downcast_ref::<LedgerError>() {
        Some(LedgerError::UserNotFound { user_id, .. }) => {
            format!("<@{}> has no invite record yet.", user_id)
        }
        Some(LedgerError::Database(_)) => RETRY_LATER.to_string(),
        None => e.to_string(),
    }
}

async fn reject(ctx: Context<'_>, e: Error) -> Result<(), Error> {
    tracing::warn!("Invite admin command {} failed: {:?}", ctx.command().name, e);
    reply(ctx, admin_error_message(&e), true).await
}

pub fn describe_source(source: &JoinSource) -> &'static str {
    match source {
        JoinSource::InviteDiff => "Invite link",
        JoinSource::Vanity => "Vanity URL",
        JoinSource::AuditLog => "Added by a member (audit log)",
        JoinSource::Backfill => "Already here when tracking started",
        JoinSource::Manual => "Credited by an admin",
        JoinSource::Unknown => "Unknown",
    }
}

fn format_counters(user: &invite_users::Model) -> String {
    format!(
        "**{}** invites ({} joins, {} bonus, {} left, {} fake)",
        user.total, user.joins, user.bonus, user.leaves, user.fake
    )
}

/// View invite statistics
#[poise::command(
    slash_command,
    guild_only,
    subcommands("stats", "leaderboard", "who", "codes")
)]
pub async fn invites(ctx: Context<'_>) -> Result<(), Error> {
    reply(
        ctx,
        "Please use a subcommand: `/invites stats`, `/invites leaderboard`, `/invites who` or `/invites codes`",
        true,
    )
    .await
}

/// View invite statistics for a user
#[poise::command(slash_command, guild_only)]
pub async fn stats(
    ctx: Context<'_>,
    #[description = "User to check (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let target = user.as_ref().unwrap_or_else(|| ctx.author());

    let row = match ctx.data().invites.get_user(guild_id, target.id).await {
        Ok(row) => row,
        Err(e) => {
            tracing::error!("Failed to load invites of {} in guild {}: {:?}", target.id, guild_id, e);
            return reply(ctx, RETRY_LATER, true).await;
        }
    };

    let mut response = format!("📊 **Invite Statistics for {}**\n\n", target.name);
    match row {
        Some(row) => response.push_str(&format_counters(&row)),
        None => response.push_str("No invites tracked yet."),
    }

    reply(ctx, response, false).await
}

/// View server invite leaderboard
#[poise::command(slash_command, guild_only)]
pub async fn leaderboard(
    ctx: Context<'_>,
    #[description = "Number of users to show (default: 10)"]
    #[min = 1]
    #[max = 25]
    limit: Option<u32>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let limit = limit.unwrap_or(10);

    ctx.defer().await?;

    let top_inviters = match ctx.data().invites.get_leaderboard(guild_id, limit as u64).await {
        Ok(top) => top,
        Err(e) => {
            tracing::error!("Failed to load leaderboard of guild {}: {:?}", guild_id, e);
            return reply(ctx, RETRY_LATER, true).await;
        }
    };

    let mut response = format!("🏆 **Top {} Inviters**\n\n", limit);

    if top_inviters.is_empty() {
        response.push_str("No invite data available yet.");
    } else {
        for (idx, inviter) in top_inviters.iter().enumerate() {
            let medal = match idx {
                0 => "🥇",
                1 => "🥈",
                2 => "🥉",
                _ => "  ",
            };
            response.push_str(&format!(
                "{} **#{}** <@{}> - {}\n",
                medal,
                idx + 1,
                inviter.user_id,
                format_counters(inviter)
            ));
        }
    }

    reply(ctx, response, false).await
}

/// List your invite links
#[poise::command(slash_command, guild_only)]
pub async fn codes(
    ctx: Context<'_>,
    #[description = "User whose links to list (defaults to you)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let target = user.as_ref().unwrap_or_else(|| ctx.author());

    let response = match ctx.data().invites.invites_of(guild_id, target.id) {
        Some((invites, taken_at)) => format_codes(&target.name, &invites, taken_at),
        None => "Invite links of this server have not been loaded yet.".to_string(),
    };

    reply(ctx, response, true).await
}

fn format_codes(
    name: &str,
    invites: &[LiveInvite],
    taken_at: Option<chrono::DateTime<chrono::Utc>>,
) -> String {
    if invites.is_empty() {
        return format!("{} has no active invite links.", name);
    }

    let mut response = format!("🔗 **Invite links of {}**\n\n", name);
    for invite in invites {
        let limit = match invite.max_uses {
            Some(max) => format!("{}/{}", invite.uses, max),
            None => invite.uses.to_string(),
        };
        response.push_str(&format!("`{}` - {} uses", invite.code, limit));
        if let Some(expires_at) = invite.expires_at {
            response.push_str(&format!(", expires <t:{}:R>", expires_at.timestamp()));
        }
        response.push('\n');
    }
    if let Some(taken_at) = taken_at {
        response.push_str(&format!("\n*As of <t:{}:R>*", taken_at.timestamp()));
    }
    response
}

/// See who invited a member
#[poise::command(slash_command, guild_only)]
pub async fn who(
    ctx: Context<'_>,
    #[description = "Member to look up"] user: serenity::User,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;

    let record = match ctx.data().invites.join_info(guild_id, user.id).await {
        Ok(record) => record,
        Err(e) => {
            tracing::error!("Failed to load join of {} in guild {}: {:?}", user.id, guild_id, e);
            return reply(ctx, RETRY_LATER, true).await;
        }
    };

    let Some(record) = record else {
        return reply(ctx, format!("No join recorded for {}.", user.name), true).await;
    };

    let mut response = format!("**How {} joined:**\n", user.name);
    match record.inviter_id {
        Some(inviter_id) => response.push_str(&format!("👤 Invited by: <@{}>\n", inviter_id)),
        None => response.push_str("👤 Invited by: unknown\n"),
    }
    response.push_str(&format!("🔗 Join type: {}\n", describe_source(&record.source)));
    if let Some(code) = &record.invite_code {
        response.push_str(&format!("🎫 Invite code: `{}`\n", code));
    }
    if !record.is_valid {
        response.push_str("⚠️ Account was younger than the minimum age when joining\n");
    }
    if record.is_left {
        response.push_str("🚪 Has left the server since\n");
    }

    reply(ctx, response, false).await
}

/// Correct invite counts (Admin only)
#[poise::command(
    slash_command,
    guild_only,
    rename = "invites-admin",
    default_member_permissions = "MANAGE_GUILD",
    subcommands("admin_credit", "admin_bonus", "admin_remove", "admin_fake", "admin_sync")
)]
pub async fn invites_admin(ctx: Context<'_>) -> Result<(), Error> {
    reply(ctx, "Please use a subcommand.", true).await
}

/// Credit a member with inviting someone
#[poise::command(slash_command, guild_only, rename = "credit", required_permissions = "MANAGE_GUILD")]
pub async fn admin_credit(
    ctx: Context<'_>,
    #[description = "Member who gets the credit"] inviter: serenity::User,
    #[description = "Member they brought in"] member: serenity::User,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.defer_ephemeral().await?;

    let outcome = ctx
        .data()
        .invites
        .credit_manual_invite(
            guild_id,
            &UserProfile::from_user(&inviter),
            &UserProfile::from_user(&member),
        )
        .await;

    let response = match outcome {
        Ok(CreditOutcome::Created) => format!("✅ <@{}> now has credit for inviting <@{}>.", inviter.id, member.id),
        Ok(CreditOutcome::Reassigned { previous_inviter: Some(previous) }) => format!(
            "✅ Moved credit for <@{}> from <@{}> to <@{}>.",
            member.id, previous, inviter.id
        ),
        Ok(CreditOutcome::Reassigned { previous_inviter: None }) => format!(
            "✅ <@{}> now has credit for inviting <@{}>.",
            inviter.id, member.id
        ),
        Ok(CreditOutcome::AlreadyCredited) => format!(
            "<@{}> already has credit for inviting <@{}>.",
            inviter.id, member.id
        ),
        Err(e) => return reject(ctx, e).await,
    };

    reply(ctx, response, true).await
}

/// Give a member bonus invites
#[poise::command(slash_command, guild_only, rename = "bonus", required_permissions = "MANAGE_GUILD")]
pub async fn admin_bonus(
    ctx: Context<'_>,
    #[description = "Member to reward"] user: serenity::User,
    #[description = "Invites to add"]
    #[min = 1]
    #[max = 10000]
    amount: u32,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.defer_ephemeral().await?;

    match ctx
        .data()
        .invites
        .add_bonus_invites(guild_id, &UserProfile::from_user(&user), amount)
        .await
    {
        Ok(row) => reply(ctx, format!("✅ <@{}> now has {}", user.id, format_counters(&row)), true).await,
        Err(e) => reject(ctx, e).await,
    }
}

/// Take invites away from a member, bonus invites first
#[poise::command(slash_command, guild_only, rename = "remove", required_permissions = "MANAGE_GUILD")]
pub async fn admin_remove(
    ctx: Context<'_>,
    #[description = "Member to correct"] user: serenity::User,
    #[description = "Invites to remove"]
    #[min = 1]
    #[max = 10000]
    amount: u32,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.defer_ephemeral().await?;

    match ctx.data().invites.remove_invites(guild_id, user.id, amount).await {
        Ok(row) => reply(ctx, format!("✅ <@{}> now has {}", user.id, format_counters(&row)), true).await,
        Err(e) => reject(ctx, e).await,
    }
}

/// Mark invites of a member as fake; a negative amount clears marks
#[poise::command(slash_command, guild_only, rename = "fake", required_permissions = "MANAGE_GUILD")]
pub async fn admin_fake(
    ctx: Context<'_>,
    #[description = "Inviter to correct"] user: serenity::User,
    #[description = "Fake invites to add (negative to clear)"]
    #[max = 10000]
    amount: i32,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    if !fake_adjustment_in_range(amount) {
        return reply(
            ctx,
            format!("❌ The amount must be a non-zero number between -{0} and {0}.", MAX_ADJUSTMENT),
            true,
        )
        .await;
    }
    ctx.defer_ephemeral().await?;

    match ctx.data().invites.mark_fake(guild_id, user.id, amount).await {
        Ok(row) => reply(ctx, format!("✅ <@{}> now has {}", user.id, format_counters(&row)), true).await,
        Err(e) => reject(ctx, e).await,
    }
}

fn fake_adjustment_in_range(amount: i32) -> bool {
    amount != 0 && amount.unsigned_abs() <= MAX_ADJUSTMENT as u32
}

/// Re-apply reward roles for a member, or for everyone
#[poise::command(slash_command, guild_only, rename = "sync", required_permissions = "MANAGE_GUILD")]
pub async fn admin_sync(
    ctx: Context<'_>,
    #[description = "Member to sync (defaults to everyone)"] user: Option<serenity::User>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.defer_ephemeral().await?;

    let response = match user {
        Some(user) => match ctx.data().invites.sync_rewards(guild_id, user.id).await {
            Ok(report) => format!(
                "🔄 Synced <@{}> ({} invites): {} granted, {} revoked, {} failed.",
                user.id,
                report.total,
                report.granted.len(),
                report.revoked.len(),
                report.failed.len()
            ),
            Err(e) => return reject(ctx, e.into()).await,
        },
        None => match ctx.data().invites.sync_guild_rewards(guild_id).await {
            Ok(changed) => format!("🔄 Synced reward roles, {} members changed.", changed),
            Err(e) => return reject(ctx, e.into()).await,
        },
    };

    reply(ctx, response, true).await
}

/// Manage roles handed out for invites (Admin only)
#[poise::command(
    slash_command,
    guild_only,
    rename = "invite-rewards",
    default_member_permissions = "MANAGE_GUILD",
    subcommands("reward_add", "reward_remove", "reward_list")
)]
pub async fn invite_rewards(ctx: Context<'_>) -> Result<(), Error> {
    reply(ctx, "Please use a subcommand.", true).await
}

/// Hand out a role once a member reaches an invite count
#[poise::command(slash_command, guild_only, rename = "add", required_permissions = "MANAGE_GUILD")]
pub async fn reward_add(
    ctx: Context<'_>,
    #[description = "Role to hand out"] role: serenity::Role,
    #[description = "Invites needed"]
    #[min = 1]
    #[max = 100000]
    invites: u32,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    ctx.defer_ephemeral().await?;

    let required = i32::try_from(invites)?;
    match ctx
        .data()
        .invites
        .add_reward_tier(guild_id, required, role.id, &role.name)
        .await
    {
        Ok(changed) => {
            reply(
                ctx,
                format!(
                    "✅ <@&{}> is now given at {} invites ({} members updated).",
                    role.id, required, changed
                ),
                true,
            )
            .await
        }
        Err(e) => reject(ctx, e.into()).await,
    }
}

/// Stop handing out a role for invites
#[poise::command(slash_command, guild_only, rename = "remove", required_permissions = "MANAGE_GUILD")]
pub async fn reward_remove(
    ctx: Context<'_>,
    #[description = "Role to stop handing out"] role: serenity::Role,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;

    match ctx.data().invites.remove_reward_tier(guild_id, role.id).await {
        Ok(true) => reply(ctx, format!("✅ <@&{}> is no longer an invite reward.", role.id), true).await,
        Ok(false) => reply(ctx, format!("<@&{}> is not an invite reward.", role.id), true).await,
        Err(e) => reject(ctx, e.into()).await,
    }
}

/// List invite reward roles
#[poise::command(slash_command, guild_only, rename = "list", required_permissions = "MANAGE_GUILD")]
pub async fn reward_list(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;

    let tiers = match ctx.data().invites.reward_tiers(guild_id).await {
        Ok(tiers) => tiers,
        Err(e) => return reject(ctx, e.into()).await,
    };

    let mut response = String::from("🎁 **Invite Rewards**\n\n");
    if tiers.is_empty() {
        response.push_str("No reward roles configured.");
    } else {
        for tier in tiers {
            response.push_str(&format!("**{}** invites → <@&{}>\n", tier.required_invites, tier.role_id));
        }
    }

    reply(ctx, response, true).await
}

/// View or change invite tracking settings (Admin only)
#[poise::command(
    slash_command,
    guild_only,
    rename = "invite-config",
    default_member_permissions = "MANAGE_GUILD",
    required_permissions = "MANAGE_GUILD"
)]
pub async fn invite_config(
    ctx: Context<'_>,
    #[description = "Accounts younger than this many days are flagged"]
    #[min = 0]
    #[max = 3650]
    minimum_account_age_days: Option<u32>,
    #[description = "Channel for welcome messages"] welcome_channel: Option<serenity::Channel>,
) -> Result<(), Error> {
    let guild_id = guild_id(ctx)?;
    let invites = &ctx.data().invites;

    let mut settings = match invites.guild_settings(guild_id).await {
        Ok(settings) => settings,
        Err(e) => return reject(ctx, e.into()).await,
    };

    let changed = minimum_account_age_days.is_some() || welcome_channel.is_some();
    if let Some(days) = minimum_account_age_days {
        settings.minimum_account_age_days = i32::try_from(days)?;
    }
    if let Some(channel) = &welcome_channel {
        settings.welcome_channel_id = Some(channel.id());
    }

    if changed {
        if let Err(e) = invites.set_guild_settings(guild_id, &settings).await {
            return reject(ctx, e.into()).await;
        }
        tracing::info!("Updated invite settings of guild {}: {:?}", guild_id, settings);
    }

    reply(ctx, describe_settings(&settings, changed), true).await
}

fn describe_settings(settings: &GuildSettings, changed: bool) -> String {
    let mut response = String::from(if changed {
        "✅ **Invite settings updated**\n\n"
    } else {
        "⚙️ **Invite settings**\n\n"
    });
    response.push_str(&format!(
        "Minimum account age: **{} days**\n",
        settings.minimum_account_age_days
    ));
    match settings.welcome_channel_id {
        Some(channel_id) => response.push_str(&format!("Welcome channel: <#{}>\n", channel_id)),
        None => response.push_str("Welcome channel: not set\n"),
    }
    response
}

pub fn commands() -> Vec<poise::Command<crate::Data, Error>> {
    vec![invites(), invites_admin(), invite_rewards(), invite_config()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_name_the_missing_user() {
        let err: Error = LedgerError::UserNotFound {
            guild_id: serenity::GuildId::new(1),
            user_id: serenity::UserId::new(2),
        }
        .into();
        assert_eq!(admin_error_message(&err), "<@2> has no invite record yet.");
    }

    #[test]
    fn database_failures_are_not_shown_to_admins() {
        let err: Error = LedgerError::Database(sea_orm::DbErr::Custom("boom".into())).into();
        assert_eq!(admin_error_message(&err), RETRY_LATER);
    }

    #[test]
    fn code_list_shows_limits_and_expiry() {
        let expires_at = chrono::DateTime::from_timestamp(1_900_000_000, 0).expect("timestamp");
        let invites = vec![
            LiveInvite {
                code: "abc".to_string(),
                uses: 3,
                inviter_id: Some(serenity::UserId::new(2)),
                inviter_name: Some("ann".to_string()),
                max_uses: Some(10),
                expires_at: Some(expires_at),
            },
            LiveInvite {
                code: "def".to_string(),
                uses: 1,
                inviter_id: Some(serenity::UserId::new(2)),
                inviter_name: Some("ann".to_string()),
                max_uses: None,
                expires_at: None,
            },
        ];

        let text = format_codes("ann", &invites, None);
        assert!(text.contains("`abc` - 3/10 uses, expires <t:1900000000:R>"));
        assert!(text.contains("`def` - 1 uses\n"));
        assert_eq!(format_codes("ann", &[], None), "ann has no active invite links.");
    }

    #[test]
    fn fake_adjustments_are_bounded() {
        assert!(fake_adjustment_in_range(10000));
        assert!(fake_adjustment_in_range(-10000));
        assert!(fake_adjustment_in_range(-1));
        assert!(!fake_adjustment_in_range(0));
        assert!(!fake_adjustment_in_range(10001));
        assert!(!fake_adjustment_in_range(i32::MIN));
        assert!(!fake_adjustment_in_range(i32::MAX));
    }

    #[test]
    fn settings_summary_mentions_channel() {
        let settings = GuildSettings {
            minimum_account_age_days: 7,
            welcome_channel_id: Some(serenity::ChannelId::new(55)),
        };
        let text = describe_settings(&settings, false);
        assert!(text.contains("**7 days**"));
        assert!(text.contains("<#55>"));
    }
}
