use super::ledger::{LedgerService, NewJoin};
use super::platform::Platform;
use crate::db::entities::invite_joins::JoinSource;
use crate::Error;
use poise::serenity_prelude as serenity;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub scanned: usize,
    pub created: usize,
}

/// Gives every present, non-bot member without an active join record an
/// unattributed `backfill` record.
///
/// Members already covered are skipped, so running it again against the
/// same member list creates nothing.
pub async fn backfill_guild(
    platform: &dyn Platform,
    ledger: &LedgerService,
    guild_id: serenity::GuildId,
) -> Result<BackfillReport, Error> {
    let members = platform.members(guild_id).await?;
    let covered = ledger.active_invited_ids(guild_id).await?;

    let mut report = BackfillReport {
        scanned: members.len(),
        created: 0,
    };

    for member in members
        .iter()
        .filter(|m| !m.bot && !covered.contains(&m.user_id))
    {
        ledger
            .record_join(NewJoin {
                guild_id,
                inviter: None,
                invited: member.clone(),
                source: JoinSource::Backfill,
                invite_code: None,
                is_valid: true,
            })
            .await?;
        report.created += 1;
    }

    if report.created > 0 {
        info!(
            "Backfilled {} of {} members in guild {}",
            report.created, report.scanned, guild_id
        );
    }

    Ok(report)
}
