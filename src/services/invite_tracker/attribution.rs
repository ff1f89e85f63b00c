//! Works out which invite brought a member in.
//!
//! Strategies run in a fixed order and the first one that resolves wins:
//! vanity counter, snapshot diff, audit log, and finally unknown.
//!
//! The snapshot diff is best effort. When two members join inside the same
//! refresh window they can both observe the same single incremented code, or
//! the second one sees two increments and falls through. Both joins are still
//! recorded; only the attribution of one of them may be wrong or unknown.

use super::platform::Platform;
use super::snapshot::{InviteSnapshot, InviteSnapshotCache};
use crate::db::entities::invite_joins::JoinSource;
use chrono::Utc;
use poise::serenity_prelude as serenity;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of attributing one join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    /// Joined through the guild's vanity link; there is no individual inviter.
    Vanity,
    /// Exactly one invite code's use count went up.
    Invite {
        code: String,
        inviter_id: Option<serenity::UserId>,
        inviter_name: Option<String>,
    },
    /// Found through an audit-log entry targeting the member.
    AuditLog { inviter_id: serenity::UserId },
    Unknown,
}

impl Attribution {
    pub fn inviter_id(&self) -> Option<serenity::UserId> {
        match self {
            Attribution::Invite { inviter_id, .. } => *inviter_id,
            Attribution::AuditLog { inviter_id } => Some(*inviter_id),
            Attribution::Vanity | Attribution::Unknown => None,
        }
    }

    pub fn source(&self) -> JoinSource {
        match self {
            Attribution::Vanity => JoinSource::Vanity,
            Attribution::Invite { .. } => JoinSource::InviteDiff,
            Attribution::AuditLog { .. } => JoinSource::AuditLog,
            Attribution::Unknown => JoinSource::Unknown,
        }
    }

    pub fn invite_code(&self) -> Option<&str> {
        match self {
            Attribution::Invite { code, .. } => Some(code),
            _ => None,
        }
    }
}

pub struct AttributionResolver<'a> {
    pub platform: &'a dyn Platform,
    pub cache: &'a InviteSnapshotCache,
    pub audit_window: Duration,
    pub audit_timeout: Duration,
}

impl AttributionResolver<'_> {
    /// Attributes a join. Platform failures only make the result less
    /// specific; this never fails.
    ///
    /// A successful live fetch replaces the cached snapshot, so the next join
    /// diffs against current counts.
    pub async fn resolve(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Attribution {
        let joined_at = Utc::now();

        let cached = self.cache.get(guild_id);
        match InviteSnapshot::fetch(self.platform, guild_id, cached.as_deref()).await {
            Ok(live) => {
                let previous = self.cache.replace(guild_id, live.clone());

                if let Some(previous) = previous {
                    if previous.vanity_increased(&live) {
                        return Attribution::Vanity;
                    }

                    if let Some(used) = previous.diff(&live) {
                        return Attribution::Invite {
                            code: used.code,
                            inviter_id: used.inviter_id,
                            inviter_name: used.inviter_name,
                        };
                    }
                } else {
                    debug!("No cached invites for guild {}, skipping diff", guild_id);
                }
            }
            Err(e) => {
                warn!(
                    "Failed to fetch invites for guild {} while attributing {}: {:?}",
                    guild_id, user_id, e
                );
            }
        }

        self.audit_fallback(guild_id, user_id, joined_at).await
    }

    async fn audit_fallback(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
        joined_at: chrono::DateTime<Utc>,
    ) -> Attribution {
        let since = joined_at
            - chrono::Duration::from_std(self.audit_window).unwrap_or(chrono::Duration::seconds(10));

        let lookup = self.platform.audit_inviter(guild_id, user_id, since);
        match tokio::time::timeout(self.audit_timeout, lookup).await {
            Ok(Ok(Some(inviter_id))) => Attribution::AuditLog { inviter_id },
            Ok(Ok(None)) => Attribution::Unknown,
            Ok(Err(e)) => {
                warn!("Audit log lookup failed in guild {}: {:?}", guild_id, e);
                Attribution::Unknown
            }
            Err(_) => {
                warn!("Audit log lookup timed out in guild {} for {}", guild_id, user_id);
                Attribution::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::invite_tracker::testing::{invite, FakePlatform};

    fn guild() -> serenity::GuildId {
        serenity::GuildId::new(1)
    }

    fn member() -> serenity::UserId {
        serenity::UserId::new(77)
    }

    fn resolver<'a>(platform: &'a FakePlatform, cache: &'a InviteSnapshotCache) -> AttributionResolver<'a> {
        AttributionResolver {
            platform,
            cache,
            audit_window: Duration::from_secs(10),
            audit_timeout: Duration::from_secs(3),
        }
    }

    async fn primed(platform: &FakePlatform) -> InviteSnapshotCache {
        let cache = InviteSnapshotCache::new();
        cache.refresh(platform, guild()).await.expect("prime");
        cache
    }

    #[tokio::test]
    async fn incremented_invite_is_attributed_to_its_inviter() {
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("X", 4, 10), invite("Y", 2, 11)]);
        let cache = primed(&platform).await;

        platform.set_invites(vec![invite("X", 5, 10), invite("Y", 2, 11)]);
        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;

        assert_eq!(attribution.inviter_id(), Some(serenity::UserId::new(10)));
        assert_eq!(attribution.source(), JoinSource::InviteDiff);
        assert_eq!(attribution.invite_code(), Some("X"));
        // The cache now holds the post-join counts.
        assert_eq!(cache.get(guild()).expect("cached").invites["X"].uses, 5);
    }

    #[tokio::test]
    async fn vanity_wins_over_diff() {
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("X", 4, 10)]);
        platform.set_vanity(Some(20));
        let cache = primed(&platform).await;

        platform.set_invites(vec![invite("X", 5, 10)]);
        platform.set_vanity(Some(21));
        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;

        assert_eq!(attribution, Attribution::Vanity);
        assert_eq!(attribution.inviter_id(), None);
    }

    #[tokio::test]
    async fn ambiguous_diff_falls_back_to_audit_log() {
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("X", 1, 10), invite("Y", 1, 11)]);
        let cache = primed(&platform).await;

        platform.set_invites(vec![invite("X", 2, 10), invite("Y", 2, 11)]);
        platform.set_audit_inviter(member(), serenity::UserId::new(12));
        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;

        assert_eq!(
            attribution,
            Attribution::AuditLog {
                inviter_id: serenity::UserId::new(12)
            }
        );
    }

    #[tokio::test]
    async fn nothing_matching_is_unknown() {
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("X", 4, 10)]);
        let cache = primed(&platform).await;

        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;
        assert_eq!(attribution, Attribution::Unknown);
        assert_eq!(attribution.source(), JoinSource::Unknown);
    }

    #[tokio::test]
    async fn invite_fetch_failure_keeps_cache_and_still_tries_audit_log() {
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("X", 4, 10)]);
        let cache = primed(&platform).await;

        platform.fail_invites(true);
        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;
        assert_eq!(attribution, Attribution::Unknown);
        assert_eq!(cache.get(guild()).expect("kept").invites["X"].uses, 4);

        platform.set_audit_inviter(member(), serenity::UserId::new(12));
        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;
        assert_eq!(attribution.source(), JoinSource::AuditLog);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_audit_log_degrades_to_unknown() {
        let platform = FakePlatform::new();
        platform.fail_invites(true);
        platform.set_audit_inviter(member(), serenity::UserId::new(12));
        platform.set_audit_delay(Duration::from_secs(30));
        let cache = InviteSnapshotCache::new();

        let attribution = resolver(&platform, &cache).resolve(guild(), member()).await;
        assert_eq!(attribution, Attribution::Unknown);
    }
}
