use super::platform::{LiveInvite, Platform};
use crate::Error;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Point-in-time view of a guild's invite links and vanity counter.
#[derive(Debug, Clone, Default)]
pub struct InviteSnapshot {
    pub invites: HashMap<String, LiveInvite>,
    pub vanity_uses: Option<u64>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// The invite whose use count went up between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedInvite {
    pub code: String,
    pub inviter_id: Option<serenity::UserId>,
    pub inviter_name: Option<String>,
}

impl InviteSnapshot {
    pub fn new(invites: Vec<LiveInvite>, vanity_uses: Option<u64>) -> Self {
        Self {
            invites: invites
                .into_iter()
                .map(|invite| (invite.code.clone(), invite))
                .collect(),
            vanity_uses,
            taken_at: Some(Utc::now()),
        }
    }

    /// Fetches the live invite list and vanity counter of a guild.
    ///
    /// A failing vanity lookup keeps the counter of `previous`; a failing
    /// invite lookup fails the whole fetch.
    pub async fn fetch(
        platform: &dyn Platform,
        guild_id: serenity::GuildId,
        previous: Option<&InviteSnapshot>,
    ) -> Result<Self, Error> {
        let invites = platform.invites(guild_id).await?;
        let vanity_uses = match platform.vanity_uses(guild_id).await {
            Ok(uses) => uses,
            Err(e) => {
                debug!("Vanity lookup failed for guild {}: {:?}", guild_id, e);
                previous.and_then(|p| p.vanity_uses)
            }
        };

        Ok(Self::new(invites, vanity_uses))
    }

    /// Returns the single invite whose use count strictly increased in `live`.
    ///
    /// A code missing from `self` counts as increased when it has been used.
    /// Two or more increased codes are ambiguous and yield `None`.
    pub fn diff(&self, live: &InviteSnapshot) -> Option<UsedInvite> {
        let mut increased = live.invites.values().filter(|current| {
            let previous = self.invites.get(&current.code).map_or(0, |p| p.uses);
            current.uses > previous
        });

        let used = increased.next()?;
        if increased.next().is_some() {
            return None;
        }

        let cached = self.invites.get(&used.code);
        Some(UsedInvite {
            code: used.code.clone(),
            inviter_id: cached.and_then(|c| c.inviter_id).or(used.inviter_id),
            inviter_name: cached
                .and_then(|c| c.inviter_name.clone())
                .or_else(|| used.inviter_name.clone()),
        })
    }

    /// Whether the vanity counter moved up between `self` and `live`.
    pub fn vanity_increased(&self, live: &InviteSnapshot) -> bool {
        match (self.vanity_uses, live.vanity_uses) {
            (Some(previous), Some(current)) => current > previous,
            _ => false,
        }
    }

    fn without_code(&self, code: &str) -> Self {
        let mut next = self.clone();
        next.invites.remove(code);
        next
    }
}

/// Per-guild invite snapshots.
///
/// Snapshots are immutable once stored; every update builds a complete new
/// snapshot and swaps the `Arc`, so readers never observe a partial refresh.
#[derive(Default)]
pub struct InviteSnapshotCache {
    snapshots: DashMap<serenity::GuildId, Arc<InviteSnapshot>>,
}

impl InviteSnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guild_id: serenity::GuildId) -> Option<Arc<InviteSnapshot>> {
        self.snapshots.get(&guild_id).map(|s| s.value().clone())
    }

    /// Stores `snapshot` for the guild and returns the one it replaced.
    pub fn replace(
        &self,
        guild_id: serenity::GuildId,
        snapshot: InviteSnapshot,
    ) -> Option<Arc<InviteSnapshot>> {
        self.snapshots.insert(guild_id, Arc::new(snapshot))
    }

    /// Fetches and stores a fresh snapshot. On failure the cached one stays.
    pub async fn refresh(
        &self,
        platform: &dyn Platform,
        guild_id: serenity::GuildId,
    ) -> Result<Arc<InviteSnapshot>, Error> {
        let previous = self.get(guild_id);
        let snapshot = Arc::new(InviteSnapshot::fetch(platform, guild_id, previous.as_deref()).await?);
        debug!(
            "Refreshed {} invites for guild {}",
            snapshot.invites.len(),
            guild_id
        );
        self.snapshots.insert(guild_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Compares `live` against the cached snapshot of the guild.
    pub fn diff(&self, guild_id: serenity::GuildId, live: &InviteSnapshot) -> Option<UsedInvite> {
        self.get(guild_id)?.diff(live)
    }

    /// Drops a deleted invite code from the cached snapshot.
    pub fn remove_code(&self, guild_id: serenity::GuildId, code: &str) {
        if let Some(mut entry) = self.snapshots.get_mut(&guild_id) {
            let next = entry.without_code(code);
            *entry = Arc::new(next);
        }
    }

    pub fn forget(&self, guild_id: serenity::GuildId) {
        self.snapshots.remove(&guild_id);
    }

    pub fn guilds(&self) -> Vec<serenity::GuildId> {
        self.snapshots.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::invite_tracker::testing::{invite, FakePlatform};

    fn snapshot(invites: &[(&str, u64, u64)]) -> InviteSnapshot {
        InviteSnapshot::new(
            invites
                .iter()
                .map(|(code, uses, inviter)| invite(code, *uses, *inviter))
                .collect(),
            None,
        )
    }

    #[test]
    fn diff_finds_single_incremented_code() {
        let cached = snapshot(&[("abc", 4, 10), ("def", 1, 11)]);
        let live = snapshot(&[("abc", 5, 10), ("def", 1, 11)]);

        let used = cached.diff(&live).expect("one code increased");
        assert_eq!(used.code, "abc");
        assert_eq!(used.inviter_id, Some(serenity::UserId::new(10)));
    }

    #[test]
    fn diff_is_ambiguous_when_two_codes_increased() {
        let cached = snapshot(&[("abc", 4, 10), ("def", 1, 11)]);
        let live = snapshot(&[("abc", 5, 10), ("def", 2, 11)]);

        assert_eq!(cached.diff(&live), None);
    }

    #[test]
    fn diff_counts_used_codes_created_since_last_snapshot() {
        let cached = snapshot(&[("abc", 4, 10)]);
        let live = snapshot(&[("abc", 4, 10), ("new", 1, 12)]);

        let used = cached.diff(&live).expect("new code was used");
        assert_eq!(used.code, "new");
        assert_eq!(used.inviter_id, Some(serenity::UserId::new(12)));
    }

    #[test]
    fn diff_ignores_unchanged_or_decreased_counts() {
        let cached = snapshot(&[("abc", 4, 10)]);
        let live = snapshot(&[("abc", 3, 10), ("fresh", 0, 12)]);

        assert_eq!(cached.diff(&live), None);
    }

    #[test]
    fn vanity_increase_needs_both_counters() {
        let before = InviteSnapshot::new(vec![], Some(7));
        let after = InviteSnapshot::new(vec![], Some(8));
        let without = InviteSnapshot::new(vec![], None);

        assert!(before.vanity_increased(&after));
        assert!(!after.vanity_increased(&before));
        assert!(!without.vanity_increased(&after));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_cached_snapshot() {
        let guild = serenity::GuildId::new(1);
        let platform = FakePlatform::new();
        platform.set_invites(vec![invite("abc", 2, 10)]);

        let cache = InviteSnapshotCache::new();
        cache.refresh(&platform, guild).await.expect("refresh");

        platform.fail_invites(true);
        platform.set_invites(vec![invite("abc", 9, 10)]);
        assert!(cache.refresh(&platform, guild).await.is_err());

        let cached = cache.get(guild).expect("snapshot kept");
        assert_eq!(cached.invites["abc"].uses, 2);
    }

    #[tokio::test]
    async fn failed_vanity_lookup_keeps_the_vanity_baseline() {
        let guild = serenity::GuildId::new(1);
        let platform = FakePlatform::new();
        platform.set_vanity(Some(40));

        let cache = InviteSnapshotCache::new();
        cache.refresh(&platform, guild).await.expect("refresh");

        platform.fail_vanity(true);
        let refreshed = cache.refresh(&platform, guild).await.expect("invites still load");
        assert_eq!(refreshed.vanity_uses, Some(40));

        platform.fail_vanity(false);
        platform.set_vanity(Some(41));
        let live = InviteSnapshot::fetch(&platform, guild, None).await.expect("fetch");
        assert!(cache.get(guild).expect("cached").vanity_increased(&live));
    }

    #[test]
    fn cache_diff_needs_a_cached_snapshot() {
        let guild = serenity::GuildId::new(1);
        let cache = InviteSnapshotCache::new();
        let live = snapshot(&[("abc", 5, 10)]);

        assert_eq!(cache.diff(guild, &live), None);

        cache.replace(guild, snapshot(&[("abc", 4, 10)]));
        assert_eq!(cache.diff(guild, &live).map(|used| used.code), Some("abc".to_string()));
    }

    #[test]
    fn remove_code_swaps_in_a_new_snapshot() {
        let guild = serenity::GuildId::new(1);
        let cache = InviteSnapshotCache::new();
        cache.replace(guild, snapshot(&[("abc", 1, 10), ("def", 1, 11)]));

        let before = cache.get(guild).expect("snapshot");
        cache.remove_code(guild, "abc");
        let after = cache.get(guild).expect("snapshot");

        assert!(before.invites.contains_key("abc"));
        assert!(!after.invites.contains_key("abc"));
        assert!(after.invites.contains_key("def"));
    }
}
