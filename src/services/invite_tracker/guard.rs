use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;

type GuardKey = (serenity::GuildId, serenity::UserId);

enum GuardState {
    InFlight,
    Cooling(AbortHandle),
}

/// Suppresses re-entrant processing of the same member join.
///
/// A key is held while its join is processed and for `release_after` once
/// the ticket is dropped, which absorbs duplicate gateway deliveries.
#[derive(Clone)]
pub struct JoinGuard {
    entries: Arc<DashMap<GuardKey, GuardState>>,
    release_after: Duration,
}

/// Held while a join is being processed. Dropping it schedules the release.
pub struct JoinGuardTicket {
    guard: JoinGuard,
    key: GuardKey,
}

impl JoinGuard {
    pub fn new(release_after: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            release_after,
        }
    }

    /// Returns `None` when the same join is already in flight or cooling down.
    pub fn try_acquire(
        &self,
        guild_id: serenity::GuildId,
        user_id: serenity::UserId,
    ) -> Option<JoinGuardTicket> {
        let key = (guild_id, user_id);
        match self.entries.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(GuardState::InFlight);
                Some(JoinGuardTicket {
                    guard: self.clone(),
                    key,
                })
            }
        }
    }

    #[cfg(test)]
    pub fn is_held(&self, guild_id: serenity::GuildId, user_id: serenity::UserId) -> bool {
        self.entries.contains_key(&(guild_id, user_id))
    }

    /// Drops every entry of a guild and cancels their pending releases.
    pub fn release_guild(&self, guild_id: serenity::GuildId) {
        self.entries.retain(|(guild, _), state| {
            if *guild != guild_id {
                return true;
            }
            if let GuardState::Cooling(handle) = state {
                handle.abort();
            }
            false
        });
    }

    fn schedule_release(&self, key: GuardKey) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.entries.remove(&key);
            return;
        };

        // The shard lock is held until the state is set, so the release task
        // cannot remove the entry before it is marked as cooling.
        if let Some(mut state) = self.entries.get_mut(&key) {
            let entries = self.entries.clone();
            let delay = self.release_after;
            let task = runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                entries.remove(&key);
            });
            *state = GuardState::Cooling(task.abort_handle());
        }
    }
}

impl Drop for JoinGuardTicket {
    fn drop(&mut self) {
        self.guard.schedule_release(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (serenity::GuildId, serenity::UserId) {
        (serenity::GuildId::new(1), serenity::UserId::new(2))
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_join_is_suppressed_while_in_flight() {
        let guard = JoinGuard::new(Duration::from_secs(5));
        let (guild, user) = ids();

        let ticket = guard.try_acquire(guild, user).expect("first acquire");
        assert!(guard.try_acquire(guild, user).is_none());

        // Other members of the same guild are unaffected.
        assert!(guard.try_acquire(guild, serenity::UserId::new(3)).is_some());

        drop(ticket);
    }

    #[tokio::test(start_paused = true)]
    async fn guard_is_released_after_cooldown() {
        let guard = JoinGuard::new(Duration::from_secs(5));
        let (guild, user) = ids();

        drop(guard.try_acquire(guild, user).expect("first acquire"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(guard.try_acquire(guild, user).is_none());

        tokio::time::sleep(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!guard.is_held(guild, user));
        assert!(guard.try_acquire(guild, user).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn releasing_a_guild_cancels_its_pending_releases() {
        let guard = JoinGuard::new(Duration::from_secs(5));
        let (guild, user) = ids();
        let other_guild = serenity::GuildId::new(9);

        drop(guard.try_acquire(guild, user).expect("first acquire"));
        drop(guard.try_acquire(other_guild, user).expect("other guild"));
        assert!(guard.is_held(guild, user));

        guard.release_guild(guild);
        assert!(!guard.is_held(guild, user));
        assert!(guard.is_held(other_guild, user));

        let ticket = guard.try_acquire(guild, user).expect("reacquire");
        tokio::time::sleep(Duration::from_secs(10)).await;
        // The aborted release must not have removed the fresh entry.
        assert!(guard.is_held(guild, user));
        drop(ticket);
    }
}
