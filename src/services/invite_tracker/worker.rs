//! One queue per guild so membership events of a guild are handled in the
//! order they were received, while different guilds run concurrently.

use super::platform::UserProfile;
use super::InviteTrackerService;
use poise::serenity_prelude as serenity;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub enum GuildEvent {
    /// Load invites and backfill the guild.
    Prime,
    MemberJoined(UserProfile),
    MemberLeft(serenity::UserId),
    /// Re-read the guild's invites, after a create or on the refresh cadence.
    RefreshInvites,
    InviteDeleted(String),
}

impl InviteTrackerService {
    /// Queues an event on the guild's worker, starting one if needed.
    pub fn enqueue(self: &Arc<Self>, guild_id: serenity::GuildId, event: GuildEvent) {
        let sender = self
            .workers
            .entry(guild_id)
            .or_insert_with(|| self.spawn_worker(guild_id))
            .clone();

        if let Err(mpsc::error::SendError(event)) = sender.send(event) {
            debug!("Worker for guild {} is gone, restarting it", guild_id);
            let sender = self.spawn_worker(guild_id);
            self.workers.insert(guild_id, sender.clone());
            if sender.send(event).is_err() {
                error!("Failed to queue event for guild {}", guild_id);
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, guild_id: serenity::GuildId) -> mpsc::UnboundedSender<GuildEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(service) = service.upgrade() else {
                    break;
                };
                service.handle_guild_event(guild_id, event).await;
            }
            debug!("Worker for guild {} stopped", guild_id);
        });

        tx
    }

    async fn handle_guild_event(&self, guild_id: serenity::GuildId, event: GuildEvent) {
        match event {
            GuildEvent::Prime => match self.prime_guild(guild_id).await {
                Ok(Some(report)) => info!(
                    "Primed guild {}: {} members scanned, {} backfilled",
                    guild_id, report.scanned, report.created
                ),
                Ok(None) => {}
                Err(e) => error!("Failed to prime guild {}: {:?}", guild_id, e),
            },
            GuildEvent::MemberJoined(member) => {
                if let Err(e) = self.on_member_join(guild_id, &member).await {
                    error!(
                        "Failed to process join of {} in guild {}: {:?}",
                        member.user_id, guild_id, e
                    );
                }
            }
            GuildEvent::MemberLeft(user_id) => {
                if let Err(e) = self.on_member_leave(guild_id, user_id).await {
                    error!(
                        "Failed to process leave of {} in guild {}: {:?}",
                        user_id, guild_id, e
                    );
                }
            }
            GuildEvent::RefreshInvites => self.refresh_invites(guild_id).await,
            GuildEvent::InviteDeleted(code) => self.on_invite_deleted(guild_id, &code),
        }
    }
}
