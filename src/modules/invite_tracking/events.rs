use crate::services::invite_tracker::platform::UserProfile;
use crate::services::invite_tracker::worker::GuildEvent;
use crate::{Data, Error};
use poise::serenity_prelude as serenity;

pub fn handler<'a>(
    ctx: &'a serenity::Context,
    event: &'a serenity::FullEvent,
    data: &'a Data,
) -> poise::BoxFuture<'a, Result<(), Error>> {
    Box::pin(async move { handle_event(ctx, event, data).await })
}

async fn handle_event(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::GuildCreate { guild, .. } => {
            data.invites.enqueue(guild.id, GuildEvent::Prime);
        }
        serenity::FullEvent::GuildDelete { incomplete, .. } => {
            // Outages also delete guilds; only forget the ones we were removed from.
            if !incomplete.unavailable {
                data.invites.on_guild_removed(incomplete.id);
            }
        }
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            tracing::debug!("Member joined: {} in guild {}", new_member.user.id, new_member.guild_id);
            data.invites.enqueue(
                new_member.guild_id,
                GuildEvent::MemberJoined(UserProfile::from_member(new_member)),
            );
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            tracing::debug!("Member left: {} from guild {}", user.id, guild_id);
            data.invites.enqueue(*guild_id, GuildEvent::MemberLeft(user.id));
        }
        serenity::FullEvent::InviteCreate { data: invite } => {
            let Some(guild_id) = invite.guild_id else {
                tracing::warn!("Invite created without guild_id");
                return Ok(());
            };

            tracing::info!("Invite created: {} in guild {}", invite.code, guild_id);
            data.invites.enqueue(guild_id, GuildEvent::RefreshInvites);
        }
        serenity::FullEvent::InviteDelete { data: invite } => {
            let Some(guild_id) = invite.guild_id else {
                tracing::warn!("Invite deleted without guild_id");
                return Ok(());
            };

            tracing::info!("Invite deleted: {} in guild {}", invite.code, guild_id);
            data.invites
                .enqueue(guild_id, GuildEvent::InviteDeleted(invite.code.clone()));
        }
        _ => {}
    }

    Ok(())
}
