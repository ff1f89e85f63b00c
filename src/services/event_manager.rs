use crate::modules::EventHandler;
use crate::{Data, Error};
use poise::serenity_prelude as serenity;
use tracing::{error, info};

/// Routes gateway events to the event handlers of every module.
pub struct Handler {
    handlers: Vec<(&'static str, EventHandler)>,
}

impl Handler {
    pub fn new() -> Self {
        let handlers = crate::modules::get_modules()
            .into_iter()
            .flat_map(|module| {
                let module_id = module.definition.id;
                module
                    .event_handlers
                    .into_iter()
                    .map(move |handler| (module_id, handler))
            })
            .collect();

        Self { handlers }
    }

    /// Module handlers run one after another so that events of a guild are
    /// handed to the modules in the order the gateway delivered them.
    pub async fn dispatch(
        &self,
        ctx: &serenity::Context,
        event: &serenity::FullEvent,
        data: &Data,
    ) -> Result<(), Error> {
        match event {
            serenity::FullEvent::Ready { data_about_bot } => {
                info!("Logged in as {}", data_about_bot.user.name);
            }
            serenity::FullEvent::GuildCreate { guild, is_new } => {
                if is_new.unwrap_or(false) {
                    info!("Joined new guild: {} ({})", guild.name, guild.id);
                }
            }
            serenity::FullEvent::GuildDelete { incomplete, .. } => {
                if !incomplete.unavailable {
                    info!("Left guild: {}", incomplete.id);
                }
            }
            _ => {}
        }

        for (module_id, handler) in &self.handlers {
            if let Err(e) = handler(ctx, event, data).await {
                error!("Error in event handler for module {}: {:?}", module_id, e);
            }
        }

        Ok(())
    }
}
