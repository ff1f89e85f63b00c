use anyhow::Context as _;
use clap::Parser as _;
use dotenvy::dotenv;
use poise::serenity_prelude as serenity;
use services::invite_tracker::discord::SerenityPlatform;
use services::invite_tracker::{InviteTrackerService, TrackerSettings};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod db;
mod modules;
mod services;

#[derive(clap::Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Publish commands. If no guild ID is provided, publish globally.
    #[arg(long, num_args = 0..)]
    publish: Option<Vec<u64>>,

    /// Clear all commands instead of publishing them.
    #[arg(long)]
    clear: bool,

    /// Rollback the specified number of migrations and run all migrations again.
    #[arg(long, num_args = 0..=1, default_missing_value = "1")]
    refresh_migrations: Option<u32>,

    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[arg(long, env = "DISCORD_TOKEN", hide_env_values = true)]
    discord_token: String,

    /// Seconds between invite snapshot refreshes.
    #[arg(long, env = "INVITE_REFRESH_SECS", default_value_t = 300)]
    invite_refresh_secs: u64,

    /// Seconds a processed join is remembered to drop duplicate deliveries.
    #[arg(long, env = "JOIN_GUARD_RELEASE_SECS", default_value_t = 5)]
    join_guard_release_secs: u64,

    /// How old an audit-log entry may be to explain a join, in seconds.
    #[arg(long, env = "AUDIT_WINDOW_SECS", default_value_t = 10)]
    audit_window_secs: u64,

    #[arg(long, env = "AUDIT_TIMEOUT_SECS", default_value_t = 3)]
    audit_timeout_secs: u64,
}

impl Args {
    fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            refresh_interval: Duration::from_secs(self.invite_refresh_secs),
            join_guard_release: Duration::from_secs(self.join_guard_release_secs),
            audit_window: Duration::from_secs(self.audit_window_secs),
            audit_timeout: Duration::from_secs(self.audit_timeout_secs),
        }
    }
}

// Custom user data passed to all command functions
pub struct Data {
    pub invites: Arc<InviteTrackerService>,
    pub events: services::event_manager::Handler,
}

pub type Error = anyhow::Error;
pub type Context<'a> = poise::Context<'a, Data, Error>;

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!("Command {} failed: {:?}", ctx.command().name, error);
            let reply = poise::CreateReply::default()
                .content("Something went wrong. Please try again later.")
                .ephemeral(true);
            if let Err(e) = ctx.send(reply).await {
                error!("Failed to report command error: {:?}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error while handling error: {:?}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting invite tracker...");

    // Establish database connection
    let db = db::establish_connection(&args.database_url)
        .await
        .context("Failed to connect to database")?;

    // Run migrations
    use sea_orm_migration::MigratorTrait;
    if let Some(depth) = args.refresh_migrations {
        info!("Refreshing migrations (down {}, then up)...", depth);
        db::migrations::Migrator::down(&db, Some(depth))
            .await
            .context("Failed to rollback migration")?;
    }

    db::migrations::Migrator::up(&db, None)
        .await
        .context("Failed to run migrations")?;

    if args.refresh_migrations.is_some() {
        info!("Migrations refreshed successfully.");
        std::process::exit(0);
    }

    let settings = args.tracker_settings();
    let token = args.discord_token.clone();
    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;

    let commands = modules::commands();

    // Handle command registration if requested
    if let Some(publish_args) = args.publish {
        let http = serenity::Http::new(&token);
        let application = http
            .get_current_application_info()
            .await
            .context("Failed to fetch application info")?;

        info!("Fetched Application ID: {}", application.id);
        http.set_application_id(application.id);

        let empty_commands = vec![];
        let commands = if args.clear { &empty_commands } else { &commands };

        if publish_args.is_empty() {
            if args.clear {
                info!("Clearing commands globally...");
            } else {
                info!("Registering commands globally...");
            }

            if let Err(e) = poise::builtins::register_globally(&http, commands).await {
                error!("Failed to register commands globally: {}", e);
            } else {
                info!("Global command operation successful");
            }
        } else {
            for guild_id in publish_args {
                if args.clear {
                    info!("Clearing commands in guild {}...", guild_id);
                } else {
                    info!("Registering commands in guild {}...", guild_id);
                }

                if let Err(e) = poise::builtins::register_in_guild(
                    &http,
                    commands,
                    serenity::GuildId::new(guild_id),
                )
                .await
                {
                    error!("Failed to register commands in guild {}: {}", guild_id, e);
                } else {
                    info!("Guild command operation successful for guild {}", guild_id);
                }
            }
        }
        std::process::exit(0);
    }

    let framework_options = poise::FrameworkOptions {
        commands,
        on_error: |error| Box::pin(on_error(error)),
        event_handler: |ctx, event, _framework, data| Box::pin(data.events.dispatch(ctx, event, data)),
        ..Default::default()
    };

    // Create the poise framework
    let framework = poise::Framework::builder()
        .options(framework_options)
        .setup(move |ctx, ready, _framework| {
            Box::pin(async move {
                info!("Setting up invite tracking for {} guilds", ready.guilds.len());

                let platform = Arc::new(SerenityPlatform::new(ctx.http.clone()));
                let invites = Arc::new(InviteTrackerService::new(db, platform, settings));

                // Start invite snapshot refresh runner
                invites.start_refresh_runner();

                Ok(Data {
                    invites,
                    events: services::event_manager::Handler::new(),
                })
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await
        .context("Failed to create client")?;

    info!("Bot is ready!");
    client.start_autosharded().await.context("Client error")?;

    Ok(())
}
