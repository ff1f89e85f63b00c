pub mod guild_configs;
pub mod invite_joins;
pub mod invite_rewards;
pub mod invite_users;
