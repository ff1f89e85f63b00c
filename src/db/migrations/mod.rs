pub mod m000001_create_guild_table;
pub mod m000002_create_invite_ledger;
pub mod m000003_create_invite_rewards;

use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m000001_create_guild_table::Migration),
            Box::new(m000002_create_invite_ledger::Migration),
            Box::new(m000003_create_invite_rewards::Migration),
        ]
    }
}
