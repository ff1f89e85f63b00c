use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InviteRewards::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InviteRewards::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InviteRewards::GuildId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteRewards::RequiredInvites)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteRewards::RoleId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteRewards::RoleName)
                            .string_len(100)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteRewards::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One tier per role, upserted by the admin command
        manager
            .create_index(
                Index::create()
                    .name("idx-invite-rewards-guild-role")
                    .table(InviteRewards::Table)
                    .col(InviteRewards::GuildId)
                    .col(InviteRewards::RoleId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InviteRewards::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum InviteRewards {
    Table,
    Id,
    GuildId,
    RequiredInvites,
    RoleId,
    RoleName,
    CreatedAt,
}
