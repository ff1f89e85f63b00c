use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(InviteUsers::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InviteUsers::GuildId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::UserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::Username)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(InviteUsers::DisplayName).string_len(64))
                    .col(ColumnDef::new(InviteUsers::AccountCreatedAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(InviteUsers::Joins)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::Bonus)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::Leaves)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::Fake)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::Total)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteUsers::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(InviteUsers::GuildId)
                            .col(InviteUsers::UserId),
                    )
                    .to_owned(),
            )
            .await?;

        // Leaderboard ordering
        manager
            .create_index(
                Index::create()
                    .name("idx-invite-users-guild-total")
                    .table(InviteUsers::Table)
                    .col(InviteUsers::GuildId)
                    .col((InviteUsers::Total, IndexOrder::Desc))
                    .col((InviteUsers::Joins, IndexOrder::Desc))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InviteJoins::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InviteJoins::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InviteJoins::GuildId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InviteJoins::InviterId).big_integer())
                    .col(
                        ColumnDef::new(InviteJoins::InvitedUserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteJoins::InvitedUsername)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InviteJoins::Source)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(ColumnDef::new(InviteJoins::InviteCode).string_len(32))
                    .col(
                        ColumnDef::new(InviteJoins::IsValid)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(InviteJoins::IsLeft)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(InviteJoins::LeftAt).timestamp_with_time_zone())
                    .col(
                        ColumnDef::new(InviteJoins::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // Active-record lookups on join, leave and backfill
        manager
            .create_index(
                Index::create()
                    .name("idx-invite-joins-guild-invited-left")
                    .table(InviteJoins::Table)
                    .col(InviteJoins::GuildId)
                    .col(InviteJoins::InvitedUserId)
                    .col(InviteJoins::IsLeft)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-invite-joins-guild-inviter")
                    .table(InviteJoins::Table)
                    .col(InviteJoins::GuildId)
                    .col(InviteJoins::InviterId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(InviteJoins::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(InviteUsers::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum InviteUsers {
    Table,
    GuildId,
    UserId,
    Username,
    DisplayName,
    AccountCreatedAt,
    Joins,
    Bonus,
    Leaves,
    Fake,
    Total,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum InviteJoins {
    Table,
    Id,
    GuildId,
    InviterId,
    InvitedUserId,
    InvitedUsername,
    Source,
    InviteCode,
    IsValid,
    IsLeft,
    LeftAt,
    CreatedAt,
}
