use sea_orm::entity::prelude::*;

/// Per-community invite ledger row. `total` is always derived from the four
/// counters and rewritten together with them.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "invite_users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub guild_id: i64,
    #[sea_orm(primary_key, auto_increment = false)]
    pub user_id: i64,
    pub username: String,
    pub display_name: Option<String>,
    pub account_created_at: Option<DateTimeWithTimeZone>,
    pub joins: i32,
    pub bonus: i32,
    pub leaves: i32,
    pub fake: i32,
    pub total: i32,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
