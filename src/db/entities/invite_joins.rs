use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// How a join was attributed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum JoinSource {
    #[sea_orm(string_value = "invite_diff")]
    InviteDiff,
    #[sea_orm(string_value = "vanity")]
    Vanity,
    #[sea_orm(string_value = "audit_log")]
    AuditLog,
    #[sea_orm(string_value = "backfill")]
    Backfill,
    #[sea_orm(string_value = "unknown")]
    Unknown,
    #[sea_orm(string_value = "manual")]
    Manual,
}

impl std::fmt::Display for JoinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinSource::InviteDiff => write!(f, "invite_diff"),
            JoinSource::Vanity => write!(f, "vanity"),
            JoinSource::AuditLog => write!(f, "audit_log"),
            JoinSource::Backfill => write!(f, "backfill"),
            JoinSource::Unknown => write!(f, "unknown"),
            JoinSource::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "invite_joins")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub guild_id: i64,
    pub inviter_id: Option<i64>,
    pub invited_user_id: i64,
    pub invited_username: String,
    pub source: JoinSource,
    pub invite_code: Option<String>,
    pub is_valid: bool,
    pub is_left: bool,
    pub left_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
