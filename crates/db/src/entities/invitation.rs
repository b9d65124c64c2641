use sea_orm::entity::prelude::*;

use crate::types::{CompletionReason, InvitationStatus};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "invitations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub template_id: Uuid,
    pub candidate_id: Uuid,
    pub company_name: String,
    pub invited_by: Uuid,
    pub status: InvitationStatus,
    pub expires_at: DateTimeUtc,
    pub total_questions: i32,
    pub allow_pause: bool,
    pub show_timer: bool,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
    pub last_activity_at: Option<DateTimeUtc>,
    pub completion_reason: Option<CompletionReason>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
