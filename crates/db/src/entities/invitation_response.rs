use sea_orm::entity::prelude::*;

use crate::types::ResponseKind;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "invitation_responses")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub uuid: Uuid,
    pub invitation_id: i64,
    pub question_id: Uuid,
    pub question_index: i32,
    pub question_text: String,
    pub kind: ResponseKind,
    pub text_answer: Option<String>,
    pub code_answer: Option<String>,
    pub video_url: Option<String>,
    pub duration_seconds: i32,
    pub submitted_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
