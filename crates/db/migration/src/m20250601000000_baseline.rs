use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(Invitations::Table)
                    .col(pk_id_col(manager, Invitations::Id))
                    .col(uuid_col(Invitations::Uuid))
                    .col(uuid_col(Invitations::TemplateId))
                    .col(uuid_col(Invitations::CandidateId))
                    .col(ColumnDef::new(Invitations::CompanyName).string().not_null())
                    .col(uuid_col(Invitations::InvitedBy))
                    .col(
                        ColumnDef::new(Invitations::Status)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(ColumnDef::new(Invitations::ExpiresAt).timestamp().not_null())
                    .col(ColumnDef::new(Invitations::TotalQuestions).integer().not_null())
                    .col(
                        ColumnDef::new(Invitations::AllowPause)
                            .boolean()
                            .not_null()
                            .default(Expr::val(false)),
                    )
                    .col(
                        ColumnDef::new(Invitations::ShowTimer)
                            .boolean()
                            .not_null()
                            .default(Expr::val(true)),
                    )
                    .col(ColumnDef::new(Invitations::StartedAt).timestamp())
                    .col(ColumnDef::new(Invitations::CompletedAt).timestamp())
                    .col(ColumnDef::new(Invitations::LastActivityAt).timestamp())
                    .col(ColumnDef::new(Invitations::CompletionReason).string_len(32))
                    .col(timestamp_col(Invitations::CreatedAt))
                    .col(timestamp_col(Invitations::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitations_uuid")
                    .table(Invitations::Table)
                    .col(Invitations::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitations_candidate_id")
                    .table(Invitations::Table)
                    .col(Invitations::CandidateId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitations_status_expires_at")
                    .table(Invitations::Table)
                    .col(Invitations::Status)
                    .col(Invitations::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(InvitationResponses::Table)
                    .col(pk_id_col(manager, InvitationResponses::Id))
                    .col(uuid_col(InvitationResponses::Uuid))
                    .col(fk_id_col(manager, InvitationResponses::InvitationId))
                    .col(uuid_col(InvitationResponses::QuestionId))
                    .col(
                        ColumnDef::new(InvitationResponses::QuestionIndex)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InvitationResponses::QuestionText)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InvitationResponses::Kind)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(ColumnDef::new(InvitationResponses::TextAnswer).text())
                    .col(ColumnDef::new(InvitationResponses::CodeAnswer).text())
                    .col(ColumnDef::new(InvitationResponses::VideoUrl).string())
                    .col(
                        ColumnDef::new(InvitationResponses::DurationSeconds)
                            .integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(timestamp_col(InvitationResponses::SubmittedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_invitation_responses_invitation_id")
                            .from(InvitationResponses::Table, InvitationResponses::InvitationId)
                            .to(Invitations::Table, Invitations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitation_responses_uuid")
                    .table(InvitationResponses::Table)
                    .col(InvitationResponses::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitation_responses_invitation_id")
                    .table(InvitationResponses::Table)
                    .col(InvitationResponses::InvitationId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_invitation_responses_unique")
                    .table(InvitationResponses::Table)
                    .col(InvitationResponses::InvitationId)
                    .col(InvitationResponses::QuestionId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create().if_not_exists()
                    .table(EventOutbox::Table)
                    .col(pk_id_col(manager, EventOutbox::Id))
                    .col(uuid_col(EventOutbox::EventId))
                    .col(uuid_col(EventOutbox::AggregateId))
                    .col(
                        ColumnDef::new(EventOutbox::EventType)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventOutbox::Payload).json().not_null())
                    .col(
                        ColumnDef::new(EventOutbox::Status)
                            .string_len(16)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(
                        ColumnDef::new(EventOutbox::RetryCount)
                            .integer()
                            .not_null()
                            .default(Expr::val(0)),
                    )
                    .col(ColumnDef::new(EventOutbox::ErrorMessage).text())
                    .col(timestamp_col(EventOutbox::CreatedAt))
                    .col(timestamp_col(EventOutbox::UpdatedAt))
                    .col(ColumnDef::new(EventOutbox::PublishedAt).timestamp())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_event_outbox_event_id")
                    .table(EventOutbox::Table)
                    .col(EventOutbox::EventId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_event_outbox_status_created_at")
                    .table(EventOutbox::Table)
                    .col(EventOutbox::Status)
                    .col(EventOutbox::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create().if_not_exists()
                    .name("idx_event_outbox_aggregate_id")
                    .table(EventOutbox::Table)
                    .col(EventOutbox::AggregateId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EventOutbox::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InvitationResponses::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Invitations::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn fk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().to_owned()
}

fn uuid_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn timestamp_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum Invitations {
    Table,
    Id,
    Uuid,
    TemplateId,
    CandidateId,
    CompanyName,
    InvitedBy,
    Status,
    ExpiresAt,
    TotalQuestions,
    AllowPause,
    ShowTimer,
    StartedAt,
    CompletedAt,
    LastActivityAt,
    CompletionReason,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum InvitationResponses {
    Table,
    Id,
    Uuid,
    InvitationId,
    QuestionId,
    QuestionIndex,
    QuestionText,
    Kind,
    TextAnswer,
    CodeAnswer,
    VideoUrl,
    DurationSeconds,
    SubmittedAt,
}

#[derive(Iden)]
enum EventOutbox {
    Table,
    Id,
    EventId,
    AggregateId,
    EventType,
    Payload,
    Status,
    RetryCount,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
    PublishedAt,
}
