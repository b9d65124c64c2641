use std::time::Duration;

use chrono::Utc;
use db::{
    DBService, DbErr, TransactionTrait,
    models::invitation::{CreateInvitation, ErrorKind, Invitation, InvitationError, SubmitResponse},
    types::CompletionReason,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::services::outbox::{OutboxWriteError, OutboxWriter};

#[derive(Debug, Error)]
pub enum InvitationServiceError {
    #[error(transparent)]
    Domain(#[from] InvitationError),
    #[error("invitation {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error(transparent)]
    Outbox(#[from] OutboxWriteError),
}

impl InvitationServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(err) => err.kind(),
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Database(_) | Self::Outbox(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Application service for invitation commands. Every command follows the
/// same protocol: load the aggregate, apply the domain method, persist the
/// aggregate and its drained events in one transaction, then offer
/// delivery jobs for the committed rows.
///
/// The domain outcome is checked after persistence on purpose: a command
/// the aggregate rejects can still have flipped it to `expired` on the way
/// in, and that flip and its event must reach the database even though the
/// caller gets an error.
#[derive(Clone)]
pub struct InvitationService {
    db: DBService,
    writer: OutboxWriter,
}

impl InvitationService {
    pub fn new(db: DBService, writer: OutboxWriter) -> Self {
        Self { db, writer }
    }

    pub async fn create(
        &self,
        data: CreateInvitation,
    ) -> Result<Invitation, InvitationServiceError> {
        let mut invitation = Invitation::create(data)?;
        let events = invitation.drain_events();

        let tx = self.db.pool.begin().await?;
        Invitation::insert(&tx, &invitation).await?;
        let rows = self.writer.record_in_tx(&tx, &events).await?;
        tx.commit().await?;

        self.writer.schedule_publishing(&rows);
        Ok(invitation)
    }

    pub async fn get(&self, id: Uuid) -> Result<Invitation, InvitationServiceError> {
        Invitation::find_by_uuid(&self.db.pool, id)
            .await?
            .ok_or(InvitationServiceError::NotFound(id))
    }

    pub async fn start(
        &self,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Invitation, InvitationServiceError> {
        let mut invitation = self.get(id).await?;
        let outcome = invitation.start(user_id);
        self.persist_changes(&mut invitation).await?;
        outcome?;
        Ok(invitation)
    }

    pub async fn submit_response(
        &self,
        id: Uuid,
        user_id: Uuid,
        data: SubmitResponse,
    ) -> Result<Invitation, InvitationServiceError> {
        let mut invitation = self.get(id).await?;
        let outcome = invitation.submit_response(user_id, data);
        self.persist_changes(&mut invitation).await?;
        outcome?;
        Ok(invitation)
    }

    /// `user_id` is the candidate for manual completion and `None` for
    /// system-initiated completion.
    pub async fn complete(
        &self,
        id: Uuid,
        user_id: Option<Uuid>,
        reason: CompletionReason,
    ) -> Result<Invitation, InvitationServiceError> {
        let mut invitation = self.get(id).await?;
        let outcome = invitation.complete(user_id, reason);
        self.persist_changes(&mut invitation).await?;
        outcome?;
        Ok(invitation)
    }

    /// Candidate session heartbeat. Raises no event, so it writes directly
    /// instead of going through the outbox protocol.
    pub async fn heartbeat(&self, id: Uuid, user_id: Uuid) -> Result<(), InvitationServiceError> {
        let mut invitation = self.get(id).await?;
        if user_id != invitation.candidate_id {
            return Err(InvitationError::AccessDenied.into());
        }
        invitation.touch_activity();
        Invitation::save(&self.db.pool, &invitation).await?;
        Ok(())
    }

    /// One pass of the expiry sweep: flips overdue non-terminal invitations
    /// to `expired` and records their expiry events.
    pub async fn expire_overdue(&self, limit: u64) -> Result<usize, InvitationServiceError> {
        let overdue = Invitation::find_overdue(&self.db.pool, Utc::now(), limit).await?;
        let mut expired = 0;
        for id in overdue {
            // The row can finish or expire between the id query and here.
            let Some(mut invitation) = Invitation::find_by_uuid(&self.db.pool, id).await? else {
                continue;
            };
            if !invitation.mark_expired() {
                continue;
            }
            self.persist_changes(&mut invitation).await?;
            expired += 1;
        }
        Ok(expired)
    }

    pub fn spawn_expiry_sweep(&self, interval: Duration, batch: u64) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                match service.expire_overdue(batch).await {
                    Ok(0) => {}
                    Ok(expired) => tracing::info!(expired, "expired overdue invitations"),
                    Err(err) => tracing::error!(error = %err, "expiry sweep failed"),
                }
                tokio::time::sleep(interval).await;
            }
        })
    }

    async fn persist_changes(
        &self,
        invitation: &mut Invitation,
    ) -> Result<(), InvitationServiceError> {
        if !invitation.has_uncommitted_events() {
            return Ok(());
        }
        let events = invitation.drain_events();

        let tx = self.db.pool.begin().await?;
        Invitation::save(&tx, invitation).await?;
        let rows = self.writer.record_in_tx(&tx, &events).await?;
        tx.commit().await?;

        self.writer.schedule_publishing(&rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use db::{
        entities::{event_outbox, invitation as invitation_entity},
        events::EventEnvelope,
        types::{InvitationStatus, OutboxStatus, ResponseKind},
    };
    use sea_orm::{
        ActiveModelTrait, ColumnTrait, Database, EntityTrait, QueryFilter, QueryOrder, Set,
    };
    use sea_orm_migration::MigratorTrait;

    use super::*;
    use crate::services::delivery::DeliveryQueue;

    async fn setup() -> (DBService, InvitationService, DeliveryQueue) {
        let pool = Database::connect("sqlite::memory:").await.unwrap();
        db_migration::Migrator::up(&pool, None).await.unwrap();
        let db = DBService { pool };
        let queue = DeliveryQueue::new(64);
        let writer = OutboxWriter::new("greenroom-interviews", queue.clone());
        let service = InvitationService::new(db.clone(), writer);
        (db, service, queue)
    }

    fn create_data(total_questions: i32) -> CreateInvitation {
        CreateInvitation {
            template_id: Uuid::new_v4(),
            candidate_id: Uuid::new_v4(),
            company_name: "Initech".to_string(),
            invited_by: Uuid::new_v4(),
            expires_at: Utc::now() + chrono::Duration::hours(2),
            total_questions,
            allow_pause: false,
            show_timer: true,
        }
    }

    fn text_answer(index: i32) -> SubmitResponse {
        SubmitResponse {
            question_id: Uuid::new_v4(),
            question_index: index,
            question_text: format!("Question {index}"),
            kind: ResponseKind::Text,
            text_answer: Some("An answer".to_string()),
            code_answer: None,
            video_url: None,
            duration_seconds: 30,
        }
    }

    async fn outbox_rows(db: &DBService) -> Vec<event_outbox::Model> {
        event_outbox::Entity::find()
            .order_by_asc(event_outbox::Column::Id)
            .all(&db.pool)
            .await
            .unwrap()
    }

    async fn force_overdue(db: &DBService, id: Uuid) {
        let row = invitation_entity::Entity::find()
            .filter(invitation_entity::Column::Uuid.eq(id))
            .one(&db.pool)
            .await
            .unwrap()
            .unwrap();
        let mut active: invitation_entity::ActiveModel = row.into();
        active.expires_at = Set(Utc::now() - chrono::Duration::minutes(5));
        active.update(&db.pool).await.unwrap();
    }

    #[tokio::test]
    async fn create_persists_the_aggregate_and_its_event() {
        let (db, service, queue) = setup().await;

        let invitation = service.create(create_data(3)).await.unwrap();

        let stored = service.get(invitation.id).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Pending);
        assert_eq!(stored.company_name, "Initech");

        let rows = outbox_rows(&db).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, "invitation.created");
        assert_eq!(rows[0].aggregate_id, invitation.id);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn full_candidate_flow_records_every_event() {
        let (db, service, _) = setup().await;
        let data = create_data(2);
        let candidate = data.candidate_id;

        let invitation = service.create(data).await.unwrap();
        service.start(invitation.id, candidate).await.unwrap();
        service
            .submit_response(invitation.id, candidate, text_answer(0))
            .await
            .unwrap();
        service
            .submit_response(invitation.id, candidate, text_answer(1))
            .await
            .unwrap();
        let completed = service
            .complete(invitation.id, Some(candidate), CompletionReason::Manual)
            .await
            .unwrap();

        assert_eq!(completed.status, InvitationStatus::Completed);
        assert_eq!(completed.completion_reason, Some(CompletionReason::Manual));

        let rows = outbox_rows(&db).await;
        let types: Vec<&str> = rows.iter().map(|row| row.event_type.as_str()).collect();
        assert_eq!(
            types,
            [
                "invitation.created",
                "invitation.started",
                "invitation.response_submitted",
                "invitation.response_submitted",
                "invitation.completed",
            ]
        );
        assert!(rows.iter().all(|row| row.aggregate_id == invitation.id));

        let envelope: EventEnvelope = serde_json::from_value(rows[4].payload.clone()).unwrap();
        assert_eq!(envelope.payload["reason"], "manual");
        assert_eq!(envelope.payload["progress"]["answered"], 2);
        assert_eq!(envelope.payload["progress"]["percentage"], 100);
        assert_eq!(envelope.payload["questions"].as_array().unwrap().len(), 2);
        assert_eq!(envelope.payload["responses"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn manual_complete_requires_every_answer() {
        let (db, service, _) = setup().await;
        let data = create_data(2);
        let candidate = data.candidate_id;

        let invitation = service.create(data).await.unwrap();
        service.start(invitation.id, candidate).await.unwrap();
        service
            .submit_response(invitation.id, candidate, text_answer(0))
            .await
            .unwrap();

        let err = service
            .complete(invitation.id, Some(candidate), CompletionReason::Manual)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("1/2"));

        // Nothing was completed and no completion event leaked out.
        let stored = service.get(invitation.id).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::InProgress);
        let rows = outbox_rows(&db).await;
        assert!(rows.iter().all(|row| row.event_type != "invitation.completed"));
    }

    #[tokio::test]
    async fn timeout_completion_accepts_partial_answers() {
        let (db, service, _) = setup().await;
        let data = create_data(3);
        let candidate = data.candidate_id;

        let invitation = service.create(data).await.unwrap();
        service.start(invitation.id, candidate).await.unwrap();
        service
            .submit_response(invitation.id, candidate, text_answer(0))
            .await
            .unwrap();

        let completed = service
            .complete(invitation.id, None, CompletionReason::AutoTimeout)
            .await
            .unwrap();
        assert_eq!(completed.status, InvitationStatus::Completed);
        assert_eq!(
            completed.completion_reason,
            Some(CompletionReason::AutoTimeout)
        );

        let rows = outbox_rows(&db).await;
        let envelope: EventEnvelope =
            serde_json::from_value(rows.last().unwrap().payload.clone()).unwrap();
        assert_eq!(envelope.event_type, "invitation.completed");
        assert_eq!(envelope.payload["reason"], "auto_timeout");
        assert_eq!(envelope.payload["progress"]["answered"], 1);
        assert_eq!(envelope.payload["progress"]["total"], 3);
    }

    #[tokio::test]
    async fn rejected_commands_write_nothing() {
        let (db, service, _) = setup().await;
        let invitation = service.create(create_data(2)).await.unwrap();

        let err = service
            .start(invitation.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        let stored = service.get(invitation.id).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Pending);
        assert_eq!(outbox_rows(&db).await.len(), 1);
    }

    #[tokio::test]
    async fn overdue_commands_persist_the_expiry_flip() {
        let (db, service, _) = setup().await;
        let data = create_data(2);
        let candidate = data.candidate_id;
        let invitation = service.create(data).await.unwrap();
        force_overdue(&db, invitation.id).await;

        let err = service.start(invitation.id, candidate).await.unwrap_err();
        assert!(matches!(
            err,
            InvitationServiceError::Domain(InvitationError::Expired)
        ));
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // The rejection still left a durable trace: state flipped, event
        // recorded.
        let stored = service.get(invitation.id).await.unwrap();
        assert_eq!(stored.status, InvitationStatus::Expired);
        let rows = outbox_rows(&db).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].event_type, "invitation.expired");

        // A second attempt reports the same error without a second event.
        let err = service.start(invitation.id, candidate).await.unwrap_err();
        assert!(matches!(
            err,
            InvitationServiceError::Domain(InvitationError::Expired)
        ));
        assert_eq!(outbox_rows(&db).await.len(), 2);
    }

    #[tokio::test]
    async fn get_unknown_invitation_is_not_found() {
        let (_, service, _) = setup().await;
        let err = service.get(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn expiry_sweep_expires_only_overdue_rows() {
        let (db, service, _) = setup().await;
        let overdue = service.create(create_data(2)).await.unwrap();
        let current = service.create(create_data(2)).await.unwrap();
        force_overdue(&db, overdue.id).await;

        assert_eq!(service.expire_overdue(10).await.unwrap(), 1);

        assert_eq!(
            service.get(overdue.id).await.unwrap().status,
            InvitationStatus::Expired
        );
        assert_eq!(
            service.get(current.id).await.unwrap().status,
            InvitationStatus::Pending
        );

        let rows = outbox_rows(&db).await;
        let expired: Vec<_> = rows
            .iter()
            .filter(|row| row.event_type == "invitation.expired")
            .collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].aggregate_id, overdue.id);

        // Already expired; the next pass finds nothing.
        assert_eq!(service.expire_overdue(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn heartbeat_restamps_activity_without_events() {
        let (db, service, _) = setup().await;
        let data = create_data(2);
        let candidate = data.candidate_id;
        let invitation = service.create(data).await.unwrap();
        service.start(invitation.id, candidate).await.unwrap();
        let before = service.get(invitation.id).await.unwrap();

        service.heartbeat(invitation.id, candidate).await.unwrap();

        let after = service.get(invitation.id).await.unwrap();
        assert!(after.last_activity_at >= before.last_activity_at);
        assert_eq!(outbox_rows(&db).await.len(), 2);

        let err = service
            .heartbeat(invitation.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }
}
