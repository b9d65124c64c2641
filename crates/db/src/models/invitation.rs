use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entities::{invitation, invitation_response},
    events::{
        InvitationCompletedPayload, InvitationCreatedPayload, InvitationEvent,
        InvitationExpiredPayload, InvitationStartedPayload, Progress, QuestionSnapshot,
        ResponseSnapshot, ResponseSubmittedPayload,
    },
    types::{CompletionReason, InvitationStatus, ResponseKind},
};

pub const MAX_TEXT_ANSWER_CHARS: usize = 10_000;
pub const MAX_CODE_ANSWER_CHARS: usize = 50_000;
pub const MAX_VIDEO_URL_CHARS: usize = 2_000;

/// Failure category fixed at the throw site. Callers branch on this instead
/// of inspecting message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    AccessDenied,
    NotFound,
    Conflict,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum InvitationError {
    #[error("{0}")]
    Validation(String),
    #[error("invitation can only be used by the invited candidate")]
    AccessDenied,
    #[error("invitation has expired")]
    Expired,
    #[error("invitation is {actual}, expected {expected}")]
    InvalidState {
        expected: InvitationStatus,
        actual: InvitationStatus,
    },
    #[error("a response for question {question_id} was already submitted")]
    DuplicateResponse { question_id: Uuid },
    #[error("only {answered}/{total} questions answered")]
    Incomplete { answered: u32, total: u32 },
}

impl InvitationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Incomplete { .. } => ErrorKind::Validation,
            Self::AccessDenied => ErrorKind::AccessDenied,
            Self::Expired | Self::InvalidState { .. } | Self::DuplicateResponse { .. } => {
                ErrorKind::Conflict
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInvitation {
    pub template_id: Uuid,
    pub candidate_id: Uuid,
    pub company_name: String,
    pub invited_by: Uuid,
    pub expires_at: DateTime<Utc>,
    pub total_questions: i32,
    pub allow_pause: bool,
    pub show_timer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub question_id: Uuid,
    pub question_index: i32,
    pub question_text: String,
    pub kind: ResponseKind,
    pub text_answer: Option<String>,
    pub code_answer: Option<String>,
    pub video_url: Option<String>,
    pub duration_seconds: i32,
}

/// A submitted answer. Owned by its invitation, immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Uuid,
    pub question_id: Uuid,
    pub question_index: i32,
    pub question_text: String,
    pub kind: ResponseKind,
    pub text_answer: Option<String>,
    pub code_answer: Option<String>,
    pub video_url: Option<String>,
    pub duration_seconds: i32,
    pub submitted_at: DateTime<Utc>,
}

impl Response {
    fn new(data: SubmitResponse, now: DateTime<Utc>) -> Result<Self, InvitationError> {
        if data.question_text.trim().is_empty() {
            return Err(InvitationError::Validation(
                "question text must not be blank".to_string(),
            ));
        }
        if data.question_index < 0 {
            return Err(InvitationError::Validation(
                "question index must not be negative".to_string(),
            ));
        }
        if data.duration_seconds < 0 {
            return Err(InvitationError::Validation(
                "response duration must not be negative".to_string(),
            ));
        }
        match data.kind {
            ResponseKind::Text => {
                let answer = data.text_answer.as_deref().map(str::trim).unwrap_or("");
                if answer.is_empty() {
                    return Err(InvitationError::Validation(
                        "text responses require an answer".to_string(),
                    ));
                }
                if answer.chars().count() > MAX_TEXT_ANSWER_CHARS {
                    return Err(InvitationError::Validation(format!(
                        "text answer exceeds {MAX_TEXT_ANSWER_CHARS} characters"
                    )));
                }
            }
            ResponseKind::Code => {
                let answer = data.code_answer.as_deref().map(str::trim).unwrap_or("");
                if answer.is_empty() {
                    return Err(InvitationError::Validation(
                        "code responses require an answer".to_string(),
                    ));
                }
                if answer.chars().count() > MAX_CODE_ANSWER_CHARS {
                    return Err(InvitationError::Validation(format!(
                        "code answer exceeds {MAX_CODE_ANSWER_CHARS} characters"
                    )));
                }
            }
            // Video recording upload is not live yet; a URL is accepted but
            // not required.
            ResponseKind::Video => {
                if let Some(url) = data.video_url.as_deref()
                    && url.chars().count() > MAX_VIDEO_URL_CHARS
                {
                    return Err(InvitationError::Validation(format!(
                        "video url exceeds {MAX_VIDEO_URL_CHARS} characters"
                    )));
                }
            }
        }

        Ok(Self {
            id: Uuid::new_v4(),
            question_id: data.question_id,
            question_index: data.question_index,
            question_text: data.question_text,
            kind: data.kind,
            text_answer: data.text_answer,
            code_answer: data.code_answer,
            video_url: data.video_url,
            duration_seconds: data.duration_seconds,
            submitted_at: now,
        })
    }
}

/// Interview invitation aggregate. Command methods validate against the
/// lifecycle state machine, mutate in memory and push domain events onto a
/// private buffer; nothing touches the database here. Callers persist the
/// aggregate, drain the buffer with [`Invitation::drain_events`], record the
/// events on the same transaction and only then schedule publishing.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub id: Uuid,
    pub template_id: Uuid,
    pub candidate_id: Uuid,
    pub company_name: String,
    pub invited_by: Uuid,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
    pub total_questions: i32,
    pub allow_pause: bool,
    pub show_timer: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub completion_reason: Option<CompletionReason>,
    pub responses: Vec<Response>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    events: Vec<InvitationEvent>,
}

impl Invitation {
    pub fn create(data: CreateInvitation) -> Result<Self, InvitationError> {
        let company_name = data.company_name.trim().to_string();
        if company_name.is_empty() {
            return Err(InvitationError::Validation(
                "company name must not be blank".to_string(),
            ));
        }
        if data.total_questions < 1 {
            return Err(InvitationError::Validation(
                "an interview needs at least one question".to_string(),
            ));
        }
        let now = Utc::now();
        if data.expires_at <= now {
            return Err(InvitationError::Validation(
                "expiry must be strictly in the future".to_string(),
            ));
        }

        let mut invitation = Self {
            id: Uuid::new_v4(),
            template_id: data.template_id,
            candidate_id: data.candidate_id,
            company_name,
            invited_by: data.invited_by,
            status: InvitationStatus::Pending,
            expires_at: data.expires_at,
            total_questions: data.total_questions,
            allow_pause: data.allow_pause,
            show_timer: data.show_timer,
            started_at: None,
            completed_at: None,
            last_activity_at: None,
            completion_reason: None,
            responses: Vec::new(),
            created_at: now,
            updated_at: now,
            events: Vec::new(),
        };
        invitation
            .events
            .push(InvitationEvent::Created(InvitationCreatedPayload {
                invitation_id: invitation.id,
                template_id: invitation.template_id,
                candidate_id: invitation.candidate_id,
                company_name: invitation.company_name.clone(),
                invited_by: invitation.invited_by,
                expires_at: invitation.expires_at,
                total_questions: invitation.total_questions,
            }));
        Ok(invitation)
    }

    pub fn start(&mut self, user_id: Uuid) -> Result<(), InvitationError> {
        let now = Utc::now();
        self.guard_not_overdue(now)?;
        if user_id != self.candidate_id {
            return Err(InvitationError::AccessDenied);
        }
        if self.status != InvitationStatus::Pending {
            return Err(InvitationError::InvalidState {
                expected: InvitationStatus::Pending,
                actual: self.status,
            });
        }

        self.status = InvitationStatus::InProgress;
        self.started_at = Some(now);
        self.last_activity_at = Some(now);
        self.updated_at = now;
        self.events
            .push(InvitationEvent::Started(InvitationStartedPayload {
                invitation_id: self.id,
                candidate_id: self.candidate_id,
                started_at: now,
            }));
        Ok(())
    }

    pub fn submit_response(
        &mut self,
        user_id: Uuid,
        data: SubmitResponse,
    ) -> Result<(), InvitationError> {
        let now = Utc::now();
        if user_id != self.candidate_id {
            return Err(InvitationError::AccessDenied);
        }
        self.guard_not_overdue(now)?;
        if self.status != InvitationStatus::InProgress {
            return Err(InvitationError::InvalidState {
                expected: InvitationStatus::InProgress,
                actual: self.status,
            });
        }
        if self
            .responses
            .iter()
            .any(|response| response.question_id == data.question_id)
        {
            return Err(InvitationError::DuplicateResponse {
                question_id: data.question_id,
            });
        }

        let response = Response::new(data, now)?;
        let (question_id, question_index, kind) =
            (response.question_id, response.question_index, response.kind);
        self.responses.push(response);
        self.last_activity_at = Some(now);
        self.updated_at = now;

        let progress = self.progress();
        self.events.push(InvitationEvent::ResponseSubmitted(
            ResponseSubmittedPayload {
                invitation_id: self.id,
                question_id,
                question_index,
                kind,
                answered: progress.answered,
                total: progress.total,
            },
        ));
        Ok(())
    }

    /// Manual completion is candidate-initiated and requires every question
    /// answered; `auto_timeout` and `expired` are system-initiated
    /// (`user_id = None`) and accept partial answers.
    pub fn complete(
        &mut self,
        user_id: Option<Uuid>,
        reason: CompletionReason,
    ) -> Result<(), InvitationError> {
        let now = Utc::now();
        if reason == CompletionReason::Manual {
            match user_id {
                Some(user) if user == self.candidate_id => {}
                _ => return Err(InvitationError::AccessDenied),
            }
        }
        if self.status != InvitationStatus::InProgress {
            return Err(InvitationError::InvalidState {
                expected: InvitationStatus::InProgress,
                actual: self.status,
            });
        }
        let progress = self.progress();
        if reason == CompletionReason::Manual && progress.answered != progress.total {
            return Err(InvitationError::Incomplete {
                answered: progress.answered,
                total: progress.total,
            });
        }

        self.status = InvitationStatus::Completed;
        self.completed_at = Some(now);
        self.completion_reason = Some(reason);
        self.updated_at = now;
        self.events
            .push(InvitationEvent::Completed(self.completion_payload(
                reason, progress, now,
            )));
        Ok(())
    }

    /// Forces a non-terminal invitation to `expired`. Used by the background
    /// sweep; returns false (and raises nothing) on terminal invitations.
    pub fn mark_expired(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.force_expire(Utc::now());
        true
    }

    /// Heartbeat from the candidate's session. Safe to call repeatedly and
    /// in any state.
    pub fn touch_activity(&mut self) {
        let now = Utc::now();
        self.last_activity_at = Some(now);
        self.updated_at = now;
    }

    pub fn progress(&self) -> Progress {
        let answered = self.responses.len() as u32;
        let total = self.total_questions as u32;
        let percentage = ((f64::from(answered) / f64::from(total)) * 100.0).round() as u32;
        Progress {
            answered,
            total,
            percentage,
        }
    }

    /// Drains the uncommitted event buffer. Call after the aggregate has
    /// been persisted; the returned events belong in the outbox on the same
    /// transaction.
    pub fn drain_events(&mut self) -> Vec<InvitationEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Past-due invitations flip to `expired` the moment a candidate touches
    /// them. Completed invitations are left alone: they finished before the
    /// deadline mattered.
    fn guard_not_overdue(&mut self, now: DateTime<Utc>) -> Result<(), InvitationError> {
        if now <= self.expires_at || self.status == InvitationStatus::Completed {
            return Ok(());
        }
        if self.status != InvitationStatus::Expired {
            self.force_expire(now);
        }
        Err(InvitationError::Expired)
    }

    fn force_expire(&mut self, now: DateTime<Utc>) {
        self.status = InvitationStatus::Expired;
        self.updated_at = now;
        self.events
            .push(InvitationEvent::Expired(InvitationExpiredPayload {
                invitation_id: self.id,
                candidate_id: self.candidate_id,
                expired_at: now,
            }));
    }

    fn completion_payload(
        &self,
        reason: CompletionReason,
        progress: Progress,
        completed_at: DateTime<Utc>,
    ) -> InvitationCompletedPayload {
        let questions = self
            .responses
            .iter()
            .map(|response| QuestionSnapshot {
                question_id: response.question_id,
                question_index: response.question_index,
                question_text: response.question_text.clone(),
                kind: response.kind,
            })
            .collect();
        let responses = self
            .responses
            .iter()
            .map(|response| ResponseSnapshot {
                response_id: response.id,
                question_id: response.question_id,
                question_index: response.question_index,
                kind: response.kind,
                text_answer: response.text_answer.clone(),
                code_answer: response.code_answer.clone(),
                video_url: response.video_url.clone(),
                duration_seconds: response.duration_seconds,
                submitted_at: response.submitted_at,
            })
            .collect();
        InvitationCompletedPayload {
            invitation_id: self.id,
            template_id: self.template_id,
            candidate_id: self.candidate_id,
            company_name: self.company_name.clone(),
            reason,
            started_at: self.started_at,
            completed_at,
            progress,
            questions,
            responses,
        }
    }
}

impl Invitation {
    fn from_models(
        record: invitation::Model,
        response_models: Vec<invitation_response::Model>,
    ) -> Self {
        let responses = response_models
            .into_iter()
            .map(|model| Response {
                id: model.uuid,
                question_id: model.question_id,
                question_index: model.question_index,
                question_text: model.question_text,
                kind: model.kind,
                text_answer: model.text_answer,
                code_answer: model.code_answer,
                video_url: model.video_url,
                duration_seconds: model.duration_seconds,
                submitted_at: model.submitted_at,
            })
            .collect();
        Self {
            id: record.uuid,
            template_id: record.template_id,
            candidate_id: record.candidate_id,
            company_name: record.company_name,
            invited_by: record.invited_by,
            status: record.status,
            expires_at: record.expires_at,
            total_questions: record.total_questions,
            allow_pause: record.allow_pause,
            show_timer: record.show_timer,
            started_at: record.started_at,
            completed_at: record.completed_at,
            last_activity_at: record.last_activity_at,
            completion_reason: record.completion_reason,
            responses,
            created_at: record.created_at,
            updated_at: record.updated_at,
            events: Vec::new(),
        }
    }

    pub async fn insert<C: ConnectionTrait>(db: &C, invitation: &Invitation) -> Result<(), DbErr> {
        let active = invitation::ActiveModel {
            uuid: Set(invitation.id),
            template_id: Set(invitation.template_id),
            candidate_id: Set(invitation.candidate_id),
            company_name: Set(invitation.company_name.clone()),
            invited_by: Set(invitation.invited_by),
            status: Set(invitation.status),
            expires_at: Set(invitation.expires_at),
            total_questions: Set(invitation.total_questions),
            allow_pause: Set(invitation.allow_pause),
            show_timer: Set(invitation.show_timer),
            started_at: Set(invitation.started_at),
            completed_at: Set(invitation.completed_at),
            last_activity_at: Set(invitation.last_activity_at),
            completion_reason: Set(invitation.completion_reason),
            created_at: Set(invitation.created_at),
            updated_at: Set(invitation.updated_at),
            ..Default::default()
        };
        active.insert(db).await?;
        Ok(())
    }

    /// Writes the aggregate's mutable state and any responses not yet stored.
    /// Responses are append-only; rows already present are left untouched.
    pub async fn save<C: ConnectionTrait>(db: &C, invitation: &Invitation) -> Result<(), DbErr> {
        let record = invitation::Entity::find()
            .filter(invitation::Column::Uuid.eq(invitation.id))
            .one(db)
            .await?
            .ok_or(DbErr::RecordNotFound("Invitation not found".to_string()))?;
        let row_id = record.id;

        let mut active: invitation::ActiveModel = record.into();
        active.status = Set(invitation.status);
        active.started_at = Set(invitation.started_at);
        active.completed_at = Set(invitation.completed_at);
        active.last_activity_at = Set(invitation.last_activity_at);
        active.completion_reason = Set(invitation.completion_reason);
        active.updated_at = Set(invitation.updated_at);
        active.update(db).await?;

        let stored: Vec<Uuid> = invitation_response::Entity::find()
            .select_only()
            .column(invitation_response::Column::Uuid)
            .filter(invitation_response::Column::InvitationId.eq(row_id))
            .into_tuple()
            .all(db)
            .await?;
        for response in &invitation.responses {
            if stored.contains(&response.id) {
                continue;
            }
            let active = invitation_response::ActiveModel {
                uuid: Set(response.id),
                invitation_id: Set(row_id),
                question_id: Set(response.question_id),
                question_index: Set(response.question_index),
                question_text: Set(response.question_text.clone()),
                kind: Set(response.kind),
                text_answer: Set(response.text_answer.clone()),
                code_answer: Set(response.code_answer.clone()),
                video_url: Set(response.video_url.clone()),
                duration_seconds: Set(response.duration_seconds),
                submitted_at: Set(response.submitted_at),
                ..Default::default()
            };
            active.insert(db).await?;
        }
        Ok(())
    }

    pub async fn find_by_uuid<C: ConnectionTrait>(
        db: &C,
        id: Uuid,
    ) -> Result<Option<Invitation>, DbErr> {
        let Some(record) = invitation::Entity::find()
            .filter(invitation::Column::Uuid.eq(id))
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        let responses = invitation_response::Entity::find()
            .filter(invitation_response::Column::InvitationId.eq(record.id))
            .order_by_asc(invitation_response::Column::Id)
            .all(db)
            .await?;
        Ok(Some(Self::from_models(record, responses)))
    }

    /// Ids of non-terminal invitations whose deadline has passed, oldest
    /// deadline first. Feeds the expiry sweep.
    pub async fn find_overdue<C: ConnectionTrait>(
        db: &C,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, DbErr> {
        invitation::Entity::find()
            .select_only()
            .column(invitation::Column::Uuid)
            .filter(invitation::Column::Status.is_in([
                InvitationStatus::Pending,
                InvitationStatus::InProgress,
            ]))
            .filter(invitation::Column::ExpiresAt.lt(now))
            .order_by_asc(invitation::Column::ExpiresAt)
            .limit(limit)
            .into_tuple()
            .all(db)
            .await
    }
}
