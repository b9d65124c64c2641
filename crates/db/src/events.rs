use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CompletionReason, ResponseKind};

pub const EVENT_INVITATION_CREATED: &str = "invitation.created";
pub const EVENT_INVITATION_STARTED: &str = "invitation.started";
pub const EVENT_INVITATION_RESPONSE_SUBMITTED: &str = "invitation.response_submitted";
pub const EVENT_INVITATION_COMPLETED: &str = "invitation.completed";
pub const EVENT_INVITATION_EXPIRED: &str = "invitation.expired";

pub const ENVELOPE_VERSION: u32 = 1;

/// Wire envelope shared by every event type. Field names are part of the
/// cross-service contract, hence the camelCase rename. The envelope is built
/// when the event is recorded and stored whole in the outbox row, so every
/// redelivery ships the same `event_id` and `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    /// Epoch milliseconds at envelope creation.
    pub timestamp: i64,
    pub version: u32,
    pub source: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, source: &str, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            version: ENVELOPE_VERSION,
            source: source.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub answered: u32,
    pub total: u32,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationCreatedPayload {
    pub invitation_id: Uuid,
    pub template_id: Uuid,
    pub candidate_id: Uuid,
    pub company_name: String,
    pub invited_by: Uuid,
    pub expires_at: DateTime<Utc>,
    pub total_questions: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationStartedPayload {
    pub invitation_id: Uuid,
    pub candidate_id: Uuid,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSubmittedPayload {
    pub invitation_id: Uuid,
    pub question_id: Uuid,
    pub question_index: i32,
    pub kind: ResponseKind,
    pub answered: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSnapshot {
    pub question_id: Uuid,
    pub question_index: i32,
    pub question_text: String,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSnapshot {
    pub response_id: Uuid,
    pub question_id: Uuid,
    pub question_index: i32,
    pub kind: ResponseKind,
    pub text_answer: Option<String>,
    pub code_answer: Option<String>,
    pub video_url: Option<String>,
    pub duration_seconds: i32,
    pub submitted_at: DateTime<Utc>,
}

/// Integration payload for downstream analysis: carries the question set and
/// every response so the consumer needs no query back into this system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationCompletedPayload {
    pub invitation_id: Uuid,
    pub template_id: Uuid,
    pub candidate_id: Uuid,
    pub company_name: String,
    pub reason: CompletionReason,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub progress: Progress,
    pub questions: Vec<QuestionSnapshot>,
    pub responses: Vec<ResponseSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationExpiredPayload {
    pub invitation_id: Uuid,
    pub candidate_id: Uuid,
    pub expired_at: DateTime<Utc>,
}

/// Domain event raised by the invitation aggregate. Commands push these onto
/// the aggregate's uncommitted buffer; services drain the buffer after
/// persisting and hand the events to the outbox writer.
#[derive(Debug, Clone)]
pub enum InvitationEvent {
    Created(InvitationCreatedPayload),
    Started(InvitationStartedPayload),
    ResponseSubmitted(ResponseSubmittedPayload),
    Completed(InvitationCompletedPayload),
    Expired(InvitationExpiredPayload),
}

impl InvitationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created(_) => EVENT_INVITATION_CREATED,
            Self::Started(_) => EVENT_INVITATION_STARTED,
            Self::ResponseSubmitted(_) => EVENT_INVITATION_RESPONSE_SUBMITTED,
            Self::Completed(_) => EVENT_INVITATION_COMPLETED,
            Self::Expired(_) => EVENT_INVITATION_EXPIRED,
        }
    }

    pub fn aggregate_id(&self) -> Uuid {
        match self {
            Self::Created(p) => p.invitation_id,
            Self::Started(p) => p.invitation_id,
            Self::ResponseSubmitted(p) => p.invitation_id,
            Self::Completed(p) => p.invitation_id,
            Self::Expired(p) => p.invitation_id,
        }
    }

    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Created(p) => serde_json::to_value(p),
            Self::Started(p) => serde_json::to_value(p),
            Self::ResponseSubmitted(p) => serde_json::to_value(p),
            Self::Completed(p) => serde_json::to_value(p),
            Self::Expired(p) => serde_json::to_value(p),
        }
    }
}
