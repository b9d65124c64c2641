pub mod event_outbox;
pub mod invitation;
pub mod invitation_response;
pub mod processed_event;
