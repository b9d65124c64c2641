pub mod event_outbox;
pub mod invitation;
pub mod processed_event;
