pub mod bus;
pub mod consumer;
pub mod delivery;
pub mod invitations;
pub mod outbox;
