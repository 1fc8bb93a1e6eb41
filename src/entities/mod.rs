pub mod account;
pub mod card;
pub mod customer;
pub mod outbox_event;

pub use card::CardType;
pub use outbox_event::OutboxStatus;
