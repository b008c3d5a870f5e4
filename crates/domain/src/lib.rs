pub mod chat;
pub mod documents;
pub mod error;
pub mod idempotency;
pub mod identity;
pub mod inbox;
pub mod memory_store;
pub mod ports;
pub mod profiles;
pub mod projects;
pub mod requests;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
