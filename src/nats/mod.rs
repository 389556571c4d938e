pub mod client;
pub mod messages;

pub use client::{subject_token, NatsClient};
pub use messages::{ResultMessage, TaskMessage, TaskPayload};
