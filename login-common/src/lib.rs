pub mod dead_letter;
pub mod health;
pub mod login;
pub mod mask;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod sqs;
pub mod store;
