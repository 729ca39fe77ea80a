//! HTTP receiver surface for inter-server messages.

pub mod receiver;

pub use receiver::{router, ReceiverState};
