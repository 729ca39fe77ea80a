//! Wire layer for inter-server communication.
//!
//! Defines the signed JSON envelopes exchanged between servers and the
//! [`SecurityManager`] that signs, verifies, and issues scoped tokens for
//! them. Signatures cover the exact bytes placed on the wire, so envelopes
//! are serialized once via [`SecurityManager::canonical_bytes`] and those
//! bytes are both signed and sent.

pub mod envelope;
pub mod security;

pub use envelope::{
    EndpointDescriptor, MessageEnvelope, ReceiveAck, SyncEnvelope, HEADER_MESSAGE_ID,
    HEADER_SERVER_ID, HEADER_SIGNATURE,
};
pub use security::{SecurityManager, TokenClaims};
