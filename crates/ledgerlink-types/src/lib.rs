//! Core types for the ledgerlink inter-server communication layer.
//!
//! This crate defines the shared data structures used across the wire
//! protocol, delivery queue, sync engine, and API surface. It contains no
//! business logic.

pub mod config;
pub mod error;
pub mod message;
pub mod server;
