//! Validator coordination and settlement engine.
//!
//! The hub keeps a registry of live validator connections, fans probe tasks
//! out to them over a JSON duplex protocol and correlates the signed replies
//! back to one-shot handlers that credit the ledger. Accrued credit is settled
//! on Solana by a queue-driven worker that compensates the ledger when a
//! transfer is known not to have happened.

pub mod agent;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod hub;
pub mod ledger;
pub mod server;
pub mod settlement;
pub mod signature;

pub use error::{AppError, AppResult};
