// Validator agent: answers hub probes with signed results
pub mod client;
pub mod probe;

pub use client::{AgentConnection, AgentLink, ValidatorAgent};
pub use probe::{ProbeOutcome, Prober};
