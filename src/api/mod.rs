// Ledger HTTP API: payout requests and read-only balance views
pub mod handler;
pub mod models;

pub use handler::ApiState;
