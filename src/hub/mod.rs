// Hub coordinator: validator sessions, probe dispatch, reply correlation
pub mod callbacks;
pub mod coordinator;
pub mod protocol;
pub mod registry;
pub mod socket;

pub use callbacks::{CallbackOutcome, CallbackTable};
pub use coordinator::{DispatchSummary, Hub, Session};
pub use registry::{ConnectionRegistry, ValidatorConnection};
