pub mod gate;

pub use gate::{ApprovalError, ApprovalGate};
