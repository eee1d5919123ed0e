pub mod request;

pub use request::{is_decision_method, ApprovalRequest, DecisionOutcome};
