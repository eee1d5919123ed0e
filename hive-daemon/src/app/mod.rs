pub mod approvals;
pub mod supervisor;
