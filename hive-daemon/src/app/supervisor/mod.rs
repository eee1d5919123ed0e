mod handle;
pub mod hub;
mod process;
pub mod providers;
pub mod reconcile;
pub mod service;

pub use hub::{EventFilter, EventHub, Subscription};
pub use providers::ProviderRegistry;
pub use service::{
    RestoreReport, SessionSupervisor, SupervisorConfig, SupervisorError, SupervisorResult,
};
