pub mod aggregate;
pub mod events;
pub mod value_object;

pub use aggregate::{Session, SessionTransitionError};
pub use events::{SessionDomainEvent, SessionEventEnvelope};
pub use value_object::{LaunchSpec, ProviderName, SessionId};
