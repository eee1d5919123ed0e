//! Client side of the hive control API.

pub mod api;
pub mod bootstrap;
pub mod debug_log;
pub mod error;
pub mod http;
pub mod sse;

pub use api::{ClientResult, DaemonApi, DaemonControl, EventStream};
pub use bootstrap::{
    DaemonBootstrap, DaemonLauncher, DetachedLauncher, KillOutcome, OsSignaller, PollPolicy,
    ProcessSignaller,
};
pub use debug_log::StreamDebugLog;
pub use error::ClientError;
pub use http::{load_token, HttpDaemonClient};
pub use sse::SseDecoder;
