pub mod process;
pub mod stores;

pub use process::{ProcessControl, Signal};
pub use stores::SessionStore;
