mod os;

pub use os::{parse_start_ticks, OsProcessControl};

#[cfg(all(test, target_os = "linux"))]
pub(crate) use os::still_running;
