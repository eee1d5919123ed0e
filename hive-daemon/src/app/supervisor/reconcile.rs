use crate::ports::process::ProcessControl;
use hive_protocol::OrphanReason;

/// What to do with a non-terminal session found in the index after a
/// restart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The recorded process is still the one we spawned.
    Adopt(u32),
    Orphan(OrphanReason),
}

/// A PID alone proves nothing after a restart, so adoption also requires the
/// recorded start ticks to match the live process.
pub fn classify(
    pid: Option<u32>,
    recorded_ticks: Option<u64>,
    process: &dyn ProcessControl,
) -> Verdict {
    let Some(pid) = pid else {
        return Verdict::Orphan(OrphanReason::ProcessMissing);
    };
    if !process.is_alive(pid) {
        return Verdict::Orphan(OrphanReason::ProcessMissing);
    }
    match (recorded_ticks, process.start_ticks(pid)) {
        (Some(recorded), Some(live)) if recorded == live => Verdict::Adopt(pid),
        (Some(_), Some(_)) => Verdict::Orphan(OrphanReason::PidReused),
        _ => Verdict::Orphan(OrphanReason::Unverifiable),
    }
}
