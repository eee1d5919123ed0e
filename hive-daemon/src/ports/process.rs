use std::io;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT: asks an interactive agent to stop its current turn.
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// OS process probing and signalling by PID.
pub trait ProcessControl: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Start time of the process in clock ticks since boot, when the platform
    /// exposes it. Together with the PID it identifies one process instance.
    fn start_ticks(&self, pid: u32) -> Option<u64>;

    /// Sends `signal`, to the whole process group when `pid` leads one. A
    /// process that is already gone is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;
}
