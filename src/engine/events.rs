//! Events consumed by the burn engine.
//!
//! Three producers push into the engine's single ordered queue: the
//! serial reader thread, the flashing subprocess reader threads, and the
//! watchdog ticker. The engine is the only consumer, so all state mutation
//! stays single-threaded no matter how the producers interleave.

/// One item on the engine's event queue. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    /// A complete, ANSI-stripped line read from the serial console.
    SerialLine(String),
    /// A line of combined stdout/stderr from the flashing subprocess.
    /// Tagged separately from serial lines so logs and matchers can be
    /// scoped per source.
    BurnLine(String),
    /// The flashing subprocess terminated. Reported exactly once.
    BurnExited(BurnExit),
    /// The serial reader hit an unrecoverable I/O error and stopped.
    SerialError(String),
    /// One-second watchdog tick; drives deadlines and the heartbeat.
    Tick,
}

/// Terminal status of the flashing subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BurnExit {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// The raw exit code when the process was not killed by a signal.
    pub code: Option<i32>,
}
