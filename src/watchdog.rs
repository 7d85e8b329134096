//! Wall-clock supervision of a burn run.
//!
//! A ticker thread injects [`Event::Tick`] once a second into the same
//! queue every other producer feeds, so deadline handling happens on the
//! engine's own thread and never races a transition. The [`Watchdog`] value
//! owned by the engine turns those ticks into timeout decisions:
//!
//! * a first-data deadline while not a single line has been received,
//!   with a wake-up escalation (Enter keystrokes, then Ctrl-C + Enter)
//!   before giving up;
//! * a global inactivity deadline, reset on every received line;
//! * a bounded wait for the U-Boot prompt after a forced reboot;
//! * the fixed boot-verification window after a successful burn;
//! * a 5-second heartbeat log line, advisory only.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::info;

use crate::engine::events::Event;

/// Global inactivity: no line from either source for this long is fatal.
const GLOBAL_INACTIVITY: Duration = Duration::from_secs(300);

/// How long to wait for the very first line before declaring the console
/// dead.
const FIRST_DATA: Duration = Duration::from_secs(30);

/// Wake-up escalation: plain Enter keystrokes up to this point...
const WAKE_ENTER_UNTIL: Duration = Duration::from_secs(10);

/// ...then Ctrl-C + Enter (the board may be stuck in download mode) until
/// this point.
const WAKE_CTRL_C_UNTIL: Duration = Duration::from_secs(14);

/// The initial grace period before any wake-up keystroke is sent.
const WAKE_GRACE: Duration = Duration::from_secs(3);

/// After a forced reboot, the U-Boot prompt must show up within this long
/// or the autoboot countdown was missed.
const AUTOBOOT_WAIT: Duration = Duration::from_secs(30);

/// Fixed boot-verification window after a successful burn.
pub(crate) const VERIFY_WINDOW: Duration = Duration::from_secs(30);

/// Heartbeat period for the advisory status line.
const HEARTBEAT: Duration = Duration::from_secs(5);

// =============================================================================
// Ticker thread
// =============================================================================

/// Spawn the 1-second ticker feeding [`Event::Tick`] into `tx`.
pub(crate) fn spawn_ticker(tx: Sender<Event>, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("watchdog-ticker".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(1));
                if tx.send(Event::Tick).is_err() {
                    break;
                }
            }
        })
        .expect("failed to spawn the watchdog ticker thread")
}

// =============================================================================
// Deadline bookkeeping
// =============================================================================

/// Which deadline fired. Carried into the `Timeout` event the engine
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutScope {
    /// Not a single line arrived within the first-data window.
    NoFirstData,
    /// The global inactivity deadline expired.
    GlobalInactivity,
    /// The U-Boot prompt never showed up after a forced reboot.
    AutobootMissed,
    /// The boot-verification window closed. Not fatal: the engine records
    /// a warning and completes anyway.
    VerifyWindow,
}

impl TimeoutScope {
    pub(crate) fn reason(&self) -> &'static str {
        match self {
            TimeoutScope::NoFirstData => "no serial data",
            TimeoutScope::GlobalInactivity => "no activity on serial or flashing output",
            TimeoutScope::AutobootMissed => "U-Boot prompt not detected after reboot",
            TimeoutScope::VerifyWindow => "boot verification window closed",
        }
    }
}

/// A wake-up keystroke the engine should send while the console is silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeHint {
    Enter,
    CtrlCEnter,
}

/// Deadline state owned by the engine. All methods take `now` explicitly so
/// the checks are deterministic under test.
pub(crate) struct Watchdog {
    started: Instant,
    last_line: Option<Instant>,
    lines: u64,
    verify_deadline: Option<Instant>,
    reboot_wait_since: Option<Instant>,
    last_heartbeat: Instant,
}

impl Watchdog {
    pub(crate) fn new(now: Instant) -> Self {
        Watchdog {
            started: now,
            last_line: None,
            lines: 0,
            verify_deadline: None,
            reboot_wait_since: None,
            last_heartbeat: now,
        }
    }

    /// Record a received line (serial or flashing output); resets the
    /// inactivity deadline.
    pub(crate) fn note_line(&mut self, now: Instant) {
        self.last_line = Some(now);
        self.lines += 1;
    }

    pub(crate) fn lines(&self) -> u64 {
        self.lines
    }

    /// Arm the boot-verification window after a successful burn.
    pub(crate) fn arm_verify(&mut self, now: Instant) {
        self.verify_deadline = Some(now + VERIFY_WINDOW);
    }

    pub(crate) fn disarm_verify(&mut self) {
        self.verify_deadline = None;
    }

    /// Start the bounded wait for the U-Boot prompt after a forced reboot.
    pub(crate) fn start_reboot_wait(&mut self, now: Instant) {
        self.reboot_wait_since = Some(now);
    }

    pub(crate) fn clear_reboot_wait(&mut self) {
        self.reboot_wait_since = None;
    }

    /// The wake-up keystroke (if any) to send on this tick. Only while no
    /// line has been received at all.
    pub(crate) fn wake_hint(&self, now: Instant) -> Option<WakeHint> {
        if self.lines > 0 {
            return None;
        }
        let elapsed = now - self.started;
        if elapsed < WAKE_GRACE {
            None
        } else if elapsed < WAKE_ENTER_UNTIL {
            Some(WakeHint::Enter)
        } else if elapsed < WAKE_CTRL_C_UNTIL {
            Some(WakeHint::CtrlCEnter)
        } else {
            None
        }
    }

    /// Evaluate all deadlines on a tick and emit the heartbeat. Returns the
    /// first expired scope, if any.
    pub(crate) fn on_tick(&mut self, now: Instant, state_label: &str) -> Option<TimeoutScope> {
        if now - self.last_heartbeat >= HEARTBEAT {
            self.last_heartbeat = now;
            let since_line = self
                .last_line
                .map(|t| format!("{:.1}s ago", (now - t).as_secs_f64()))
                .unwrap_or_else(|| "never".into());
            info!(
                "status: state={}, elapsed={:.1}s, lines={}, last line {}",
                state_label,
                (now - self.started).as_secs_f64(),
                self.lines,
                since_line
            );
        }

        if self.lines == 0 {
            if now - self.started > FIRST_DATA {
                return Some(TimeoutScope::NoFirstData);
            }
            return None;
        }
        if let Some(last) = self.last_line {
            if now - last > GLOBAL_INACTIVITY {
                return Some(TimeoutScope::GlobalInactivity);
            }
        }
        if let Some(since) = self.reboot_wait_since {
            if now - since > AUTOBOOT_WAIT {
                return Some(TimeoutScope::AutobootMissed);
            }
        }
        if let Some(deadline) = self.verify_deadline {
            if now >= deadline {
                return Some(TimeoutScope::VerifyWindow);
            }
        }
        None
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_data_deadline_fires_without_lines() {
        let start = Instant::now();
        let mut wd = Watchdog::new(start);
        assert_eq!(wd.on_tick(start + Duration::from_secs(10), "INIT"), None);
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(31), "INIT"),
            Some(TimeoutScope::NoFirstData)
        );
    }

    #[test]
    fn lines_reset_the_inactivity_deadline() {
        let start = Instant::now();
        let mut wd = Watchdog::new(start);
        wd.note_line(start + Duration::from_secs(5));
        assert_eq!(wd.on_tick(start + Duration::from_secs(304), "UBOOT"), None);
        wd.note_line(start + Duration::from_secs(304));
        assert_eq!(wd.on_tick(start + Duration::from_secs(600), "UBOOT"), None);
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(700), "UBOOT"),
            Some(TimeoutScope::GlobalInactivity)
        );
    }

    #[test]
    fn verify_window_is_thirty_seconds() {
        let start = Instant::now();
        let mut wd = Watchdog::new(start);
        wd.note_line(start);
        wd.arm_verify(start);
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(29), "BOOT_VERIFY"),
            None
        );
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(30), "BOOT_VERIFY"),
            Some(TimeoutScope::VerifyWindow)
        );
        wd.disarm_verify();
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(31), "BOOT_VERIFY"),
            None
        );
    }

    #[test]
    fn reboot_wait_bounds_the_prompt_hunt() {
        let start = Instant::now();
        let mut wd = Watchdog::new(start);
        wd.note_line(start);
        wd.start_reboot_wait(start);
        assert_eq!(wd.on_tick(start + Duration::from_secs(20), "INIT"), None);
        assert_eq!(
            wd.on_tick(start + Duration::from_secs(31), "INIT"),
            Some(TimeoutScope::AutobootMissed)
        );
        wd.clear_reboot_wait();
        assert_eq!(wd.on_tick(start + Duration::from_secs(32), "UBOOT"), None);
    }

    #[test]
    fn wake_hints_escalate_then_stop() {
        let start = Instant::now();
        let mut wd = Watchdog::new(start);
        assert_eq!(wd.wake_hint(start + Duration::from_secs(1)), None);
        assert_eq!(
            wd.wake_hint(start + Duration::from_secs(5)),
            Some(WakeHint::Enter)
        );
        assert_eq!(
            wd.wake_hint(start + Duration::from_secs(12)),
            Some(WakeHint::CtrlCEnter)
        );
        assert_eq!(wd.wake_hint(start + Duration::from_secs(20)), None);
        wd.note_line(start + Duration::from_secs(6));
        assert_eq!(wd.wake_hint(start + Duration::from_secs(7)), None);
    }
}
