//! The burn engine: a finite state machine driven by classified console
//! lines, flashing-tool output, and watchdog ticks.
//!
//! The transition core ([`Machine`]) is pure bookkeeping plus two seams it
//! acts through: a [`Console`] it types keystrokes at and a [`Flasher`] it
//! starts the burn with. All the ways a board can wander off the nominal
//! path (booting straight into Linux, missing the autoboot countdown, or
//! sitting at a login prompt) funnel back through the reboot-and-recover
//! protocol that forces the board around to the U-Boot prompt again.
//!
//! [`BurnEngine`] wraps the core with the real I/O: it opens the port,
//! spawns the producer threads, drains the single event queue, and tears
//! everything down when a terminal state is reached.

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
        Arc,
    },
    time::Instant,
};

use log::{error, info, warn};

use super::events::{BurnExit, Event};
use crate::burner::Burner;
use crate::error::BurnError;
use crate::patterns::{classify, PatternKind};
use crate::relay::Relay;
use crate::serial::{open_port, spawn_reader, EnterSender, PortConsole};
use crate::settings::Settings;
use crate::watchdog::{spawn_ticker, TimeoutScope, WakeHint, Watchdog};

/// Minimum plausible size for a firmware image. Anything smaller is a
/// truncated download, not a flashable package.
const MIN_IMAGE_SIZE: u64 = 50 * 1024 * 1024;

// =============================================================================
// States and flags
// =============================================================================

/// The engine states. `Complete` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    Init,
    Bootrom,
    Uboot,
    Download,
    Linux,
    Login,
    BootVerify,
    Complete,
    Error,
}

impl EngineState {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            EngineState::Init => "INIT",
            EngineState::Bootrom => "BOOTROM",
            EngineState::Uboot => "UBOOT",
            EngineState::Download => "DOWNLOAD",
            EngineState::Linux => "LINUX",
            EngineState::Login => "LOGIN",
            EngineState::BootVerify => "BOOT_VERIFY",
            EngineState::Complete => "COMPLETE",
            EngineState::Error => "ERROR",
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Complete | EngineState::Error)
    }
}

/// Auxiliary flags spanning the whole run. Mutated only by the transition
/// handler; the reboot-and-recover protocol resets most of them.
#[derive(Debug, Default)]
struct Flags {
    /// The `adnl` download-mode command has been sent; guards against the
    /// prompt being detected twice.
    adnl_sent: bool,
    /// `root` has been typed at a login prompt this cycle.
    login_sent: bool,
    /// A forced reboot has been issued (or a relay power cycle performed).
    reboot_sent: bool,
    /// The U-Boot prompt was caught after the reboot; stops the
    /// continuous-Enter race.
    uboot_prompt_seen_after_reboot: bool,
    /// `uname -a` has been sent during boot verification.
    verify_sent: bool,
    /// The 1 ms Enter sender is currently running.
    continuous_enter_active: bool,
}

// =============================================================================
// Seams
// =============================================================================

/// What the engine can do to the board's console. The live implementation
/// writes to the serial port; tests record.
pub(crate) trait Console {
    /// Type a command (Ctrl-C, characters, CR).
    fn send_command(&mut self, command: &str) -> io::Result<()>;
    /// A single Enter keystroke.
    fn send_enter(&mut self) -> io::Result<()>;
    /// Ctrl-C + Enter, for a board stuck in download mode.
    fn send_wake(&mut self) -> io::Result<()>;
    /// Start or stop the continuous 1 ms Enter sender.
    fn set_continuous_enter(&mut self, active: bool) -> io::Result<()>;
}

/// Starting the flashing subprocess. The long-running burn itself is
/// delegated to the runner's own threads; this only launches it.
pub(crate) trait Flasher {
    fn start(&mut self) -> Result<(), BurnError>;
}

// =============================================================================
// Transition core
// =============================================================================

/// The pure state machine. Feed it classified lines, subprocess exits, and
/// timeouts; it acts through the [`Console`] and [`Flasher`] seams and
/// keeps the [`Watchdog`] deadlines in sync with the state it is in.
pub(crate) struct Machine {
    state: EngineState,
    flags: Flags,
    failure: Option<BurnError>,
    verify_warning: bool,
}

impl Machine {
    pub(crate) fn new() -> Self {
        Machine {
            state: EngineState::Init,
            flags: Flags::default(),
            failure: None,
            verify_warning: false,
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        self.state
    }

    /// Record a relay power cycle: from the engine's point of view this is
    /// a reboot it issued, so the bootloader stages arm the continuous
    /// Enter race and the prompt hunt is put on the clock.
    pub(crate) fn note_power_cycle(&mut self, watchdog: &mut Watchdog, now: Instant) {
        self.flags.reboot_sent = true;
        self.flags.login_sent = false;
        self.flags.adnl_sent = false;
        self.flags.uboot_prompt_seen_after_reboot = false;
        watchdog.start_reboot_wait(now);
    }

    /// Consume the terminal outcome. `None` while the machine is still
    /// running.
    pub(crate) fn into_outcome(self) -> Result<(), BurnError> {
        match self.state {
            EngineState::Complete => Ok(()),
            _ => Err(self.failure.unwrap_or_else(|| {
                BurnError::FlashFailure("engine stopped before completion".into())
            })),
        }
    }

    /// A line from the serial console.
    pub(crate) fn on_serial_line<C: Console, F: Flasher>(
        &mut self,
        now: Instant,
        line: &str,
        console: &mut C,
        flasher: &mut F,
        watchdog: &mut Watchdog,
    ) {
        watchdog.note_line(now);
        if self.state.is_terminal() {
            return;
        }

        let pattern = classify(line);
        if let Some(kind) = pattern {
            info!("[pattern] {:?} in: {}", kind, truncate(line, 100));
        }

        match self.state {
            EngineState::Init => self.in_init(now, pattern, console, watchdog),
            EngineState::Bootrom => self.in_bootrom(pattern, console),
            EngineState::Uboot => self.in_uboot(now, pattern, console, flasher, watchdog),
            EngineState::Download => self.in_download(now, pattern, watchdog),
            EngineState::BootVerify => self.in_boot_verify(pattern, console, watchdog),
            EngineState::Linux => self.in_linux(now, pattern, console, watchdog),
            EngineState::Login => self.in_login(now, pattern, console, watchdog),
            EngineState::Complete | EngineState::Error => {}
        }
    }

    /// A line of flashing-tool output. Only the burn markers are
    /// interpreted; everything else is already logged by the caller.
    pub(crate) fn on_burn_line(&mut self, now: Instant, line: &str, watchdog: &mut Watchdog) {
        watchdog.note_line(now);
        if self.state.is_terminal() {
            return;
        }
        match classify(line) {
            Some(PatternKind::BurnSuccess) => self.burn_succeeded(now, watchdog),
            Some(PatternKind::BurnFailure) => {
                self.fail(
                    BurnError::FlashFailure(format!("flashing tool reported: {}", line)),
                    watchdog,
                );
            }
            _ => {}
        }
    }

    /// The flashing subprocess terminated.
    pub(crate) fn on_burn_exit(&mut self, exit: BurnExit, watchdog: &mut Watchdog) {
        if self.state.is_terminal() {
            return;
        }
        if exit.success {
            info!("flashing tool completed");
            return;
        }
        let reason = match exit.code {
            Some(code) => format!("flashing tool exited with code {}", code),
            None => "flashing tool was killed by a signal".to_string(),
        };
        self.fail(BurnError::FlashFailure(reason), watchdog);
    }

    /// The serial reader died.
    pub(crate) fn on_serial_error(&mut self, reason: String, watchdog: &mut Watchdog) {
        if self.state.is_terminal() {
            return;
        }
        self.fail(
            BurnError::Io(io::Error::new(io::ErrorKind::Other, reason)),
            watchdog,
        );
    }

    /// A watchdog deadline fired.
    pub(crate) fn on_timeout(&mut self, scope: TimeoutScope, watchdog: &mut Watchdog) {
        if self.state.is_terminal() {
            return;
        }
        match scope {
            TimeoutScope::VerifyWindow => {
                // The verification window closing is a soft deadline: the
                // burn itself succeeded, we just never saw the kernel
                // banner. Complete with a recorded warning.
                if self.state == EngineState::BootVerify {
                    warn!(
                        "boot verification window closed without a kernel version line; \
                         completing anyway"
                    );
                    self.verify_warning = true;
                    watchdog.disarm_verify();
                    self.transition(EngineState::Complete, "verification timeout");
                }
            }
            scope => {
                self.fail(
                    BurnError::Timeout {
                        state: self.state.label().into(),
                        reason: scope.reason().into(),
                    },
                    watchdog,
                );
            }
        }
    }

    /// Whether verification completed only by timeout.
    pub(crate) fn verify_warning(&self) -> bool {
        self.verify_warning
    }

    // -------------------------------------------------------------------------
    // Per-state handlers
    // -------------------------------------------------------------------------

    fn in_init<C: Console>(
        &mut self,
        now: Instant,
        pattern: Option<PatternKind>,
        console: &mut C,
        watchdog: &mut Watchdog,
    ) {
        match pattern {
            Some(PatternKind::Bootrom) | Some(PatternKind::Bl2) => {
                self.transition(EngineState::Bootrom, "BootROM/BL2 detected");
            }
            Some(PatternKind::UbootVersion) => {
                self.transition(EngineState::Uboot, "U-Boot detected");
            }
            Some(PatternKind::UbootPrompt) => {
                // Board already sitting at the prompt.
                self.transition(EngineState::Uboot, "U-Boot prompt detected");
            }
            Some(PatternKind::LoginPrompt) => {
                if !self.flags.login_sent {
                    self.send(console, "root");
                    self.flags.login_sent = true;
                    self.transition(EngineState::Login, "login sent");
                }
            }
            Some(PatternKind::ShellPrompt) => {
                // Already booted to Linux: force a reboot and stay put.
                if !self.flags.reboot_sent {
                    self.reboot_recover(now, console, watchdog, "already in a shell");
                }
            }
            _ => {}
        }
        self.arm_enter_race_on_stage(pattern, console);
    }

    fn in_bootrom<C: Console>(&mut self, pattern: Option<PatternKind>, console: &mut C) {
        if let Some(PatternKind::UbootVersion) = pattern {
            self.transition(EngineState::Uboot, "U-Boot detected");
        }
        self.arm_enter_race_on_stage(pattern, console);
    }

    fn in_uboot<C: Console, F: Flasher>(
        &mut self,
        now: Instant,
        pattern: Option<PatternKind>,
        console: &mut C,
        flasher: &mut F,
        watchdog: &mut Watchdog,
    ) {
        match pattern {
            Some(PatternKind::Autoboot) => {
                // Beat the countdown.
                if let Err(e) = console.send_enter() {
                    self.fail(BurnError::Io(e), watchdog);
                    return;
                }
                info!("sent Enter to stop autoboot");
                self.stop_enter_race(console);
            }
            Some(PatternKind::UbootPrompt) => {
                if self.flags.reboot_sent && !self.flags.uboot_prompt_seen_after_reboot {
                    self.flags.uboot_prompt_seen_after_reboot = true;
                    watchdog.clear_reboot_wait();
                    self.stop_enter_race(console);
                    info!("U-Boot prompt caught after reboot");
                }
                if !self.flags.adnl_sent {
                    self.stop_enter_race(console);
                    self.send(console, "adnl");
                    self.flags.adnl_sent = true;
                    self.transition(EngineState::Download, "entered download mode");
                    if let Err(e) = flasher.start() {
                        self.fail(e, watchdog);
                    }
                }
                // Re-detection of the prompt with `adnl` already sent is a
                // no-op.
            }
            Some(PatternKind::LoginPrompt) => {
                // The board skipped download mode and booted to Linux.
                // First sighting gets a login; a repeat means we are
                // already past the prompt and merely watching Linux come
                // up. Heuristic, keyed on the flag rather than the state.
                if !self.flags.login_sent {
                    self.send(console, "root");
                    self.flags.login_sent = true;
                    self.transition(EngineState::Login, "Linux login detected, login sent");
                } else {
                    self.transition(EngineState::Linux, "Linux login detected");
                }
            }
            Some(PatternKind::ShellPrompt) => {
                if !self.flags.reboot_sent {
                    self.reboot_recover(now, console, watchdog, "autoboot was missed");
                }
            }
            _ => {}
        }
    }

    fn in_download(
        &mut self,
        now: Instant,
        pattern: Option<PatternKind>,
        watchdog: &mut Watchdog,
    ) {
        match pattern {
            Some(PatternKind::UsbReset) => info!("USB download mode active"),
            Some(PatternKind::Rebooting) => {
                info!("board rebooting after burn, monitoring boot sequence")
            }
            // The success marker usually arrives on the tool's stdout, but
            // some firmware echoes it to the console as well.
            Some(PatternKind::BurnSuccess) => self.burn_succeeded(now, watchdog),
            Some(PatternKind::BurnFailure) => self.fail(
                BurnError::FlashFailure("burn failure reported on console".into()),
                watchdog,
            ),
            _ => {}
        }
    }

    fn in_boot_verify<C: Console>(
        &mut self,
        pattern: Option<PatternKind>,
        console: &mut C,
        watchdog: &mut Watchdog,
    ) {
        match pattern {
            Some(PatternKind::LoginPrompt) => {
                if !self.flags.login_sent {
                    self.send(console, "root");
                    self.flags.login_sent = true;
                }
            }
            Some(PatternKind::ShellPrompt) => {
                if !self.flags.verify_sent {
                    self.send(console, "uname -a");
                    self.flags.verify_sent = true;
                }
            }
            Some(PatternKind::KernelVersion) => {
                info!("kernel version detected, boot verified");
                watchdog.disarm_verify();
                self.transition(EngineState::Complete, "boot verified");
            }
            _ => {}
        }
    }

    fn in_linux<C: Console>(
        &mut self,
        now: Instant,
        pattern: Option<PatternKind>,
        console: &mut C,
        watchdog: &mut Watchdog,
    ) {
        match pattern {
            Some(PatternKind::LoginPrompt) => {
                if !self.flags.login_sent {
                    self.send(console, "root");
                    self.flags.login_sent = true;
                    self.transition(EngineState::Login, "login sent");
                }
            }
            Some(PatternKind::ShellPrompt) => {
                if !self.flags.reboot_sent {
                    self.reboot_recover(now, console, watchdog, "rebooting to start over");
                }
            }
            _ => {}
        }
    }

    fn in_login<C: Console>(
        &mut self,
        now: Instant,
        pattern: Option<PatternKind>,
        console: &mut C,
        watchdog: &mut Watchdog,
    ) {
        if let Some(PatternKind::ShellPrompt) = pattern {
            if !self.flags.reboot_sent {
                self.reboot_recover(now, console, watchdog, "rebooting to start over");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// The reboot-and-recover protocol: force the board down, reset the
    /// per-cycle flags, and go back to INIT to ride the boot sequence into
    /// U-Boot.
    fn reboot_recover<C: Console>(
        &mut self,
        now: Instant,
        console: &mut C,
        watchdog: &mut Watchdog,
        why: &str,
    ) {
        self.send(console, "reboot -f");
        self.flags.reboot_sent = true;
        self.flags.login_sent = false;
        self.flags.adnl_sent = false;
        self.flags.uboot_prompt_seen_after_reboot = false;
        watchdog.start_reboot_wait(now);
        if self.state != EngineState::Init {
            self.transition(EngineState::Init, why);
        } else {
            info!("[FSM] staying in INIT: {}", why);
        }
    }

    /// After a reboot we issued, a secure-boot stage banner means the
    /// autoboot countdown is imminent: start hammering Enter.
    fn arm_enter_race_on_stage<C: Console>(
        &mut self,
        pattern: Option<PatternKind>,
        console: &mut C,
    ) {
        let stage = matches!(
            pattern,
            Some(PatternKind::Bl2) | Some(PatternKind::Bl31) | Some(PatternKind::Bl32)
        );
        if self.flags.reboot_sent && stage && !self.flags.continuous_enter_active {
            info!("bootloader stage detected after reboot, racing the autoboot countdown");
            self.flags.uboot_prompt_seen_after_reboot = false;
            if console.set_continuous_enter(true).is_ok() {
                self.flags.continuous_enter_active = true;
            }
        }
    }

    fn stop_enter_race<C: Console>(&mut self, console: &mut C) {
        if self.flags.continuous_enter_active {
            let _ = console.set_continuous_enter(false);
            self.flags.continuous_enter_active = false;
        }
    }

    fn burn_succeeded(&mut self, now: Instant, watchdog: &mut Watchdog) {
        if self.state != EngineState::Download {
            return;
        }
        info!("burn successful, waiting for the board to reboot and boot");
        self.flags.login_sent = false;
        self.flags.verify_sent = false;
        watchdog.arm_verify(now);
        self.transition(EngineState::BootVerify, "burn completed, verifying boot");
    }

    fn send<C: Console>(&mut self, console: &mut C, command: &str) {
        match console.send_command(command) {
            Ok(()) => info!("sent {:?}", command),
            Err(e) => {
                self.failure = Some(BurnError::Io(e));
                self.state = EngineState::Error;
                error!("[FSM] -> ERROR (serial write failed)");
            }
        }
    }

    fn fail(&mut self, err: BurnError, watchdog: &mut Watchdog) {
        watchdog.disarm_verify();
        watchdog.clear_reboot_wait();
        error!("[FSM] {} -> ERROR ({})", self.state.label(), err);
        self.failure = Some(err);
        self.state = EngineState::Error;
    }

    fn transition(&mut self, to: EngineState, reason: &str) {
        if self.state != to {
            info!("[FSM] {} -> {} ({})", self.state.label(), to.label(), reason);
            self.state = to;
        }
    }
}

fn truncate(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

// =============================================================================
// Live engine
// =============================================================================

/// The live console: a write handle over a cloned serial port plus the
/// cancellable continuous-Enter sender.
struct LiveConsole {
    writer: PortConsole,
    enter_port: Box<dyn serialport::SerialPort>,
    enter: Option<EnterSender>,
}

impl Console for LiveConsole {
    fn send_command(&mut self, command: &str) -> io::Result<()> {
        self.writer.send_command(command)
    }

    fn send_enter(&mut self) -> io::Result<()> {
        self.writer.send_enter()
    }

    fn send_wake(&mut self) -> io::Result<()> {
        self.writer.send_wake()
    }

    fn set_continuous_enter(&mut self, active: bool) -> io::Result<()> {
        if active {
            if self.enter.is_none() {
                let port = self
                    .enter_port
                    .try_clone()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                self.enter = Some(EnterSender::start(port));
            }
        } else if let Some(sender) = self.enter.take() {
            sender.stop();
        }
        Ok(())
    }
}

/// Launches `adnl_burn_pkg`, keeping the handle so the child is reaped or
/// killed at teardown.
struct AdnlFlasher {
    image: String,
    tx: mpsc::Sender<Event>,
    burner: Option<Burner>,
}

impl Flasher for AdnlFlasher {
    fn start(&mut self) -> Result<(), BurnError> {
        // A previous attempt that never produced a marker is aborted
        // before the retry.
        if let Some(mut old) = self.burner.take() {
            old.abort();
        }
        self.burner = Some(Burner::start(&self.image, self.tx.clone())?);
        Ok(())
    }
}

/// The public engine. Use [`factory`] to get an instance, then call
/// [`BurnEngine::run`].
pub struct BurnEngine {
    settings: Settings,
}

/// Factory function for the burn engine.
pub fn factory(settings: Settings) -> BurnEngine {
    BurnEngine { settings }
}

impl BurnEngine {
    /// Run the burn to completion.
    ///
    /// Validates the configuration (never entering the state machine on
    /// failure), opens the serial device, spawns the serial reader and the
    /// watchdog ticker, optionally power-cycles the board through the
    /// relay, and then drains the event queue until the machine reaches
    /// `COMPLETE` or `ERROR`. All producer threads are stopped and the
    /// child process reaped before this returns.
    pub fn run(&mut self) -> Result<(), BurnError> {
        let image = self.preflight()?;

        let port = open_port(&self.settings)?;
        let writer = port
            .try_clone()
            .map_err(|e| BurnError::Validation(format!("cannot clone the serial port: {}", e)))?;
        let enter_port = port
            .try_clone()
            .map_err(|e| BurnError::Validation(format!("cannot clone the serial port: {}", e)))?;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let reader = spawn_reader(port, tx.clone(), Arc::clone(&stop));
        let ticker = spawn_ticker(tx.clone(), Arc::clone(&stop));

        let mut console = LiveConsole {
            writer: PortConsole::new(writer),
            enter_port,
            enter: None,
        };
        let mut flasher = AdnlFlasher {
            image,
            tx: tx.clone(),
            burner: None,
        };

        let mut machine = Machine::new();
        let mut watchdog = Watchdog::new(Instant::now());

        // With a relay we power-cycle up front; without one the board is
        // assumed powered and the wake-up escalation nudges its console.
        if let Some(addr) = self.settings.relay.clone() {
            Relay::new(addr)?.power_cycle()?;
            machine.note_power_cycle(&mut watchdog, Instant::now());
        }

        info!("entering the main event loop");
        while let Ok(event) = rx.recv() {
            let now = Instant::now();
            match event {
                Event::SerialLine(line) => {
                    info!("[serial #{}] {}", watchdog.lines() + 1, line);
                    machine.on_serial_line(now, &line, &mut console, &mut flasher, &mut watchdog);
                }
                Event::BurnLine(line) => {
                    info!("[adnl] {}", line);
                    machine.on_burn_line(now, &line, &mut watchdog);
                }
                Event::BurnExited(exit) => machine.on_burn_exit(exit, &mut watchdog),
                Event::SerialError(reason) => machine.on_serial_error(reason, &mut watchdog),
                Event::Tick => {
                    match watchdog.wake_hint(now) {
                        Some(WakeHint::Enter) => {
                            let _ = console.send_enter();
                        }
                        Some(WakeHint::CtrlCEnter) => {
                            let _ = console.send_wake();
                        }
                        None => {}
                    }
                    if let Some(scope) = watchdog.on_tick(now, machine.state().label()) {
                        machine.on_timeout(scope, &mut watchdog);
                    }
                }
            }
            if machine.state().is_terminal() {
                break;
            }
        }

        // Teardown: stop the Enter sender and the producer threads, then
        // reap or kill the child. The serial device is released when the
        // reader thread drops its port handle.
        let _ = console.set_continuous_enter(false);
        stop.store(true, Ordering::Relaxed);
        drop(rx);
        let _ = reader.join();
        let _ = ticker.join();
        if let Some(mut burner) = flasher.burner.take() {
            burner.abort();
        }

        if machine.verify_warning() {
            warn!("completed without observing a kernel version line");
        }
        machine.into_outcome()
    }

    /// Pre-run validation: image present and plausibly sized, relay
    /// reachable when configured, a device path at all. Failures here never
    /// enter the state machine.
    fn preflight(&self) -> Result<String, BurnError> {
        if self.settings.path.is_none() {
            return Err(BurnError::Validation("no serial device configured".into()));
        }
        let image = self
            .settings
            .image
            .clone()
            .ok_or_else(|| BurnError::Validation("no image file configured".into()))?;

        let metadata = std::fs::metadata(&image)
            .map_err(|e| BurnError::Validation(format!("image file {}: {}", image, e)))?;
        if metadata.len() < MIN_IMAGE_SIZE {
            return Err(BurnError::Validation(format!(
                "image file {} is too small ({} bytes < {} bytes)",
                image,
                metadata.len(),
                MIN_IMAGE_SIZE
            )));
        }

        if let Some(addr) = &self.settings.relay {
            let relay = Relay::new(addr.clone())?;
            if !relay.is_reachable() {
                return Err(BurnError::Validation(format!(
                    "relay at {} is not reachable",
                    addr
                )));
            }
        }

        Ok(image)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Records every keystroke the machine sends.
    #[derive(Default)]
    struct MockConsole {
        commands: Vec<String>,
        enters: usize,
        wakes: usize,
        continuous: Vec<bool>,
    }

    impl Console for MockConsole {
        fn send_command(&mut self, command: &str) -> io::Result<()> {
            self.commands.push(command.to_string());
            Ok(())
        }
        fn send_enter(&mut self) -> io::Result<()> {
            self.enters += 1;
            Ok(())
        }
        fn send_wake(&mut self) -> io::Result<()> {
            self.wakes += 1;
            Ok(())
        }
        fn set_continuous_enter(&mut self, active: bool) -> io::Result<()> {
            self.continuous.push(active);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFlasher {
        starts: usize,
    }

    impl Flasher for MockFlasher {
        fn start(&mut self) -> Result<(), BurnError> {
            self.starts += 1;
            Ok(())
        }
    }

    struct Rig {
        machine: Machine,
        console: MockConsole,
        flasher: MockFlasher,
        watchdog: Watchdog,
        now: Instant,
    }

    impl Rig {
        fn new() -> Self {
            let now = Instant::now();
            Rig {
                machine: Machine::new(),
                console: MockConsole::default(),
                flasher: MockFlasher::default(),
                watchdog: Watchdog::new(now),
                now,
            }
        }

        fn serial(&mut self, line: &str) {
            self.machine.on_serial_line(
                self.now,
                line,
                &mut self.console,
                &mut self.flasher,
                &mut self.watchdog,
            );
        }

        fn burn(&mut self, line: &str) {
            self.machine.on_burn_line(self.now, line, &mut self.watchdog);
        }

        fn state(&self) -> EngineState {
            self.machine.state()
        }
    }

    #[test]
    fn unmatched_lines_never_change_state() {
        let mut rig = Rig::new();
        for line in &["mmc1: new card", "random noise", "[ 0.1] psci: probing"] {
            rig.serial(line);
            assert_eq!(rig.state(), EngineState::Init);
        }
        assert!(rig.console.commands.is_empty());
        // Activity is still refreshed for the watchdog.
        assert_eq!(rig.watchdog.lines(), 3);
    }

    #[test]
    fn bootrom_then_uboot_version_reaches_uboot() {
        let mut rig = Rig::new();
        rig.serial("chip_family_id: 0x32");
        assert_eq!(rig.state(), EngineState::Bootrom);
        rig.serial("U-Boot 2021.01 (May 27 2021)");
        assert_eq!(rig.state(), EngineState::Uboot);
    }

    #[test]
    fn duplicate_uboot_prompt_sends_adnl_once() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Download);
        let adnl = rig.console.commands.iter().filter(|c| *c == "adnl").count();
        assert_eq!(adnl, 1);
        assert_eq!(rig.flasher.starts, 1);
    }

    #[test]
    fn shell_in_uboot_recovers_and_reaches_download_again() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("root@board:~#");
        assert_eq!(rig.state(), EngineState::Init);
        assert!(rig.console.commands.contains(&"reboot -f".to_string()));
        assert!(!rig.machine.flags.adnl_sent);

        // The board comes back around through the boot sequence.
        rig.serial("chip_family_id");
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Download);
        assert!(rig.machine.flags.adnl_sent);
    }

    #[test]
    fn burn_failure_line_reaches_error_not_complete() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Download);
        rig.burn("ERR: burn failed T_T");
        assert_eq!(rig.state(), EngineState::Error);
        match rig.machine.into_outcome() {
            Err(BurnError::FlashFailure(_)) => {}
            other => panic!("expected FlashFailure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn burn_exit_failure_reaches_error() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        rig.machine.on_burn_exit(
            BurnExit {
                success: false,
                code: Some(3),
            },
            &mut rig.watchdog,
        );
        assert_eq!(rig.state(), EngineState::Error);
    }

    #[test]
    fn verify_timeout_completes_with_warning() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        rig.burn("burn successful^_^");
        assert_eq!(rig.state(), EngineState::BootVerify);

        // 30 seconds later the window closes without a kernel line.
        let later = rig.now + Duration::from_secs(30);
        let scope = rig
            .watchdog
            .on_tick(later, rig.machine.state().label())
            .expect("verify deadline should fire");
        assert_eq!(scope, TimeoutScope::VerifyWindow);
        rig.machine.on_timeout(scope, &mut rig.watchdog);
        assert_eq!(rig.state(), EngineState::Complete);
        assert!(rig.machine.verify_warning());
        assert!(rig.machine.into_outcome().is_ok());
    }

    #[test]
    fn nominal_path_end_to_end() {
        let mut rig = Rig::new();
        rig.serial("chip_family_id");
        assert_eq!(rig.state(), EngineState::Bootrom);
        rig.serial("U-Boot 2021.01");
        assert_eq!(rig.state(), EngineState::Uboot);
        rig.serial("Hit any key to stop autoboot:  1");
        assert_eq!(rig.state(), EngineState::Uboot);
        assert_eq!(rig.console.enters, 1);
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Download);
        rig.burn("burn successful^_^");
        assert_eq!(rig.state(), EngineState::BootVerify);
        rig.serial("Linux version 5.4.125 (gcc 9.4)");
        assert_eq!(rig.state(), EngineState::Complete);
        assert!(!rig.machine.verify_warning());
        assert!(rig.machine.into_outcome().is_ok());
    }

    #[test]
    fn unexpected_linux_boot_recovers_through_login() {
        let mut rig = Rig::new();
        rig.serial("buildroot login:");
        assert_eq!(rig.state(), EngineState::Login);
        assert_eq!(rig.console.commands, vec!["root".to_string()]);

        rig.serial("root@board:~#");
        assert_eq!(rig.state(), EngineState::Init);
        assert!(rig.console.commands.contains(&"reboot -f".to_string()));

        // Recovery proceeds as the nominal path.
        rig.serial("chip_family_id");
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Download);
        assert_eq!(rig.flasher.starts, 1);
    }

    #[test]
    fn repeated_login_prompt_in_uboot_means_linux_booting() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        assert_eq!(rig.state(), EngineState::Uboot);
        // A login already answered this cycle means a second prompt is the
        // board booting on into Linux, not a fresh login to take.
        rig.machine.flags.login_sent = true;

        rig.serial("buildroot login:");
        assert_eq!(rig.state(), EngineState::Linux);
        assert!(rig.console.commands.is_empty());

        // The shell prompt confirms Linux is up; recovery reboots the
        // board and resets the per-cycle flags.
        rig.serial("root@board:~#");
        assert_eq!(rig.state(), EngineState::Init);
        assert_eq!(rig.console.commands, vec!["reboot -f".to_string()]);
        assert!(!rig.machine.flags.login_sent);
        assert!(rig.machine.flags.reboot_sent);
    }

    #[test]
    fn linux_state_takes_a_fresh_login_prompt() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.machine.flags.login_sent = true;
        rig.serial("buildroot login:");
        assert_eq!(rig.state(), EngineState::Linux);

        // Getty restarting clears the session; the next prompt is real.
        rig.machine.flags.login_sent = false;
        rig.serial("buildroot login:");
        assert_eq!(rig.state(), EngineState::Login);
        assert_eq!(rig.console.commands, vec!["root".to_string()]);
    }

    #[test]
    fn verification_answers_login_and_shell_prompts() {
        let mut rig = Rig::new();
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        rig.burn("burn successful");
        rig.serial("buildroot login:");
        assert_eq!(rig.state(), EngineState::BootVerify);
        rig.serial("root@board:~#");
        assert_eq!(rig.state(), EngineState::BootVerify);
        assert_eq!(
            rig.console.commands,
            vec!["adnl".to_string(), "root".to_string(), "uname -a".to_string()]
        );
        rig.serial("Linux board 5.4.125 #1 SMP PREEMPT aarch64 GNU/Linux");
        assert_eq!(rig.state(), EngineState::Complete);
    }

    #[test]
    fn global_timeout_from_init_is_an_error() {
        let mut rig = Rig::new();
        rig.machine
            .on_timeout(TimeoutScope::NoFirstData, &mut rig.watchdog);
        assert_eq!(rig.state(), EngineState::Error);
        match rig.machine.into_outcome() {
            Err(BurnError::Timeout { state, reason }) => {
                assert_eq!(state, "INIT");
                assert_eq!(reason, "no serial data");
            }
            other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn stage_banner_after_reboot_arms_the_enter_race() {
        let mut rig = Rig::new();
        rig.serial("root@board:~#");
        assert_eq!(rig.state(), EngineState::Init);

        rig.serial("BL2 Built : 15:21:22");
        assert_eq!(rig.console.continuous, vec![true]);
        assert_eq!(rig.state(), EngineState::Bootrom);

        // Prompt caught: the race stops and adnl goes out.
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        assert!(rig.console.continuous.contains(&false));
        assert_eq!(rig.state(), EngineState::Download);
    }

    #[test]
    fn power_cycle_arms_recovery_flags() {
        let mut rig = Rig::new();
        rig.machine.note_power_cycle(&mut rig.watchdog, rig.now);
        rig.serial("NOTICE:  BL31: v2.4(release)");
        assert_eq!(rig.console.continuous, vec![true]);

        // Autoboot missed: the reboot-wait deadline eventually fires.
        let later = rig.now + Duration::from_secs(31);
        rig.watchdog.note_line(rig.now);
        let scope = rig.watchdog.on_tick(later, "INIT");
        assert_eq!(scope, Some(TimeoutScope::AutobootMissed));
    }

    #[test]
    fn terminal_states_ignore_further_events() {
        let mut rig = Rig::new();
        rig.machine
            .on_timeout(TimeoutScope::GlobalInactivity, &mut rig.watchdog);
        assert_eq!(rig.state(), EngineState::Error);
        rig.serial("U-Boot 2021.01");
        rig.serial("s4_polaris#");
        assert_eq!(rig.state(), EngineState::Error);
        assert_eq!(rig.flasher.starts, 0);
    }
}
