//! Serial console access: opening the device, the reader thread that turns
//! the raw byte stream into line events, and the write-side helpers that
//! type commands at the board.
//!
//! The reader never blocks indefinitely: it polls `bytes_to_read` and reads
//! exactly what is available, so liveness ("no bytes for N seconds") can be
//! computed by the watchdog without a dedicated clock thread. Boot consoles
//! are only partially line-buffered; prompts in particular arrive without a
//! trailing newline, so a non-empty partial buffer is flushed as a line
//! after a short quiet period.

use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use hexplay::HexViewBuilder;
use log::{debug, error, info, log_enabled, trace, Level::Debug};
use serialport::SerialPort;

use crate::engine::events::Event;
use crate::settings::Settings;

/// How long a partial (newline-less) buffer may sit before it is flushed as
/// a line. Prompts like `s4_polaris# ` only ever arrive this way.
const PARTIAL_FLUSH: Duration = Duration::from_millis(500);

/// Inter-character delay when typing a command, so slow UART consoles do
/// not drop keystrokes.
const KEY_DELAY: Duration = Duration::from_millis(2);

// =============================================================================
// Opening the device
// =============================================================================

/// Open and configure the serial device from `settings`.
///
/// Retries a few times with a fixed delay because USB serial controllers
/// often need a moment after enumeration. A device that is absent or held
/// by another process surfaces as a descriptive [`serialport::Error`].
pub(crate) fn open_port(settings: &Settings) -> Result<Box<dyn SerialPort>, serialport::Error> {
    use retry::{delay, retry_with_index};

    let path = match settings.path.clone() {
        Some(path) => path,
        None => {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "no serial device configured",
            ))
        }
    };

    let result = retry_with_index(
        delay::Fixed::from_millis(1000).take(4),
        |index| -> Result<Box<dyn SerialPort>, serialport::Error> {
            debug!("Trying to open {} (attempt {})", path, index);
            serialport::new(&path, settings.baud_rate)
                .data_bits(settings.data_bits)
                .stop_bits(settings.stop_bits)
                .parity(settings.parity)
                .flow_control(settings.flow_control)
                .timeout(Duration::from_millis(100))
                .open()
        },
    );

    match result {
        Ok(port) => {
            info!(
                "Connected to {} at {} baud",
                port.name().unwrap_or_else(|| path.clone()),
                settings.baud_rate
            );
            debug!("data_bits    : {:#?}", port.data_bits());
            debug!("stop_bits    : {:#?}", port.stop_bits());
            debug!("parity       : {:#?}", port.parity());
            debug!("flow control : {:#?}", port.flow_control());
            Ok(port)
        }
        Err(err) => match err {
            retry::Error::Operation {
                error,
                total_delay,
                tries,
            } => {
                error!(
                    "Failed to open {} after {:?} and {} tries: {}",
                    path, total_delay, tries, error,
                );
                Err(error)
            }
            retry::Error::Internal(_) => Err(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "internal error while retrying to open the port",
            )),
        },
    }
}

// =============================================================================
// Reader thread
// =============================================================================

/// Spawn the serial reader thread.
///
/// Reads whatever is available on `port`, reassembles lines, and sends each
/// one as [`Event::SerialLine`] on `tx`. Terminates when `stop` is set or
/// when the port dies, in which case a single [`Event::SerialError`] is sent
/// first.
pub(crate) fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    tx: Sender<Event>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            info!("serial reader started");
            let mut assembler = LineAssembler::new();
            let mut last_data = Instant::now();

            while !stop.load(Ordering::Relaxed) {
                match port.bytes_to_read() {
                    Ok(available) if available > 0 => {
                        // Read only what is already buffered (capped at 4K)
                        // so the read returns immediately.
                        let mut chunk = vec![0u8; std::cmp::min(available, 4096) as usize];
                        match port.read(&mut chunk) {
                            Ok(n) => {
                                last_data = Instant::now();
                                trace!("read {} bytes from serial port", n);
                                if log_enabled!(Debug) {
                                    let view = HexViewBuilder::new(&chunk[..n])
                                        .address_offset(0)
                                        .row_width(16)
                                        .finish();
                                    debug!("serial chunk:\n{}", view);
                                }
                                for line in assembler.push(&chunk[..n]) {
                                    if tx.send(Event::SerialLine(line)).is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                            Err(e) => {
                                let _ = tx.send(Event::SerialError(e.to_string()));
                                return;
                            }
                        }
                    }
                    Ok(_) => {
                        // Nothing buffered. If a partial line has been
                        // sitting long enough, flush it; prompts never get
                        // their newline.
                        if last_data.elapsed() > PARTIAL_FLUSH {
                            if let Some(line) = assembler.take_partial() {
                                if tx.send(Event::SerialLine(line)).is_err() {
                                    return;
                                }
                            }
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => {
                        let _ = tx.send(Event::SerialError(e.to_string()));
                        return;
                    }
                }
            }
            info!("serial reader stopped");
        })
        .expect("failed to spawn the serial reader thread")
}

// =============================================================================
// Write side
// =============================================================================

/// Write-side handle over a cloned port. Writes never block on incoming
/// data; the reader owns its own clone.
pub(crate) struct PortConsole {
    port: Box<dyn SerialPort>,
}

impl PortConsole {
    pub(crate) fn new(port: Box<dyn SerialPort>) -> Self {
        PortConsole { port }
    }

    /// Type `command` at the console: a leading Ctrl-C to clear anything
    /// half-typed, the command one character at a time, then a carriage
    /// return.
    pub(crate) fn send_command(&mut self, command: &str) -> std::io::Result<()> {
        self.port.write_all(b"\x03")?;
        thread::sleep(KEY_DELAY);
        for ch in command.bytes() {
            self.port.write_all(&[ch])?;
            thread::sleep(KEY_DELAY);
        }
        self.port.write_all(b"\r")?;
        debug!("sent command: {:?}", command);
        Ok(())
    }

    /// A single Enter keystroke.
    pub(crate) fn send_enter(&mut self) -> std::io::Result<()> {
        self.port.write_all(b"\r")
    }

    /// Ctrl-C followed by Enter, used to wake a board that is sitting in
    /// download mode with no console prompt.
    pub(crate) fn send_wake(&mut self) -> std::io::Result<()> {
        self.port.write_all(b"\x03")?;
        thread::sleep(Duration::from_millis(100));
        self.port.write_all(b"\r")?;
        Ok(())
    }
}

/// The continuous-Enter sender: a cancellable thread hammering CR at 1 ms
/// intervals to win the race against a bootloader's zero-delay autoboot
/// countdown after a reboot.
pub(crate) struct EnterSender {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EnterSender {
    /// Start sending. The first Enter goes out synchronously before the
    /// thread spins up; the countdown can be that short.
    pub(crate) fn start(mut port: Box<dyn SerialPort>) -> Self {
        info!("starting continuous Enter (1 ms interval)");
        let _ = port.write_all(b"\r");

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("enter-sender".into())
            .spawn(move || {
                let mut count: u64 = 1;
                while !stop2.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(1));
                    if port.write_all(b"\r").is_err() {
                        break;
                    }
                    count += 1;
                    if count % 1000 == 0 {
                        trace!("sent {} Enter keystrokes", count);
                    }
                }
                info!("stopped continuous Enter after {} keystrokes", count);
            })
            .expect("failed to spawn the Enter sender thread");

        EnterSender {
            stop,
            handle: Some(handle),
        }
    }

    /// Stop the sender and join its thread.
    pub(crate) fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for EnterSender {
    // The sender must not leak past the run even if nobody called `stop`.
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// =============================================================================
// Line assembly
// =============================================================================

/// Reassembles newline-delimited lines out of arbitrarily chunked reads and
/// scrubs them for the pattern matcher.
pub(crate) struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub(crate) fn new() -> Self {
        LineAssembler { buffer: Vec::new() }
    }

    /// Feed a chunk of raw bytes; returns the complete lines it finished,
    /// already cleaned. Empty lines are dropped.
    pub(crate) fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.buffer, rest);
            let line = clean_line(&raw);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Flush the partial buffer as a line, if it cleans to anything.
    pub(crate) fn take_partial(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        let line = clean_line(&raw);
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Decode a raw line, drop ANSI escape sequences and stray control
/// characters, and trim surrounding whitespace. Boot consoles mix colors,
/// cursor movement and cursor-position responses into the text.
fn clean_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequence: ESC [ <params> <final byte in @..~>
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&n) = chars.peek() {
                    chars.next();
                    if ('@'..='~').contains(&n) {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() {
            continue;
        }
        out.push(c);
    }
    out.trim().to_string()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_lines_across_read_boundaries() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"U-Boot 20").is_empty());
        let lines = asm.push(b"21.01\r\nHit any");
        assert_eq!(lines, vec!["U-Boot 2021.01".to_string()]);
        let lines = asm.push(b" key to stop autoboot\n");
        assert_eq!(lines, vec!["Hit any key to stop autoboot".to_string()]);
    }

    #[test]
    fn multiple_lines_in_one_chunk() {
        let mut asm = LineAssembler::new();
        let lines = asm.push(b"one\ntwo\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn partial_flush_recovers_prompts() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"s4_polaris# ").is_empty());
        assert_eq!(asm.take_partial(), Some("s4_polaris#".to_string()));
        assert_eq!(asm.take_partial(), None);
    }

    #[test]
    fn blank_lines_are_dropped() {
        let mut asm = LineAssembler::new();
        assert!(asm.push(b"\r\n\r\n   \r\n").is_empty());
    }

    #[test]
    fn strips_ansi_color_and_cursor_codes() {
        assert_eq!(clean_line(b"\x1b[31mError\x1b[0m: boom"), "Error: boom");
        assert_eq!(clean_line(b"\x1b[2;3Hlogin:"), "login:");
        assert_eq!(clean_line(b"\x1b[?25hready"), "ready");
    }

    #[test]
    fn strips_control_characters() {
        assert_eq!(clean_line(b"ok\x07\x00 done\x7f"), "ok done");
    }
}
