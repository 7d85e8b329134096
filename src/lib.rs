//! Amlburn flashes firmware images onto Amlogic-based boards over their
//! serial console, unattended. Point it at a USB tty device and an image
//! file and it rides the board's boot sequence: it catches the BootROM and
//! BL2 banners, stops the U-Boot autoboot countdown, switches the board
//! into USB download mode with the `adnl` command, drives the vendor
//! `adnl_burn_pkg` tool through the actual burn, and finally watches the
//! freshly flashed system boot to confirm a kernel came up.
//!
//! The serial console of a booting board is noisy, fragmented, and only
//! loosely ordered, so the heart of `amlburn` is an event-driven state
//! machine rather than a script of expect/send pairs:
//!
//! * Producer threads turn raw bytes from the serial port, output from the
//!   flashing tool, and the passage of time into typed **events** on a
//!   single ordered queue.
//! * The engine is the queue's only consumer, so all state lives on one
//!   thread and every decision sees events in the order they happened.
//! * Each console line is classified against an ordered set of pattern
//!   rules; the first match wins, which lets specific banners shadow the
//!   generic ones they contain.
//! * Boards that wander off the nominal path (boot straight into Linux,
//!   miss the autoboot window, sit at a login prompt) are forced around
//!   again with a reboot, with a millisecond-interval Enter hammer racing
//!   the next autoboot countdown.
//!
//! A layered watchdog keeps a dead or wedged board from hanging the run
//! forever, and an optional Tasmota-style network relay lets `amlburn`
//! power-cycle the board itself before starting.

mod burner;
mod engine;
mod error;
mod patterns;
mod relay;
mod serial;
mod settings;
mod watchdog;

pub use engine::{factory, BurnEngine};
pub use error::BurnError;
pub use relay::Relay;
pub use settings::{Settings, SettingsBuilder};
