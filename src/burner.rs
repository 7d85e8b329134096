//! The flashing subprocess runner.
//!
//! `adnl_burn_pkg` pushes the image to the board over USB while the serial
//! console stays open; the hardware multiplexes both during the flash, so
//! the serial reader keeps running for the whole lifetime of this process.
//! The tool's stdout/stderr lines are the only channel for success/failure
//! detection; no structured contract beyond the exit status is assumed.

use std::{
    io::{BufRead, BufReader},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread,
    time::Duration,
};

use log::{error, info};

use crate::engine::events::{BurnExit, Event};
use crate::error::BurnError;

/// Handle to a running flash. The child process is owned by a reaper
/// thread; the handle only carries the abort flag, so the engine can tear
/// the flash down without ever blocking on it.
pub(crate) struct Burner {
    abort: Arc<AtomicBool>,
    reaper: Option<thread::JoinHandle<()>>,
}

impl Burner {
    /// Launch `sudo adnl_burn_pkg -p <image> -r 1` and stream its output.
    ///
    /// Every line of stdout and stderr becomes an [`Event::BurnLine`];
    /// process termination is reported exactly once as
    /// [`Event::BurnExited`]. A launch failure (binary missing, permission
    /// denied) is a [`BurnError::SubprocessLaunch`], distinct from a flash
    /// that started and then failed.
    pub(crate) fn start(image: &str, tx: Sender<Event>) -> Result<Burner, BurnError> {
        let cmd = ["sudo", "adnl_burn_pkg", "-p", image, "-r", "1"];
        info!("executing: {}", cmd.join(" "));

        let mut child = Command::new(cmd[0])
            .args(&cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BurnError::SubprocessLaunch(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BurnError::SubprocessLaunch("no stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BurnError::SubprocessLaunch("no stderr pipe".into()))?;

        spawn_line_pump("burn-stdout", stdout, tx.clone());
        spawn_line_pump("burn-stderr", stderr, tx.clone());

        let abort = Arc::new(AtomicBool::new(false));
        let abort2 = Arc::clone(&abort);
        let reaper = thread::Builder::new()
            .name("burn-reaper".into())
            .spawn(move || loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        info!("flashing tool exited with {}", status);
                        let _ = tx.send(Event::BurnExited(BurnExit {
                            success: status.success(),
                            code: status.code(),
                        }));
                        break;
                    }
                    Ok(None) => {
                        if abort2.load(Ordering::Relaxed) {
                            let _ = child.kill();
                            let _ = child.wait();
                            info!("flashing tool killed on teardown");
                            break;
                        }
                        thread::sleep(Duration::from_millis(200));
                    }
                    Err(e) => {
                        error!("failed to poll the flashing tool: {}", e);
                        let _ = tx.send(Event::BurnExited(BurnExit {
                            success: false,
                            code: None,
                        }));
                        break;
                    }
                }
            })
            .map_err(|e| BurnError::SubprocessLaunch(e.to_string()))?;

        Ok(Burner {
            abort,
            reaper: Some(reaper),
        })
    }

    /// Kill the child if it is still running and wait for the reaper. The
    /// subprocess never outlives the run.
    pub(crate) fn abort(&mut self) {
        self.abort.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Burner {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Pump one pipe line-by-line into the event queue. The thread ends at EOF,
/// which arrives when the child closes its side.
fn spawn_line_pump<R: std::io::Read + Send + 'static>(name: &str, pipe: R, tx: Sender<Event>) {
    let _ = thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            let reader = BufReader::new(pipe);
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(Event::BurnLine(line)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("failed to spawn the burn output pump thread");
}
