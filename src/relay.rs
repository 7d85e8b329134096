//! Network power relay (Tasmota) used to power-cycle the target board.
//!
//! The relay is optional: when no address is configured the operator
//! power-cycles manually and none of this is invoked.

use std::{thread, time::Duration};

use log::{info, warn};
use reqwest::blocking::Client;

use crate::error::BurnError;

/// How long the board stays off during a power cycle, so the capacitors
/// actually discharge.
const OFF_DELAY: Duration = Duration::from_secs(3);

/// Settle time after power-on before the boot chatter is expected.
const ON_DELAY: Duration = Duration::from_secs(5);

/// Client for a Tasmota relay reachable over plain HTTP.
pub struct Relay {
    addr: String,
    client: Client,
}

impl Relay {
    pub fn new(addr: impl Into<String>) -> Result<Self, BurnError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BurnError::Validation(format!("relay HTTP client: {}", e)))?;
        Ok(Relay {
            addr: addr.into(),
            client,
        })
    }

    /// Whether the relay answers its status endpoint with a parseable
    /// power state.
    pub fn is_reachable(&self) -> bool {
        match self.power_state() {
            Ok(state) => {
                info!("relay at {} is reachable, power is {}", self.addr, state);
                true
            }
            Err(_) => false,
        }
    }

    /// Query the current power state (`ON` or `OFF`). Tasmota answers the
    /// bare `Power` command with a JSON body like `{"POWER":"ON"}`.
    pub fn power_state(&self) -> Result<String, BurnError> {
        let url = format!("http://{}/cm?cmnd=Power", self.addr);
        let response = self
            .client
            .get(&url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| BurnError::Validation(format!("relay at {}: {}", self.addr, e)))?;
        let body: serde_json::Value = response
            .json()
            .map_err(|e| BurnError::Validation(format!("relay at {}: {}", self.addr, e)))?;
        parse_power_state(&body).map(str::to_string).ok_or_else(|| {
            BurnError::Validation(format!(
                "relay at {} returned an unexpected status response",
                self.addr
            ))
        })
    }

    pub fn power_on(&self) -> Result<(), BurnError> {
        self.command("Power%20ON")?;
        info!("relay power ON sent to {}", self.addr);
        Ok(())
    }

    pub fn power_off(&self) -> Result<(), BurnError> {
        self.command("Power%20OFF")?;
        info!("relay power OFF sent to {}", self.addr);
        Ok(())
    }

    /// Power cycle the board: off, wait for discharge, on, wait for the
    /// console to come up. A failing OFF is only a warning since the board
    /// may already be off; a failing ON is fatal for the cycle.
    pub fn power_cycle(&self) -> Result<(), BurnError> {
        info!("power cycling the board via {}", self.addr);
        if let Err(e) = self.power_off() {
            warn!("relay power OFF failed: {}", e);
        }
        thread::sleep(OFF_DELAY);
        self.power_on()?;
        thread::sleep(ON_DELAY);
        Ok(())
    }

    fn command(&self, cmnd: &str) -> Result<(), BurnError> {
        let url = format!("http://{}/cm?cmnd={}", self.addr, cmnd);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| BurnError::Validation(format!("relay at {}: {}", self.addr, e)))?;
        response
            .error_for_status()
            .map_err(|e| BurnError::Validation(format!("relay at {}: {}", self.addr, e)))?;
        Ok(())
    }
}

/// Extract the `POWER` field out of a Tasmota status body. Multi-channel
/// relays report `POWER1` instead of `POWER`.
fn parse_power_state(body: &serde_json::Value) -> Option<&str> {
    body.get("POWER")
        .or_else(|| body.get("POWER1"))
        .and_then(|v| v.as_str())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_the_tasmota_power_status() {
        assert_eq!(parse_power_state(&json!({"POWER": "ON"})), Some("ON"));
        assert_eq!(parse_power_state(&json!({"POWER": "OFF"})), Some("OFF"));
        assert_eq!(parse_power_state(&json!({"POWER1": "ON"})), Some("ON"));
    }

    #[test]
    fn rejects_bodies_without_a_power_field() {
        assert_eq!(parse_power_state(&json!({})), None);
        assert_eq!(parse_power_state(&json!({"Status": 0})), None);
        assert_eq!(parse_power_state(&json!({"POWER": 1})), None);
    }
}
