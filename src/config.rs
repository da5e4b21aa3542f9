// src/config.rs
use std::fs;
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
/// Teensy boards enumerate with this USB vendor id.
pub const TEENSY_VID: u16 = 0x16C0;
/// Settings for talking to the SMU board. Every field has a default so a
/// config file only needs the values that differ.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Fixed port name; when unset the port is discovered by `usb_vid`.
    pub port_name: Option<String>,
    pub usb_vid: u16,
    pub baud_rate: u32,
    /// Upper bound for assembling one line from the device.
    pub read_timeout_ms: u64,
    /// Length of each blocking read; cancellation is checked between slices.
    pub poll_slice_ms: u64,
    /// Longest unterminated line kept while waiting for its newline.
    pub max_line_bytes: usize,
    /// Time DTR is held low during the reset handshake.
    pub reset_settle_ms: u64,
    /// Sliding window of points kept per channel during time sweeps.
    pub time_window_points: usize,
    /// Pause before the next cycle of a Dirac-tracking run.
    pub tracking_pause_ms: u64,
    /// Minimum interval between snapshots sent to the display layer.
    pub snapshot_interval_ms: u64,
}
impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            port_name: None,
            usb_vid: TEENSY_VID,
            baud_rate: 115_200,
            read_timeout_ms: 2_000,
            poll_slice_ms: 50,
            max_line_bytes: 4_096,
            reset_settle_ms: 50,
            time_window_points: 4_000,
            tracking_pause_ms: 50,
            snapshot_interval_ms: 100,
        }
    }
}
impl AcquisitionConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms.max(1))
    }
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }
    pub fn tracking_pause(&self) -> Duration {
        Duration::from_millis(self.tracking_pause_ms)
    }
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "port_name": "COM6", "read_timeout_ms": 1000 }}"#).unwrap();
        let config = AcquisitionConfig::load(file.path()).unwrap();
        assert_eq!(config.port_name.as_deref(), Some("COM6"));
        assert_eq!(config.read_timeout(), Duration::from_secs(1));
        assert_eq!(config.usb_vid, TEENSY_VID);
        assert_eq!(config.time_window_points, 4_000);
    }
    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(AcquisitionConfig::load(file.path()).is_err());
    }
}
