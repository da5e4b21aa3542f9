// src/drivers/error.rs
use std::path::PathBuf;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("step delay must be in (0, 5000] ms, got {0}")]
    InvalidStepDelay(f64),
    #[error("gate voltages must satisfy -1.5 <= min < max <= 1.5, got min={v_min} max={v_max}")]
    InvalidVoltageRange { v_min: f64, v_max: f64 },
    #[error("gate voltage must satisfy -1.5 <= gate <= 1.5, got {0}")]
    InvalidGateVoltage(f64),
    #[error("a sweep is already running; stop it first")]
    AlreadyRunning,
    #[error("no serial device with USB vendor id 0x{vid:04X} found")]
    DeviceNotFound { vid: u16 },
    #[error("device link is not open")]
    LinkClosed,
    #[error("cannot open CSV sink at {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
impl AcquisitionError {
    /// Errors raised from operator input before any device or file is touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AcquisitionError::InvalidStepDelay(_)
                | AcquisitionError::InvalidVoltageRange { .. }
                | AcquisitionError::InvalidGateVoltage(_)
        )
    }
    /// Errors from discovering or opening the device.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            AcquisitionError::DeviceNotFound { .. } | AcquisitionError::Serial(_)
        )
    }
}
/// Reason a device line was rejected. Malformed lines are dropped, never raised.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MalformedRecord {
    #[error("expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },
    #[error("field {index} ({text:?}) is not a valid number")]
    BadField { index: usize, text: String },
}
