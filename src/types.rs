// src/types.rs
use std::path::PathBuf;
use crate::drivers::{AcquisitionError, RecordSchema, SweepSnapshot, N_CHANNELS};
/// Gate voltages the SMU can apply.
pub const GATE_LIMIT_V: f64 = 1.5;
/// Longest accepted delay between sweep steps.
pub const MAX_STEP_DELAY_MS: f64 = 5000.0;
// Acquisition mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SweepMode {
    /// Gate voltage sweep; Dirac points after every `DONE`.
    VoltageSweep,
    /// Fixed gate, current versus time.
    TimeSweep,
    /// Voltage sweeps repeated back to back to follow the Dirac point.
    DiracTracking,
    /// Fixed gate, older firmware with a drain voltage column.
    LegacyTimeSweep,
}
impl SweepMode {
    pub fn schema(self) -> RecordSchema {
        match self {
            SweepMode::VoltageSweep | SweepMode::DiracTracking => RecordSchema::VoltageSweep,
            SweepMode::TimeSweep => RecordSchema::TimeSweep,
            SweepMode::LegacyTimeSweep => RecordSchema::LegacyTimeSweep,
        }
    }
    pub fn tracks_dirac(self) -> bool {
        matches!(self, SweepMode::VoltageSweep | SweepMode::DiracTracking)
    }
    /// `DONE` ends the whole session rather than a single sweep.
    pub fn is_single_shot(self) -> bool {
        matches!(self, SweepMode::TimeSweep | SweepMode::LegacyTimeSweep)
    }
    /// The start command is sent again after every completed sweep.
    pub fn repeats(self) -> bool {
        matches!(self, SweepMode::DiracTracking)
    }
    pub fn derives_rate(self) -> bool {
        matches!(self, SweepMode::TimeSweep)
    }
}
/// Operator input for one acquisition run.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepParameters {
    pub mode: SweepMode,
    pub v_min: f64,
    pub v_max: f64,
    pub gate_voltage: f64,
    pub step_delay_ms: f64,
    pub output_path: PathBuf,
}
impl SweepParameters {
    pub fn validate(&self) -> Result<(), AcquisitionError> {
        // NaN fails every comparison below, so it is rejected too
        if !(self.step_delay_ms > 0.0 && self.step_delay_ms <= MAX_STEP_DELAY_MS) {
            return Err(AcquisitionError::InvalidStepDelay(self.step_delay_ms));
        }
        match self.mode {
            SweepMode::VoltageSweep | SweepMode::DiracTracking => {
                if !(-GATE_LIMIT_V <= self.v_min
                    && self.v_min < self.v_max
                    && self.v_max <= GATE_LIMIT_V)
                {
                    return Err(AcquisitionError::InvalidVoltageRange {
                        v_min: self.v_min,
                        v_max: self.v_max,
                    });
                }
            }
            SweepMode::TimeSweep | SweepMode::LegacyTimeSweep => {
                if !(-GATE_LIMIT_V..=GATE_LIMIT_V).contains(&self.gate_voltage) {
                    return Err(AcquisitionError::InvalidGateVoltage(self.gate_voltage));
                }
            }
        }
        Ok(())
    }
    /// Lines sent to the firmware to begin one sweep cycle.
    pub fn start_commands(&self) -> Vec<String> {
        match self.mode {
            SweepMode::VoltageSweep | SweepMode::DiracTracking => vec![format!(
                "start,{},{},{}",
                self.v_min, self.v_max, self.step_delay_ms
            )],
            SweepMode::TimeSweep => vec![format!(
                "start,{},{}",
                self.gate_voltage, self.step_delay_ms
            )],
            SweepMode::LegacyTimeSweep => {
                vec![self.gate_voltage.to_string(), "start".to_string()]
            }
        }
    }
}
/// Per-sweep Dirac summary.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct SweepSummary {
    pub sweep_index: u64,
    pub time_since_start: f64,
    pub dirac_voltages: [Option<f64>; N_CHANNELS],
}
#[derive(Clone, Debug, PartialEq)]
pub enum EndReason {
    /// Operator stop.
    Stopped,
    /// The device sent `DONE` in a single-shot mode.
    Completed,
    /// An I/O error ended the run.
    Failed(String),
}
// Commands sent to the acquisition thread
#[derive(Clone, Debug)]
pub enum SessionCommand {
    Start(SweepParameters),
    Stop,
    Shutdown,
}
// Messages from the acquisition thread
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Log(String),
    Status(bool),
    Snapshot(SweepSnapshot),
    SweepCompleted(SweepSummary),
    Finished(EndReason),
    Error(String),
}
