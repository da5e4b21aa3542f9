// src/drivers/record.rs
use crate::drivers::MalformedRecord;
/// Number of SMU channels on the board.
pub const N_CHANNELS: usize = 16;
/// Line sent by the firmware when a sweep (or the whole run) is finished.
pub const DONE_SENTINEL: &str = "DONE";
/// Column layout of the records streamed by the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordSchema {
    /// `step,time,v_gate,I0..I15`
    VoltageSweep,
    /// `time,I0..I15`
    TimeSweep,
    /// `step,time,v_drain,v_gate,I0..I15`
    LegacyTimeSweep,
}
impl RecordSchema {
    pub fn field_count(self) -> usize {
        self.leading_fields() + N_CHANNELS
    }
    fn leading_fields(self) -> usize {
        match self {
            RecordSchema::VoltageSweep => 3,
            RecordSchema::TimeSweep => 1,
            RecordSchema::LegacyTimeSweep => 4,
        }
    }
    /// True when the x axis of the live buffers is the gate voltage.
    pub fn plots_against_gate(self) -> bool {
        matches!(self, RecordSchema::VoltageSweep)
    }
    pub fn has_drain_voltage(self) -> bool {
        matches!(self, RecordSchema::LegacyTimeSweep)
    }
    /// Parses one trimmed, non-sentinel line.
    pub fn parse(self, line: &str) -> Result<SweepRecord, MalformedRecord> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != self.field_count() {
            return Err(MalformedRecord::FieldCount {
                expected: self.field_count(),
                actual: parts.len(),
            });
        }
        let float = |index: usize| -> Result<f64, MalformedRecord> {
            parts[index]
                .parse::<f64>()
                .map_err(|_| MalformedRecord::BadField {
                    index,
                    text: parts[index].to_string(),
                })
        };
        let step = |index: usize| -> Result<u64, MalformedRecord> {
            parts[index]
                .parse::<u64>()
                .map_err(|_| MalformedRecord::BadField {
                    index,
                    text: parts[index].to_string(),
                })
        };
        let (sequence_index, elapsed_time, drain_voltage, gate_voltage) = match self {
            RecordSchema::VoltageSweep => (Some(step(0)?), float(1)?, None, Some(float(2)?)),
            RecordSchema::TimeSweep => (None, float(0)?, None, None),
            RecordSchema::LegacyTimeSweep => {
                (Some(step(0)?), float(1)?, Some(float(2)?), Some(float(3)?))
            }
        };
        let offset = self.leading_fields();
        let mut currents = [0.0f64; N_CHANNELS];
        for (ch, slot) in currents.iter_mut().enumerate() {
            *slot = float(offset + ch)?;
        }
        Ok(SweepRecord {
            sequence_index,
            elapsed_time,
            drain_voltage,
            gate_voltage,
            currents,
        })
    }
}
/// One accepted line of instrument data. Currents are in amperes.
#[derive(Clone, Debug, PartialEq)]
pub struct SweepRecord {
    pub sequence_index: Option<u64>,
    pub elapsed_time: f64,
    pub drain_voltage: Option<f64>,
    pub gate_voltage: Option<f64>,
    pub currents: [f64; N_CHANNELS],
}
impl SweepRecord {
    pub fn currents_microamps(&self) -> [f64; N_CHANNELS] {
        self.currents.map(|amps| amps * 1e6)
    }
}
/// What a raw line from the device turned out to be.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceLine {
    Empty,
    Done,
    Record(SweepRecord),
    Malformed(MalformedRecord),
}
pub fn classify_line(schema: RecordSchema, raw: &str) -> DeviceLine {
    let line = raw.trim();
    if line.is_empty() {
        DeviceLine::Empty
    } else if line == DONE_SENTINEL {
        DeviceLine::Done
    } else {
        match schema.parse(line) {
            Ok(record) => DeviceLine::Record(record),
            Err(reason) => DeviceLine::Malformed(reason),
        }
    }
}
