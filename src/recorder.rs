// src/recorder.rs
use std::fs::File;
use std::path::{Path, PathBuf};
use log::info;
use crate::drivers::{AcquisitionError, N_CHANNELS};
use crate::types::SweepMode;
/// Column layout of the CSV written for a given mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsvLayout {
    pub drain_column: bool,
    pub rate_columns: bool,
    pub dirac_columns: bool,
}
impl CsvLayout {
    pub fn for_mode(mode: SweepMode) -> Self {
        Self {
            drain_column: mode.schema().has_drain_voltage(),
            rate_columns: mode.derives_rate(),
            dirac_columns: mode.tracks_dirac(),
        }
    }
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = vec!["SWEEP_IDX".into(), "POINT".into(), "TIME".into()];
        if self.drain_column {
            header.push("V_DRAIN".into());
        }
        header.push("V_GATE".into());
        header.extend((0..N_CHANNELS).map(|i| format!("I_CH{i}")));
        if self.rate_columns {
            header.extend((0..N_CHANNELS).map(|i| format!("DI/DT{i}")));
        }
        if self.dirac_columns {
            header.push("DIRAC_SWEEP_IDX".into());
            header.extend((0..N_CHANNELS).map(|i| format!("DIRAC_V_CH{i}")));
        }
        header
    }
    /// Columns filled by a data row; Dirac rows leave exactly these empty.
    pub fn record_width(&self) -> usize {
        4 + usize::from(self.drain_column)
            + N_CHANNELS
            + if self.rate_columns { N_CHANNELS } else { 0 }
    }
    pub fn width(&self) -> usize {
        self.record_width()
            + if self.dirac_columns {
                1 + N_CHANNELS
            } else {
                0
            }
    }
}
/// One data row, currents in amperes and rates in µA/s.
#[derive(Clone, Debug)]
pub struct DataRow<'a> {
    pub sweep_index: u64,
    pub point: u64,
    pub time: f64,
    pub drain_voltage: Option<f64>,
    pub gate_voltage: f64,
    pub currents: &'a [f64; N_CHANNELS],
    pub rates: Option<&'a [f64; N_CHANNELS]>,
}
/// CSV sink for one session. Every row is flushed as soon as it is written so a
/// crash loses at most the record being written.
pub struct SweepRecorder {
    writer: csv::Writer<File>,
    path: PathBuf,
    layout: CsvLayout,
}
impl SweepRecorder {
    pub fn create(path: &Path, layout: CsvLayout) -> Result<Self, AcquisitionError> {
        let writer = csv::Writer::from_path(path).map_err(|source| AcquisitionError::Sink {
            path: path.to_path_buf(),
            source,
        })?;
        let mut recorder = Self {
            writer,
            path: path.to_path_buf(),
            layout,
        };
        recorder.write_row(layout.header())?;
        info!("CSV file created: {}", path.display());
        Ok(recorder)
    }
    pub fn write_data(&mut self, row: &DataRow<'_>) -> Result<(), AcquisitionError> {
        let mut fields = Vec::with_capacity(self.layout.width());
        fields.push(row.sweep_index.to_string());
        fields.push(row.point.to_string());
        fields.push(row.time.to_string());
        if self.layout.drain_column {
            fields.push(row.drain_voltage.map(|v| v.to_string()).unwrap_or_default());
        }
        fields.push(row.gate_voltage.to_string());
        fields.extend(row.currents.iter().map(f64::to_string));
        if self.layout.rate_columns {
            let zeros = [0.0; N_CHANNELS];
            fields.extend(row.rates.unwrap_or(&zeros).iter().map(f64::to_string));
        }
        fields.resize(self.layout.width(), String::new());
        self.write_row(fields)
    }
    /// Dirac summary row: record columns empty, then the sweep index and one
    /// value per channel (empty when a channel had no Dirac point).
    pub fn write_dirac(
        &mut self,
        sweep_index: u64,
        dirac_voltages: &[Option<f64>; N_CHANNELS],
    ) -> Result<(), AcquisitionError> {
        if !self.layout.dirac_columns {
            return Ok(());
        }
        let mut fields = vec![String::new(); self.layout.record_width()];
        fields.push(sweep_index.to_string());
        fields.extend(
            dirac_voltages
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
        );
        self.write_row(fields)
    }
    fn write_row(&mut self, fields: Vec<String>) -> Result<(), AcquisitionError> {
        self.writer.write_record(&fields)?;
        self.writer.flush()?;
        Ok(())
    }
    pub fn finish(mut self) -> Result<(), AcquisitionError> {
        self.writer.flush()?;
        info!("CSV file closed: {}", self.path.display());
        Ok(())
    }
}
