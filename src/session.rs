// src/session.rs
use std::thread;
use std::time::Instant;
use log::{debug, error, info, warn};
use crate::config::AcquisitionConfig;
use crate::drivers::{
    classify_line, AcquisitionError, CancelToken, ChannelBuffers, Connector, DeviceLine,
    DeviceLink, DiracPoint, DiracTracker, LineRead, MalformedRecord, SweepRecord, SweepSnapshot,
};
use crate::recorder::{CsvLayout, DataRow, SweepRecorder};
use crate::types::{EndReason, SweepParameters, SweepSummary};
/// Outcome of feeding one device line (or one read attempt) to the session.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Nothing happened: not running, read timed out or the line was blank.
    Idle,
    /// Line had the wrong shape and was discarded.
    Dropped(MalformedRecord),
    /// A record was buffered and written.
    Record,
    /// `DONE` closed a voltage sweep; the session keeps running.
    SweepCompleted(SweepSummary),
    /// The session is no longer running.
    Ended(EndReason),
}
/// One acquisition run: owns the device link, the CSV sink and the buffers.
pub struct SweepSession<C: Connector> {
    connector: C,
    config: AcquisitionConfig,
    link: Option<C::Link>,
    recorder: Option<SweepRecorder>,
    params: Option<SweepParameters>,
    running: bool,
    sweep_index: u64,
    point_index: u64,
    experiment_start: Instant,
    buffers: ChannelBuffers,
    completed: Option<SweepSnapshot>,
    dirac: DiracTracker,
    cancel: CancelToken,
}
impl<C: Connector> SweepSession<C> {
    pub fn new(connector: C, config: AcquisitionConfig) -> Self {
        Self {
            connector,
            config,
            link: None,
            recorder: None,
            params: None,
            running: false,
            sweep_index: 0,
            point_index: 0,
            experiment_start: Instant::now(),
            buffers: ChannelBuffers::new(None),
            completed: None,
            dirac: DiracTracker::default(),
            cancel: CancelToken::new(),
        }
    }
    /// Shares an existing stop flag instead of the session's own.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
    /// Token that interrupts a blocking read and stops the session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
    pub fn is_running(&self) -> bool {
        self.running
    }
    pub fn sweep_index(&self) -> u64 {
        self.sweep_index
    }
    pub fn params(&self) -> Option<&SweepParameters> {
        self.params.as_ref()
    }
    pub fn buffers(&self) -> &ChannelBuffers {
        &self.buffers
    }
    pub fn dirac_history(&self) -> &[Vec<DiracPoint>] {
        self.dirac.history()
    }
    pub fn has_sink(&self) -> bool {
        self.recorder.is_some()
    }
    pub fn snapshot(&self) -> SweepSnapshot {
        let derives_rate = self.params.as_ref().is_some_and(|p| p.mode.derives_rate());
        SweepSnapshot {
            sweep_index: self.sweep_index,
            currents: self.buffers.currents_vec(),
            derivatives: if derives_rate {
                self.buffers.derivatives_vec()
            } else {
                Vec::new()
            },
            dirac_history: self.dirac.history().to_vec(),
        }
    }
    /// Buffers of the sweep most recently closed by `DONE`, taken before they were cleared.
    pub fn take_completed_sweep(&mut self) -> Option<SweepSnapshot> {
        self.completed.take()
    }
    /// Validates `params`, opens the CSV sink and the link, and sends the start
    /// command. On error nothing is left open and the session stays stopped.
    pub fn start(&mut self, params: SweepParameters) -> Result<(), AcquisitionError> {
        params.validate()?;
        if self.running {
            return Err(AcquisitionError::AlreadyRunning);
        }
        let recorder =
            SweepRecorder::create(&params.output_path, CsvLayout::for_mode(params.mode))?;
        if self.link.is_none() {
            let mut link = self.connector.connect()?;
            link.reset()?;
            self.link = Some(link);
        }
        let window = params
            .mode
            .is_single_shot()
            .then_some(self.config.time_window_points);
        self.buffers = ChannelBuffers::new(window);
        self.dirac.clear();
        self.completed = None;
        self.sweep_index = 0;
        self.point_index = 0;
        self.cancel.reset();
        self.recorder = Some(recorder);
        if let Err(e) = self.send_start(&params) {
            self.params = Some(params);
            self.stop();
            return Err(e);
        }
        info!(
            "{:?} started, writing to {}",
            params.mode,
            params.output_path.display()
        );
        self.experiment_start = Instant::now();
        self.params = Some(params);
        self.running = true;
        Ok(())
    }
    fn send_start(&mut self, params: &SweepParameters) -> Result<(), AcquisitionError> {
        let link = self.link.as_mut().ok_or(AcquisitionError::LinkClosed)?;
        for command in params.start_commands() {
            link.send_line(&command)?;
            debug!("Sent {command:?}");
        }
        Ok(())
    }
    /// Reads at most one line from the device and processes it.
    pub fn poll(&mut self) -> Step {
        if !self.running {
            return Step::Idle;
        }
        if self.cancel.is_cancelled() {
            self.stop();
            return Step::Ended(EndReason::Stopped);
        }
        let read = match self.link.as_mut() {
            Some(link) => link.read_line(&self.cancel),
            None => Err(AcquisitionError::LinkClosed),
        };
        match read {
            Ok(LineRead::Line(line)) => self.ingest_line(&line),
            Ok(LineRead::Timeout) => Step::Idle,
            Ok(LineRead::Cancelled) => {
                self.stop();
                Step::Ended(EndReason::Stopped)
            }
            Err(e) => self.fail(e),
        }
    }
    /// Processes one raw device line.
    pub fn ingest_line(&mut self, line: &str) -> Step {
        let Some(mode) = self.params.as_ref().map(|p| p.mode) else {
            return Step::Idle;
        };
        if !self.running {
            return Step::Idle;
        }
        match classify_line(mode.schema(), line) {
            DeviceLine::Empty => Step::Idle,
            DeviceLine::Done => self.complete_sweep(),
            DeviceLine::Malformed(reason) => {
                debug!("Dropping line {line:?}: {reason}");
                Step::Dropped(reason)
            }
            DeviceLine::Record(record) => match self.accept(&record) {
                Ok(()) => Step::Record,
                Err(e) => self.fail(e),
            },
        }
    }
    fn accept(&mut self, record: &SweepRecord) -> Result<(), AcquisitionError> {
        let Some(params) = self.params.as_ref() else {
            return Ok(());
        };
        let mode = params.mode;
        let gate_voltage = record.gate_voltage.unwrap_or(params.gate_voltage);
        let microamps = record.currents_microamps();
        let rates = if mode.derives_rate() {
            Some(
                self.buffers
                    .push_with_derivative(record.elapsed_time, &microamps),
            )
        } else {
            let x = if mode.schema().plots_against_gate() {
                gate_voltage
            } else {
                record.elapsed_time
            };
            self.buffers.push_currents(x, &microamps);
            None
        };
        let point = record.sequence_index.unwrap_or(self.point_index);
        self.point_index += 1;
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.write_data(&DataRow {
                sweep_index: self.sweep_index,
                point,
                time: record.elapsed_time,
                drain_voltage: record.drain_voltage,
                gate_voltage,
                currents: &record.currents,
                rates: rates.as_ref(),
            })?;
        }
        Ok(())
    }
    fn complete_sweep(&mut self) -> Step {
        let Some(params) = self.params.clone() else {
            return Step::Idle;
        };
        if params.mode.is_single_shot() {
            info!("Device reported DONE, ending {:?}", params.mode);
            self.stop();
            return Step::Ended(EndReason::Completed);
        }
        let summary = self.compute_dirac();
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(e) = recorder.write_dirac(summary.sweep_index, &summary.dirac_voltages) {
                return self.fail(e);
            }
        }
        self.completed = Some(self.snapshot());
        self.sweep_index += 1;
        self.buffers.clear();
        if params.mode.repeats() {
            thread::sleep(self.config.tracking_pause());
            if let Err(e) = self.send_start(&params) {
                return self.fail(e);
            }
        }
        Step::SweepCompleted(summary)
    }
    /// Dirac point of every channel for the sweep currently in the buffers.
    fn compute_dirac(&mut self) -> SweepSummary {
        let time_since_start = self.experiment_start.elapsed().as_secs_f64();
        let dirac_voltages =
            self.dirac
                .record_sweep(&self.buffers, self.sweep_index, time_since_start);
        SweepSummary {
            sweep_index: self.sweep_index,
            time_since_start,
            dirac_voltages,
        }
    }
    fn fail(&mut self, e: AcquisitionError) -> Step {
        error!("Acquisition error, ending session: {e}");
        self.stop();
        Step::Ended(EndReason::Failed(e.to_string()))
    }
    /// Stops the run. Shutdown errors are logged, never returned.
    pub fn stop(&mut self) {
        self.running = false;
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.send_line("stop") {
                warn!("Error sending stop: {e}");
            }
            if let Err(e) = link.close() {
                warn!("Error closing device link: {e}");
            }
        }
        if let Some(recorder) = self.recorder.take() {
            if let Err(e) = recorder.finish() {
                warn!("Error closing CSV sink: {e}");
            }
        }
    }
}
impl<C: Connector> Drop for SweepSession<C> {
    fn drop(&mut self) {
        self.stop();
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ScriptLog, ScriptedConnector, N_CHANNELS};
    use crate::types::SweepMode;
    use std::path::{Path, PathBuf};
    fn voltage_line(step: u64, gate: f64, scale: f64) -> String {
        let currents: Vec<String> = (1..=N_CHANNELS)
            .map(|i| format!("{}", i as f64 * scale))
            .collect();
        format!("{step},{},{gate},{}", step as f64 * 0.1, currents.join(","))
    }
    fn params(mode: SweepMode, path: &Path) -> SweepParameters {
        SweepParameters {
            mode,
            v_min: -0.5,
            v_max: 0.5,
            gate_voltage: 0.2,
            step_delay_ms: 10.0,
            output_path: path.to_path_buf(),
        }
    }
    fn quick_config() -> AcquisitionConfig {
        AcquisitionConfig {
            tracking_pause_ms: 0,
            time_window_points: 3,
            ..AcquisitionConfig::default()
        }
    }
    fn session(
        lines: Vec<String>,
    ) -> (SweepSession<ScriptedConnector>, ScriptLog, tempfile::TempDir, PathBuf) {
        let connector = ScriptedConnector::new(lines);
        let log = connector.log();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        (SweepSession::new(connector, quick_config()), log, dir, path)
    }
    fn csv_rows(path: &Path) -> Vec<Vec<String>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap()
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }
    #[test]
    fn start_opens_link_and_sends_command() {
        let (mut session, log, _dir, path) = session(vec![]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        assert!(session.is_running());
        assert_eq!(log.connects(), 1);
        assert_eq!(log.resets(), 1);
        assert_eq!(log.sent(), vec!["start,-0.5,0.5,10".to_string()]);
        assert_eq!(csv_rows(&path).len(), 1);
    }
    #[test]
    fn record_line_is_buffered_and_written() {
        let line = format!(
            "3,1.234,0.10,{}",
            (1..=16).map(|i| format!("{i}e-6")).collect::<Vec<_>>().join(",")
        );
        let (mut session, _log, _dir, path) = session(vec![line]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        assert_eq!(session.poll(), Step::Record);
        for ch in 0..N_CHANNELS {
            let points = session.buffers().channel(ch).unwrap().to_vec();
            assert_eq!(points.len(), 1);
            assert_eq!(points[0][0], 0.10);
            assert!((points[0][1] - (ch as f64 + 1.0)).abs() < 1e-9);
        }
        let rows = csv_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][..4], ["0", "3", "1.234", "0.1"]);
        assert_eq!(rows[1][4].parse::<f64>().unwrap(), 1e-6);
        assert_eq!(rows[1][19].parse::<f64>().unwrap(), 16e-6);
    }
    #[test]
    fn malformed_lines_change_nothing() {
        let (mut session, _log, _dir, path) = session(vec![
            "1,2,3".to_string(),
            voltage_line(0, 0.0, 1e-6).replacen(",", ",x", 1),
            String::new(),
        ]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        assert!(matches!(session.poll(), Step::Dropped(_)));
        assert!(matches!(session.poll(), Step::Dropped(_)));
        assert_eq!(session.poll(), Step::Idle);
        assert!(session.buffers().is_empty());
        assert_eq!(csv_rows(&path).len(), 1);
        assert!(session.is_running());
    }
    #[test]
    fn done_in_voltage_mode_records_dirac_and_resets_sweep() {
        let (mut session, log, _dir, path) = session(vec![
            voltage_line(0, -0.1, 2e-6),
            voltage_line(1, 0.0, 1e-6),
            voltage_line(2, 0.1, 3e-6),
            "DONE".to_string(),
        ]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        for _ in 0..3 {
            assert_eq!(session.poll(), Step::Record);
        }
        let Step::SweepCompleted(summary) = session.poll() else {
            panic!("expected a completed sweep");
        };
        assert_eq!(summary.sweep_index, 0);
        assert!(summary.dirac_voltages.iter().all(|v| *v == Some(0.0)));
        assert_eq!(session.sweep_index(), 1);
        assert!(session.buffers().is_empty());
        assert!(session.dirac_history().iter().all(|h| h.len() == 1));
        assert!(session.is_running());
        // voltage sweeps wait for the device instead of re-sending start
        assert_eq!(log.sent().len(), 1);
        let rows = csv_rows(&path);
        let dirac_row = rows.last().unwrap();
        assert!(dirac_row[..20].iter().all(String::is_empty));
        assert_eq!(dirac_row[20], "0");
        assert_eq!(dirac_row[21].parse::<f64>().unwrap(), 0.0);
    }
    #[test]
    fn done_after_single_point_gives_empty_dirac() {
        let (mut session, _log, _dir, path) =
            session(vec![voltage_line(0, 0.0, 1e-6), "DONE".to_string()]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        session.poll();
        let Step::SweepCompleted(summary) = session.poll() else {
            panic!("expected a completed sweep");
        };
        assert!(summary.dirac_voltages.iter().all(Option::is_none));
        assert_eq!(csv_rows(&path).last().unwrap()[21], "");
    }
    #[test]
    fn dirac_tracking_resends_start() {
        let (mut session, log, _dir, path) = session(vec![
            voltage_line(0, -0.1, 2e-6),
            voltage_line(1, 0.1, 1e-6),
            "DONE".to_string(),
            voltage_line(0, -0.1, 1e-6),
        ]);
        session.start(params(SweepMode::DiracTracking, &path)).unwrap();
        session.poll();
        session.poll();
        assert!(matches!(session.poll(), Step::SweepCompleted(_)));
        assert_eq!(log.sent().len(), 2);
        assert_eq!(session.poll(), Step::Record);
        let rows = csv_rows(&path);
        assert_eq!(rows.last().unwrap()[0], "1");
    }
    #[test]
    fn time_sweep_windows_buffers_and_writes_rates() {
        let line = |t: f64, ua: f64| {
            let currents = vec![format!("{}", ua * 1e-6); N_CHANNELS].join(",");
            format!("{t},{currents}")
        };
        let (mut session, log, _dir, path) = session(vec![
            line(0.0, 1.0),
            line(0.5, 2.0),
            line(1.0, 2.0),
            line(1.5, 4.0),
            "DONE".to_string(),
        ]);
        session.start(params(SweepMode::TimeSweep, &path)).unwrap();
        assert_eq!(log.sent(), vec!["start,0.2,10".to_string()]);
        for _ in 0..4 {
            assert_eq!(session.poll(), Step::Record);
        }
        let snapshot = session.snapshot();
        assert_eq!(snapshot.currents[0].len(), 3);
        assert_eq!(snapshot.currents[0][0][0], 0.5);
        assert!((snapshot.derivatives[5][2][1] - 4.0).abs() < 1e-9);
        assert_eq!(session.poll(), Step::Ended(EndReason::Completed));
        assert!(!session.is_running());
        assert!(!session.has_sink());
        let rows = csv_rows(&path);
        assert_eq!(rows.len(), 5);
        assert_eq!(&rows[2][..4], ["0", "1", "0.5", "0.2"]);
        assert!((rows[2][20].parse::<f64>().unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(log.sent().last().map(String::as_str), Some("stop"));
    }
    #[test]
    fn stop_then_start_resets_state() {
        let (mut session, log, _dir, path) = session(vec![
            voltage_line(0, -0.1, 2e-6),
            voltage_line(1, 0.1, 1e-6),
            "DONE".to_string(),
            voltage_line(0, -0.1, 1e-6),
        ]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        for _ in 0..4 {
            session.poll();
        }
        assert_eq!(session.sweep_index(), 1);
        assert!(!session.buffers().is_empty());
        session.stop();
        assert!(!session.is_running());
        assert!(!session.has_sink());
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        assert_eq!(session.sweep_index(), 0);
        assert!(session.buffers().is_empty());
        assert!(session.dirac_history().iter().all(Vec::is_empty));
        assert_eq!(log.connects(), 2);
        assert_eq!(log.resets(), 2);
    }
    #[test]
    fn legacy_time_sweep_fills_drain_column_and_completes() {
        let line = format!("7,0.5,0.05,0.2,{}", vec!["2e-6"; N_CHANNELS].join(","));
        let (mut session, log, _dir, path) = session(vec![line, "DONE".to_string()]);
        session.start(params(SweepMode::LegacyTimeSweep, &path)).unwrap();
        assert_eq!(log.sent(), vec!["0.2".to_string(), "start".to_string()]);
        assert_eq!(session.poll(), Step::Record);
        let points = session.buffers().channel(0).unwrap().to_vec();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0][0], 0.5);
        assert!((points[0][1] - 2.0).abs() < 1e-9);
        assert_eq!(session.poll(), Step::Ended(EndReason::Completed));
        assert!(!session.is_running());
        assert_eq!(log.sent().last().map(String::as_str), Some("stop"));
        let rows = csv_rows(&path);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][3], "V_DRAIN");
        assert_eq!(rows[1].len(), 5 + N_CHANNELS);
        assert_eq!(&rows[1][..6], ["0", "7", "0.5", "0.05", "0.2", "0.000002"]);
    }
    #[test]
    fn unwritable_output_path_leaves_session_stopped() {
        let (mut session, log, dir, _path) = session(vec![]);
        let path = dir.path().join("no-such-dir").join("run.csv");
        let err = session
            .start(params(SweepMode::VoltageSweep, &path))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::Sink { .. }));
        assert!(!session.is_running());
        assert!(!session.has_sink());
        assert_eq!(log.connects(), 0);
        assert_eq!(session.poll(), Step::Idle);
    }
    #[test]
    fn validation_error_touches_nothing() {
        let (mut session, log, _dir, path) = session(vec![]);
        let mut bad = params(SweepMode::VoltageSweep, &path);
        bad.v_max = 2.0;
        let err = session.start(bad).unwrap_err();
        assert!(err.is_validation());
        assert!(!session.is_running());
        assert_eq!(log.connects(), 0);
        assert!(!path.exists());
    }
    #[test]
    fn missing_device_is_fatal_to_start() {
        let connector = ScriptedConnector::new(Vec::<String>::new()).unavailable();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut session = SweepSession::new(connector, quick_config());
        let err = session
            .start(params(SweepMode::VoltageSweep, &path))
            .unwrap_err();
        assert!(err.is_connection());
        assert!(!session.is_running());
        assert!(!session.has_sink());
    }
    #[test]
    fn second_start_while_running_is_rejected() {
        let (mut session, _log, _dir, path) = session(vec![]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        let err = session
            .start(params(SweepMode::VoltageSweep, &path))
            .unwrap_err();
        assert!(matches!(err, AcquisitionError::AlreadyRunning));
        assert!(session.is_running());
    }
    #[test]
    fn io_error_during_run_ends_session() {
        let connector =
            ScriptedConnector::new(vec![voltage_line(0, 0.0, 1e-6)]).failing_when_exhausted();
        let log = connector.log();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut session = SweepSession::new(connector, quick_config());
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        assert_eq!(session.poll(), Step::Record);
        assert!(matches!(session.poll(), Step::Ended(EndReason::Failed(_))));
        assert!(!session.is_running());
        assert!(!session.has_sink());
        assert_eq!(log.sent().last().map(String::as_str), Some("stop"));
        assert_eq!(csv_rows(&path).len(), 2);
    }
    #[test]
    fn cancel_token_stops_the_run() {
        let (mut session, log, _dir, path) = session(vec![voltage_line(0, 0.0, 1e-6)]);
        session.start(params(SweepMode::VoltageSweep, &path)).unwrap();
        session.cancel_token().cancel();
        assert_eq!(session.poll(), Step::Ended(EndReason::Stopped));
        assert!(!session.is_running());
        assert_eq!(log.sent().last().map(String::as_str), Some("stop"));
    }
}
