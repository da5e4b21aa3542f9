// src/engine.rs
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use log::{error, info};
use crate::config::AcquisitionConfig;
use crate::drivers::{CancelToken, Connector};
use crate::session::{Step, SweepSession};
use crate::types::*;
/// Front-end side of an acquisition thread.
pub struct SessionHandle {
    commands: Sender<SessionCommand>,
    events: Receiver<SessionEvent>,
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}
impl SessionHandle {
    pub fn start(&self, params: SweepParameters) {
        self.commands.send(SessionCommand::Start(params)).ok();
    }
    /// Interrupts any in-flight read, then asks the thread to stop the run.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.commands.send(SessionCommand::Stop).ok();
    }
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }
    pub fn shutdown(mut self) {
        self.join_thread();
    }
    fn join_thread(&mut self) {
        self.cancel.cancel();
        self.commands.send(SessionCommand::Shutdown).ok();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("Acquisition thread panicked");
            }
        }
    }
}
impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.join_thread();
    }
}
/// Runs a `SweepSession` on its own thread. Commands go in through the handle,
/// buffer snapshots and Dirac summaries come back as `SessionEvent`s.
pub fn spawn_session<C>(connector: C, config: AcquisitionConfig) -> SessionHandle
where
    C: Connector + Send + 'static,
{
    let (tx_cmd, rx_cmd) = mpsc::channel();
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let thread_cancel = cancel.clone();
    let join = thread::spawn(move || run(connector, config, thread_cancel, tx, rx_cmd));
    SessionHandle {
        commands: tx_cmd,
        events: rx,
        cancel,
        join: Some(join),
    }
}
fn run<C: Connector>(
    connector: C,
    config: AcquisitionConfig,
    cancel: CancelToken,
    tx: Sender<SessionEvent>,
    rx_cmd: Receiver<SessionCommand>,
) {
    let idle = config.poll_slice();
    let snapshot_interval = config.snapshot_interval();
    let mut session = SweepSession::new(connector, config).with_cancel(cancel);
    let mut last_snapshot = Instant::now();
    tx.send(SessionEvent::Log("Acquisition engine ready".to_owned()))
        .ok();
    loop {
        loop {
            match rx_cmd.try_recv() {
                Ok(SessionCommand::Start(params)) => {
                    let mode = params.mode;
                    match session.start(params) {
                        Ok(()) => {
                            tx.send(SessionEvent::Status(true)).ok();
                            tx.send(SessionEvent::Log(format!("{mode:?} started"))).ok();
                            last_snapshot = Instant::now();
                        }
                        Err(e) => {
                            error!("Could not start {mode:?}: {e}");
                            tx.send(SessionEvent::Error(e.to_string())).ok();
                        }
                    }
                }
                Ok(SessionCommand::Stop) => {
                    if session.is_running() {
                        session.stop();
                        finish(&tx, &session, EndReason::Stopped);
                    }
                }
                Ok(SessionCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    if session.is_running() {
                        session.stop();
                        finish(&tx, &session, EndReason::Stopped);
                    }
                    info!("Acquisition engine shut down");
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        if !session.is_running() {
            thread::sleep(idle);
            continue;
        }
        match session.poll() {
            Step::SweepCompleted(summary) => {
                let snapshot = session
                    .take_completed_sweep()
                    .unwrap_or_else(|| session.snapshot());
                tx.send(SessionEvent::Snapshot(snapshot)).ok();
                tx.send(SessionEvent::SweepCompleted(summary)).ok();
                last_snapshot = Instant::now();
            }
            Step::Ended(reason) => finish(&tx, &session, reason),
            Step::Record if last_snapshot.elapsed() >= snapshot_interval => {
                tx.send(SessionEvent::Snapshot(session.snapshot())).ok();
                last_snapshot = Instant::now();
            }
            _ => {}
        }
    }
}
fn finish<C: Connector>(tx: &Sender<SessionEvent>, session: &SweepSession<C>, reason: EndReason) {
    tx.send(SessionEvent::Snapshot(session.snapshot())).ok();
    if let EndReason::Failed(message) = &reason {
        tx.send(SessionEvent::Error(message.clone())).ok();
    }
    tx.send(SessionEvent::Finished(reason)).ok();
    tx.send(SessionEvent::Status(false)).ok();
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{ScriptedConnector, SimulatedConnector, N_CHANNELS};
    use std::path::Path;
    use std::time::Duration;
    fn config() -> AcquisitionConfig {
        AcquisitionConfig {
            poll_slice_ms: 5,
            tracking_pause_ms: 0,
            snapshot_interval_ms: 0,
            ..AcquisitionConfig::default()
        }
    }
    fn params(mode: SweepMode, path: &Path) -> SweepParameters {
        SweepParameters {
            mode,
            v_min: -0.2,
            v_max: 0.2,
            gate_voltage: 0.1,
            step_delay_ms: 1.0,
            output_path: path.to_path_buf(),
        }
    }
    /// Collects events until `Finished` or until nothing arrives for a second.
    fn collect_until_finished(handle: &SessionHandle) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = handle.events().recv_timeout(Duration::from_secs(1)) {
            let done = matches!(event, SessionEvent::Finished(_));
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
    #[test]
    fn scripted_sweep_reports_dirac_then_stops() {
        let line = |step: u64, gate: f64, ua: f64| {
            format!("{step},0.0,{gate},{}", vec![format!("{}", ua * 1e-6); N_CHANNELS].join(","))
        };
        let connector = ScriptedConnector::new(vec![
            line(0, -0.2, 3.0),
            line(1, 0.1, 1.0),
            line(2, 0.2, 2.0),
            "DONE".to_string(),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_session(connector, config());
        handle.start(params(SweepMode::VoltageSweep, &dir.path().join("v.csv")));
        let summary = loop {
            match handle.events().recv_timeout(Duration::from_secs(2)).unwrap() {
                SessionEvent::SweepCompleted(summary) => break summary,
                SessionEvent::Error(e) => panic!("{e}"),
                _ => {}
            }
        };
        assert_eq!(summary.sweep_index, 0);
        assert_eq!(summary.dirac_voltages[0], Some(0.1));
        handle.stop();
        let events = collect_until_finished(&handle);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Finished(EndReason::Stopped))
        ));
        handle.shutdown();
    }
    #[test]
    fn simulated_time_sweep_completes() {
        let connector = SimulatedConnector::new(3)
            .with_time_points(20)
            .without_delay();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let handle = spawn_session(connector, config());
        handle.start(params(SweepMode::TimeSweep, &path));
        let events = collect_until_finished(&handle);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Status(true))));
        let last_snapshot = events
            .iter()
            .rev()
            .find_map(|e| match e {
                SessionEvent::Snapshot(s) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_snapshot.currents[0].len(), 20);
        assert_eq!(last_snapshot.derivatives[0].len(), 20);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Finished(EndReason::Completed))
        ));
        handle.shutdown();
        let rows = csv::Reader::from_path(&path).unwrap().records().count();
        assert_eq!(rows, 20);
    }
    #[test]
    fn invalid_parameters_surface_as_error_event() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_session(ScriptedConnector::new(Vec::<String>::new()), config());
        let mut bad = params(SweepMode::VoltageSweep, &dir.path().join("x.csv"));
        bad.step_delay_ms = 0.0;
        handle.start(bad);
        let error = loop {
            match handle.events().recv_timeout(Duration::from_secs(2)).unwrap() {
                SessionEvent::Error(e) => break e,
                SessionEvent::Status(true) => panic!("session should not start"),
                _ => {}
            }
        };
        assert!(error.contains("step delay"), "{error}");
    }
}
