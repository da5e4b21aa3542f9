// src/drivers/simulator.rs
//! Synthetic SMU board, used when no hardware is attached.
//!
//! Speaks the same line protocol as the firmware: `start,<vmin>,<vmax>,<delay>`
//! produces one V-shaped transfer curve per channel followed by `DONE`,
//! `start,<gate>,<delay>` streams time samples, and a bare gate voltage line
//! followed by `start` streams legacy 20-column records. Every channel has its
//! own Dirac voltage, which drifts slightly with each sweep.
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::drivers::link::{CancelToken, Connector, DeviceLink, LineRead};
use crate::drivers::record::{DONE_SENTINEL, N_CHANNELS};
use crate::drivers::AcquisitionError;
const GATE_STEP_V: f64 = 0.01;
const MIN_CURRENT_UA: f64 = 5.0;
const SLOPE_UA_PER_V: f64 = 40.0;
const NOISE_UA: f64 = 0.05;
const DRIFT_V_PER_SWEEP: f64 = 0.002;
pub struct SimulatedConnector {
    seed: u64,
    time_points: Option<usize>,
    realtime: bool,
}
impl SimulatedConnector {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            time_points: None,
            realtime: true,
        }
    }
    /// Ends time sweeps with `DONE` after `points` samples instead of streaming forever.
    pub fn with_time_points(mut self, points: usize) -> Self {
        self.time_points = Some(points);
        self
    }
    /// Emits lines as fast as they are read instead of honouring the step delay.
    pub fn without_delay(mut self) -> Self {
        self.realtime = false;
        self
    }
}
impl Connector for SimulatedConnector {
    type Link = SimulatedLink;
    fn connect(&mut self) -> Result<SimulatedLink, AcquisitionError> {
        Ok(SimulatedLink {
            rng: StdRng::seed_from_u64(self.seed),
            clock: Instant::now(),
            program: Program::Idle,
            pending_gate: None,
            step_delay: Duration::ZERO,
            completed_sweeps: 0,
            time_points: self.time_points,
            realtime: self.realtime,
        })
    }
}
enum Program {
    Idle,
    Voltage { gates: VecDeque<f64>, step: u64 },
    Time { gate: f64, legacy: bool, step: u64 },
}
pub struct SimulatedLink {
    rng: StdRng,
    clock: Instant,
    program: Program,
    pending_gate: Option<f64>,
    step_delay: Duration,
    completed_sweeps: u64,
    time_points: Option<usize>,
    realtime: bool,
}
impl SimulatedLink {
    fn dirac_of(&self, ch: usize) -> f64 {
        -0.1 + 0.015 * ch as f64 + DRIFT_V_PER_SWEEP * self.completed_sweeps as f64
    }
    fn current_amps(&mut self, ch: usize, gate: f64, t: f64) -> f64 {
        let dirac = self.dirac_of(ch);
        let base = MIN_CURRENT_UA + ch as f64 * 0.5 + SLOPE_UA_PER_V * (gate - dirac).abs();
        let response = 2.0 * (1.0 - (-t / 30.0).exp());
        let noise = self.rng.gen_range(-NOISE_UA..NOISE_UA);
        (base + response + noise) * 1e-6
    }
    fn currents(&mut self, gate: f64, t: f64) -> Vec<String> {
        (0..N_CHANNELS)
            .map(|ch| self.current_amps(ch, gate, t).to_string())
            .collect()
    }
    fn begin(&mut self, args: &[f64]) {
        match *args {
            [v_min, v_max, delay_ms] => {
                let count = ((v_max - v_min) / GATE_STEP_V).round().max(0.0) as usize + 1;
                let gates = (0..count)
                    .map(|i| v_min + i as f64 * GATE_STEP_V)
                    .collect();
                self.step_delay = Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0);
                self.program = Program::Voltage { gates, step: 0 };
            }
            [gate, delay_ms] => {
                self.step_delay = Duration::from_secs_f64(delay_ms.max(0.0) / 1000.0);
                self.program = Program::Time {
                    gate,
                    legacy: false,
                    step: 0,
                };
            }
            [] => {
                self.program = Program::Time {
                    gate: self.pending_gate.take().unwrap_or(0.0),
                    legacy: true,
                    step: 0,
                };
            }
            _ => debug!("Simulator ignoring start with {} arguments", args.len()),
        }
    }
    fn next_line(&mut self) -> Option<String> {
        let t = self.clock.elapsed().as_secs_f64();
        let time_points = self.time_points;
        match std::mem::replace(&mut self.program, Program::Idle) {
            Program::Idle => None,
            Program::Voltage { mut gates, step } => match gates.pop_front() {
                Some(gate) => {
                    let currents = self.currents(gate, t);
                    self.program = Program::Voltage {
                        gates,
                        step: step + 1,
                    };
                    Some(format!("{step},{t},{gate},{}", currents.join(",")))
                }
                None => {
                    self.completed_sweeps += 1;
                    Some(DONE_SENTINEL.to_string())
                }
            },
            Program::Time { gate, legacy, step } => {
                if time_points.is_some_and(|limit| step as usize >= limit) {
                    return Some(DONE_SENTINEL.to_string());
                }
                let currents = self.currents(gate, t).join(",");
                self.program = Program::Time {
                    gate,
                    legacy,
                    step: step + 1,
                };
                Some(if legacy {
                    format!("{step},{t},0.1,{gate},{currents}")
                } else {
                    format!("{t},{currents}")
                })
            }
        }
    }
}
impl DeviceLink for SimulatedLink {
    fn send_line(&mut self, line: &str) -> Result<(), AcquisitionError> {
        let mut parts = line.trim().split(',');
        match parts.next() {
            Some("start") => {
                let args: Vec<f64> = parts.filter_map(|p| p.trim().parse().ok()).collect();
                self.begin(&args);
            }
            Some("stop") => self.program = Program::Idle,
            Some(other) => {
                if let Ok(gate) = other.parse::<f64>() {
                    self.pending_gate = Some(gate);
                }
            }
            None => {}
        }
        Ok(())
    }
    fn read_line(&mut self, cancel: &CancelToken) -> Result<LineRead, AcquisitionError> {
        if cancel.is_cancelled() {
            return Ok(LineRead::Cancelled);
        }
        if self.realtime {
            thread::sleep(self.step_delay.min(Duration::from_millis(50)));
        }
        Ok(match self.next_line() {
            Some(line) => LineRead::Line(line),
            None => LineRead::Timeout,
        })
    }
    fn reset(&mut self) -> Result<(), AcquisitionError> {
        self.program = Program::Idle;
        self.pending_gate = None;
        Ok(())
    }
    fn close(&mut self) -> Result<(), AcquisitionError> {
        self.program = Program::Idle;
        Ok(())
    }
}
#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::record::{classify_line, DeviceLine, RecordSchema};
    fn drain(link: &mut SimulatedLink) -> Vec<String> {
        let cancel = CancelToken::new();
        let mut lines = Vec::new();
        while let Ok(LineRead::Line(line)) = link.read_line(&cancel) {
            let done = line == DONE_SENTINEL;
            lines.push(line);
            if done {
                break;
            }
        }
        lines
    }
    #[test]
    fn voltage_sweep_emits_valid_records_then_done() {
        let mut link = SimulatedConnector::new(7).without_delay().connect().unwrap();
        link.send_line("start,-0.5,0.5,10").unwrap();
        let lines = drain(&mut link);
        assert_eq!(lines.len(), 102);
        assert_eq!(lines.last().map(String::as_str), Some(DONE_SENTINEL));
        for line in &lines[..101] {
            assert!(matches!(
                classify_line(RecordSchema::VoltageSweep, line),
                DeviceLine::Record(_)
            ));
        }
    }
    #[test]
    fn time_sweep_respects_point_limit() {
        let mut link = SimulatedConnector::new(1)
            .with_time_points(5)
            .without_delay()
            .connect()
            .unwrap();
        link.send_line("start,0.2,100").unwrap();
        let lines = drain(&mut link);
        assert_eq!(lines.len(), 6);
        assert!(matches!(
            classify_line(RecordSchema::TimeSweep, &lines[0]),
            DeviceLine::Record(_)
        ));
    }
    #[test]
    fn legacy_start_uses_pending_gate() {
        let mut link = SimulatedConnector::new(1)
            .with_time_points(1)
            .without_delay()
            .connect()
            .unwrap();
        link.send_line("0.3").unwrap();
        link.send_line("start").unwrap();
        let lines = drain(&mut link);
        let DeviceLine::Record(record) = classify_line(RecordSchema::LegacyTimeSweep, &lines[0])
        else {
            panic!("expected a legacy record");
        };
        assert_eq!(record.gate_voltage, Some(0.3));
    }
}
