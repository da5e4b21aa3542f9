// src/drivers/dirac.rs
//! Current-based Dirac point tracking for live voltage sweeps.
//!
//! The charge-neutral point of a GFET is where the drain current is smallest,
//! so each completed sweep contributes the gate voltage at `argmin |I|` per
//! channel. (Resistance-based analysis uses `argmax R`, see `analysis::dataset`.)
use crate::drivers::buffer::ChannelBuffers;
use crate::drivers::record::N_CHANNELS;
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DiracPoint {
    pub sweep_index: u64,
    /// Seconds since the experiment (not the sweep) started.
    pub time_since_start: f64,
    /// `None` when the sweep collected fewer than two samples.
    pub dirac_voltage: Option<f64>,
}
/// `x[argmin |y|]`, first occurrence on ties; `None` for fewer than two points.
pub fn dirac_voltage(points: &[[f64; 2]]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let mut best: Option<[f64; 2]> = None;
    for &[x, y] in points {
        let magnitude = y.abs();
        if magnitude.is_nan() {
            continue;
        }
        match best {
            Some([_, current]) if current <= magnitude => {}
            _ => best = Some([x, magnitude]),
        }
    }
    best.map(|[x, _]| x)
}
/// Dirac history of every channel over an experiment.
#[derive(Clone, Debug)]
pub struct DiracTracker {
    history: Vec<Vec<DiracPoint>>,
}
impl Default for DiracTracker {
    fn default() -> Self {
        Self {
            history: vec![Vec::new(); N_CHANNELS],
        }
    }
}
impl DiracTracker {
    /// Records one Dirac point per channel for the sweep held in `buffers`.
    pub fn record_sweep(
        &mut self,
        buffers: &ChannelBuffers,
        sweep_index: u64,
        time_since_start: f64,
    ) -> [Option<f64>; N_CHANNELS] {
        let mut values = [None; N_CHANNELS];
        for (ch, value) in values.iter_mut().enumerate() {
            *value = buffers
                .channel(ch)
                .and_then(|buffer| dirac_voltage(&buffer.to_vec()));
            self.history[ch].push(DiracPoint {
                sweep_index,
                time_since_start,
                dirac_voltage: *value,
            });
        }
        values
    }
    pub fn history(&self) -> &[Vec<DiracPoint>] {
        &self.history
    }
    pub fn clear(&mut self) {
        self.history.iter_mut().for_each(Vec::clear);
    }
}
