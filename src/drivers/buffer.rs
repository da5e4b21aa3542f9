// src/drivers/buffer.rs
use std::collections::VecDeque;
use crate::drivers::dirac::DiracPoint;
use crate::drivers::record::N_CHANNELS;
/// Append-only `(x, y)` samples for one channel, optionally a sliding window.
#[derive(Clone, Debug, Default)]
pub struct ChannelBuffer {
    points: VecDeque<[f64; 2]>,
    capacity: Option<usize>,
}
impl ChannelBuffer {
    pub fn unbounded() -> Self {
        Self::default()
    }
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity: Some(capacity.max(1)),
        }
    }
    pub fn push(&mut self, x: f64, y: f64) {
        if let Some(capacity) = self.capacity {
            while self.points.len() >= capacity {
                self.points.pop_front();
            }
        }
        self.points.push_back([x, y]);
    }
    pub fn last(&self) -> Option<[f64; 2]> {
        self.points.back().copied()
    }
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
    pub fn clear(&mut self) {
        self.points.clear();
    }
    pub fn to_vec(&self) -> Vec<[f64; 2]> {
        self.points.iter().copied().collect()
    }
}
/// Per-channel current buffers (µA) plus the dI/dt traces used by time sweeps.
#[derive(Clone, Debug)]
pub struct ChannelBuffers {
    currents: Vec<ChannelBuffer>,
    derivatives: Vec<ChannelBuffer>,
}
impl ChannelBuffers {
    /// `window` bounds every channel to the most recent `window` points.
    pub fn new(window: Option<usize>) -> Self {
        let make = || match window {
            Some(capacity) => ChannelBuffer::with_capacity(capacity),
            None => ChannelBuffer::unbounded(),
        };
        Self {
            currents: (0..N_CHANNELS).map(|_| make()).collect(),
            derivatives: (0..N_CHANNELS).map(|_| make()).collect(),
        }
    }
    pub fn push_currents(&mut self, x: f64, microamps: &[f64; N_CHANNELS]) {
        for (buffer, &y) in self.currents.iter_mut().zip(microamps) {
            buffer.push(x, y);
        }
    }
    /// Appends one sample per channel and the backward-difference dI/dt against the
    /// previous sample. Returns the derivatives that were appended (µA/s).
    pub fn push_with_derivative(
        &mut self,
        t: f64,
        microamps: &[f64; N_CHANNELS],
    ) -> [f64; N_CHANNELS] {
        let mut rates = [0.0f64; N_CHANNELS];
        for (ch, rate) in rates.iter_mut().enumerate() {
            if let Some([prev_t, prev_y]) = self.currents[ch].last() {
                let dt = t - prev_t;
                *rate = if dt > 0.0 {
                    (microamps[ch] - prev_y) / dt
                } else {
                    0.0
                };
            }
            self.currents[ch].push(t, microamps[ch]);
            self.derivatives[ch].push(t, *rate);
        }
        rates
    }
    pub fn channel(&self, ch: usize) -> Option<&ChannelBuffer> {
        self.currents.get(ch)
    }
    pub fn derivative(&self, ch: usize) -> Option<&ChannelBuffer> {
        self.derivatives.get(ch)
    }
    /// Number of samples in the current sweep (all channels grow together).
    pub fn len(&self) -> usize {
        self.currents.first().map_or(0, ChannelBuffer::len)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn clear(&mut self) {
        self.currents
            .iter_mut()
            .chain(self.derivatives.iter_mut())
            .for_each(ChannelBuffer::clear);
    }
    pub fn currents_vec(&self) -> Vec<Vec<[f64; 2]>> {
        self.currents.iter().map(ChannelBuffer::to_vec).collect()
    }
    pub fn derivatives_vec(&self) -> Vec<Vec<[f64; 2]>> {
        self.derivatives.iter().map(ChannelBuffer::to_vec).collect()
    }
}
/// Immutable copy of the session buffers handed to display code.
#[derive(Clone, Debug, Default)]
pub struct SweepSnapshot {
    pub sweep_index: u64,
    pub currents: Vec<Vec<[f64; 2]>>,    // channel -> (x, µA)
    pub derivatives: Vec<Vec<[f64; 2]>>, // channel -> (t, µA/s), time sweeps only
    pub dirac_history: Vec<Vec<DiracPoint>>,
}
impl SweepSnapshot {
    /// Y range over the selected channels, padded by `margin` of the span.
    pub fn y_range(&self, selected: &[bool], margin: f64) -> Option<(f64, f64)> {
        let mut bounds: Option<(f64, f64)> = None;
        for (ch, points) in self.currents.iter().enumerate() {
            if !selected.get(ch).copied().unwrap_or(true) {
                continue;
            }
            for &[_, y] in points {
                if !y.is_finite() {
                    continue;
                }
                bounds = Some(match bounds {
                    Some((lo, hi)) => (lo.min(y), hi.max(y)),
                    None => (y, y),
                });
            }
        }
        bounds.map(|(lo, hi)| {
            let pad = (hi - lo) * margin;
            (lo - pad, hi + pad)
        })
    }
    /// dI/dV of every channel of the current voltage sweep.
    pub fn transconductance(&self) -> Vec<Vec<[f64; 2]>> {
        self.currents
            .iter()
            .map(|points| {
                let x: Vec<f64> = points.iter().map(|p| p[0]).collect();
                let y: Vec<f64> = points.iter().map(|p| p[1]).collect();
                x.iter().copied().zip(gradient(&x, &y)).map(|(x, g)| [x, g]).collect()
            })
            .collect()
    }
    /// Gate voltage of the steepest negative transconductance for each selected
    /// channel, with their mean.
    pub fn negative_transconductance_points(
        &self,
        selected: &[bool],
    ) -> Option<(Vec<(usize, f64)>, f64)> {
        let points: Vec<(usize, f64)> = self
            .transconductance()
            .iter()
            .enumerate()
            .filter(|(ch, _)| selected.get(*ch).copied().unwrap_or(true))
            .filter_map(|(ch, trace)| {
                trace
                    .iter()
                    .filter(|p| p[1].is_finite())
                    .fold(None::<[f64; 2]>, |best, p| match best {
                        Some(b) if b[1] <= p[1] => Some(b),
                        _ => Some(*p),
                    })
                    .map(|p| (ch, p[0]))
            })
            .collect();
        if points.is_empty() {
            return None;
        }
        let mean = points.iter().map(|(_, v)| v).sum::<f64>() / points.len() as f64;
        Some((points, mean))
    }
}
/// Second-order accurate gradient for non-uniform spacing, one-sided at the edges.
pub fn gradient(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return vec![0.0; n];
    }
    let mut out = vec![0.0; n];
    out[0] = (y[1] - y[0]) / (x[1] - x[0]);
    out[n - 1] = (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2]);
    for i in 1..n - 1 {
        let hd = x[i] - x[i - 1];
        let hs = x[i + 1] - x[i];
        out[i] = (hd * hd * y[i + 1] + (hs * hs - hd * hd) * y[i] - hs * hs * y[i - 1])
            / (hs * hd * (hd + hs));
    }
    out
}
