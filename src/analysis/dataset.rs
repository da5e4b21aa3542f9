// src/analysis/dataset.rs
use std::fs;
use std::path::{Path, PathBuf};
use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use crate::analysis::error::AnalysisError;
/// Index of the largest value; the first occurrence wins and NaN never does.
pub fn argmax(values: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::NEG_INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}
pub fn argmin(values: ArrayView1<'_, f64>) -> usize {
    let mut best = 0;
    let mut best_value = f64::INFINITY;
    for (i, &v) in values.iter().enumerate() {
        if v < best_value {
            best = i;
            best_value = v;
        }
    }
    best
}
/// `r[i] - r[i + 1]` along the last axis.
fn backward_difference(resistances: &Array3<f64>) -> Array3<f64> {
    &resistances.slice(s![.., .., ..-1]) - &resistances.slice(s![.., .., 1..])
}
/// One whitespace-delimited sweep file: gate voltage in column 0 and one
/// resistance column per device.
#[derive(Clone, Debug)]
pub struct SweepFile {
    pub path: PathBuf,
    pub voltages: Array1<f64>,
    /// device x point
    pub resistances: Array2<f64>,
}
impl SweepFile {
    pub fn load(path: &Path) -> Result<Self, AnalysisError> {
        let text = fs::read_to_string(path).map_err(|source| AnalysisError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::parse(path, &text)?;
        debug!(
            "Loaded {}: {} points, {} devices",
            path.display(),
            file.num_points(),
            file.num_devices()
        );
        Ok(file)
    }
    /// Blank lines and `#` comments are skipped; every row must have the same width.
    pub fn parse(path: &Path, text: &str) -> Result<Self, AnalysisError> {
        let mut rows: Vec<Vec<f64>> = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let content = line.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let row = content
                .split_whitespace()
                .map(|token| {
                    token.parse::<f64>().map_err(|_| AnalysisError::Parse {
                        path: path.to_path_buf(),
                        line: line_no + 1,
                        reason: format!("not a number: {token:?}"),
                    })
                })
                .collect::<Result<Vec<f64>, _>>()?;
            if let Some(first) = rows.first() {
                if first.len() != row.len() {
                    return Err(AnalysisError::Parse {
                        path: path.to_path_buf(),
                        line: line_no + 1,
                        reason: format!("expected {} columns, got {}", first.len(), row.len()),
                    });
                }
            }
            rows.push(row);
        }
        let columns = rows.first().map_or(0, Vec::len);
        if rows.len() < 2 || columns < 2 {
            return Err(AnalysisError::TooSmall {
                path: path.to_path_buf(),
                rows: rows.len(),
                columns,
            });
        }
        let table = Array2::from_shape_fn((rows.len(), columns), |(r, c)| rows[r][c]);
        Ok(Self {
            path: path.to_path_buf(),
            voltages: table.column(0).to_owned(),
            resistances: table.slice(s![.., 1..]).t().to_owned(),
        })
    }
    pub fn num_devices(&self) -> usize {
        self.resistances.nrows()
    }
    pub fn num_points(&self) -> usize {
        self.voltages.len()
    }
    /// Gate voltage of the resistance maximum, per device.
    pub fn dirac_voltages(&self) -> Array1<f64> {
        self.resistances
            .axis_iter(Axis(0))
            .map(|r| self.voltages[argmax(r)])
            .collect()
    }
}
/// Resistance sweeps of several devices across analyte concentrations, with
/// an aptamer-only baseline and an initial-Dirac baseline sharing one axis.
#[derive(Clone, Debug)]
pub struct Dataset {
    voltages: Array1<f64>,
    /// concentration x device x point
    resistances: Array3<f64>,
    derivatives: Array3<f64>,
    aptamer: Array2<f64>,
    aptamer_derivatives: Array2<f64>,
    initial: Array2<f64>,
}
impl Dataset {
    pub fn load(
        concentrations: &[PathBuf],
        aptamer: &Path,
        initial: &Path,
    ) -> Result<Self, AnalysisError> {
        let files = concentrations
            .iter()
            .map(|p| SweepFile::load(p))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(files, SweepFile::load(aptamer)?, SweepFile::load(initial)?)
    }
    /// The longest concentration axis is canonical. Every file, baselines
    /// included, must match its length and device count.
    pub fn new(
        concentrations: Vec<SweepFile>,
        aptamer: SweepFile,
        initial: SweepFile,
    ) -> Result<Self, AnalysisError> {
        let canonical = concentrations
            .iter()
            .max_by_key(|f| f.num_points())
            .ok_or(AnalysisError::NoConcentrations)?;
        let points = canonical.num_points();
        let devices = canonical.num_devices();
        for file in concentrations.iter().chain([&aptamer, &initial]) {
            if file.num_points() != points {
                return Err(AnalysisError::AxisLengthMismatch {
                    path: file.path.clone(),
                    expected: points,
                    actual: file.num_points(),
                });
            }
            if file.num_devices() != devices {
                return Err(AnalysisError::DeviceCountMismatch {
                    path: file.path.clone(),
                    expected: devices,
                    actual: file.num_devices(),
                });
            }
        }
        let voltages = canonical.voltages.clone();
        let resistances = Array3::from_shape_fn(
            (concentrations.len(), devices, points),
            |(c, d, p)| concentrations[c].resistances[[d, p]],
        );
        let derivatives = backward_difference(&resistances);
        let aptamer_derivatives =
            &aptamer.resistances.slice(s![.., ..-1]) - &aptamer.resistances.slice(s![.., 1..]);
        info!(
            "Dataset: {} concentrations, {} devices, {} voltage points",
            concentrations.len(),
            devices,
            points
        );
        Ok(Self {
            voltages,
            resistances,
            derivatives,
            aptamer: aptamer.resistances,
            aptamer_derivatives,
            initial: initial.resistances,
        })
    }
    pub fn voltages(&self) -> &Array1<f64> {
        &self.voltages
    }
    pub fn num_concentrations(&self) -> usize {
        self.resistances.len_of(Axis(0))
    }
    pub fn num_devices(&self) -> usize {
        self.resistances.len_of(Axis(1))
    }
    pub fn resistances(&self) -> &Array3<f64> {
        &self.resistances
    }
    pub fn resistance_derivatives(&self) -> &Array3<f64> {
        &self.derivatives
    }
    pub fn aptamer_resistance_derivatives(&self) -> &Array2<f64> {
        &self.aptamer_derivatives
    }
    pub fn conductances(&self) -> Array3<f64> {
        self.resistances.mapv(|r| 1.0 / r)
    }
    /// Maps `f(voltage index of the extremum)` over every (concentration, device) trace.
    fn per_trace(
        &self,
        traces: &Array3<f64>,
        pick: impl Fn(ArrayView1<'_, f64>) -> usize,
    ) -> Array2<usize> {
        Array2::from_shape_fn((self.num_concentrations(), self.num_devices()), |(c, d)| {
            pick(traces.slice(s![c, d, ..]))
        })
    }
    fn baseline_dirac(&self, baseline: &Array2<f64>) -> Array1<f64> {
        baseline
            .axis_iter(Axis(0))
            .map(|r| self.voltages[argmax(r)])
            .collect()
    }
    pub fn dirac_voltages(&self) -> Array2<f64> {
        self.per_trace(&self.resistances, argmax)
            .mapv(|i| self.voltages[i])
    }
    pub fn aptamer_dirac_voltages(&self) -> Array1<f64> {
        self.baseline_dirac(&self.aptamer)
    }
    pub fn initial_dirac_voltages(&self) -> Array1<f64> {
        self.baseline_dirac(&self.initial)
    }
    pub fn adjusted_dirac_voltages(&self) -> Array2<f64> {
        &self.dirac_voltages() - &self.aptamer_dirac_voltages()
    }
    pub fn normalized_dirac_voltages(&self) -> Array2<f64> {
        let baseline = self.aptamer_dirac_voltages();
        (&self.adjusted_dirac_voltages() - &baseline) / &baseline
    }
    pub fn dirac_shift_from_initial(&self) -> Array2<f64> {
        &self.dirac_voltages() - &self.initial_dirac_voltages()
    }
    pub fn positive_transconductance_voltages(&self) -> Array2<f64> {
        self.per_trace(&self.derivatives, argmax)
            .mapv(|i| self.voltages[i])
    }
    pub fn negative_transconductance_voltages(&self) -> Array2<f64> {
        self.per_trace(&self.derivatives, argmin)
            .mapv(|i| self.voltages[i])
    }
    /// Conductance `1/R` at the positive and negative derivative extrema.
    pub fn transconductance_conductances(&self) -> (Array2<f64>, Array2<f64>) {
        let at = |indices: Array2<usize>| {
            Array2::from_shape_fn(indices.dim(), |(c, d)| {
                1.0 / self.resistances[[c, d, indices[[c, d]]]]
            })
        };
        (
            at(self.per_trace(&self.derivatives, argmax)),
            at(self.per_trace(&self.derivatives, argmin)),
        )
    }
    /// Axis index closest to `voltage`.
    pub fn nearest_index(&self, voltage: f64) -> usize {
        argmin(self.voltages.mapv(|v| (v - voltage).abs()).view())
    }
    fn aptamer_conductance_at(&self, index: usize) -> Array1<f64> {
        self.aptamer.column(index).mapv(|r| 1.0 / r)
    }
    pub fn conductance_shifts(&self, voltage: f64) -> Array2<f64> {
        let index = self.nearest_index(voltage);
        let conductance = self.resistances.slice(s![.., .., index]).mapv(|r| 1.0 / r);
        &conductance - &self.aptamer_conductance_at(index)
    }
    pub fn normalized_conductance_shifts(&self, voltage: f64) -> Array2<f64> {
        let baseline = self.aptamer_conductance_at(self.nearest_index(voltage));
        (&self.conductance_shifts(voltage) - &baseline) / &baseline
    }
}
