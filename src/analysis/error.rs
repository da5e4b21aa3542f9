// src/analysis/error.rs
use std::path::PathBuf;
use thiserror::Error;
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("{path} needs a voltage column, one device column and two rows, got {rows}x{columns}")]
    TooSmall {
        path: PathBuf,
        rows: usize,
        columns: usize,
    },
    #[error("{path} has {actual} voltage points, expected {expected}")]
    AxisLengthMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("{path} has {actual} devices, expected {expected}")]
    DeviceCountMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("at least one concentration file is required")]
    NoConcentrations,
    #[error("reference concentration {index} is out of range for {count} concentrations")]
    ReferenceOutOfRange { index: usize, count: usize },
    #[error(transparent)]
    Fit(#[from] FitError),
}
/// Nonlinear least-squares failures. Never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("x and y lengths differ ({x} vs {y})")]
    LengthMismatch { x: usize, y: usize },
    #[error("need more than {parameters} points to fit, got {points}")]
    TooFewPoints { parameters: usize, points: usize },
    #[error("data contains non-finite values")]
    NonFiniteInput,
    #[error("fit did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },
}
