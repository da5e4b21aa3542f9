// src/analysis/mod.rs
pub mod dataset;
pub mod error;
pub mod hill;
pub use dataset::{argmax, argmin, Dataset, SweepFile};
pub use error::{AnalysisError, FitError};
pub use hill::{analysis, fit_hill, FitOptions, HillAnalysis, HillCurve};
