// src/lib.rs
//! Acquisition and analysis for a 16-channel SMU measuring GFET sensors.
//!
//! `session`/`engine` drive a sweep over a serial link and log it to CSV;
//! `analysis` turns saved resistance sweeps into Dirac shifts and Hill fits.
pub mod analysis;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod session;
pub mod types;
