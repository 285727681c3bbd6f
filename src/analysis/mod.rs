//! Analysis module for signal processing
//!
//! This module provides the ERD computation chain:
//! - Butterworth band-pass design and zero-phase filtering
//! - Welch power spectral density and band power
//! - ERD metrics (band-pass power, Welch, dB, moving window)
//! - Trial aggregation over recorded sessions

pub mod erd;
pub mod filter;
pub mod spectral;
pub mod trials;

pub use erd::{common_average_reference, erd_db, erd_percent, ErdCalculator, MovingWindowErd};
pub use filter::{BiquadCoeffs, SosFilter};
pub use spectral::{Psd, WelchConfig, WelchEstimator, WindowFunction};
pub use trials::{calculate_erd_across_trials, extract_epoch, CategoryErd, TrialFailure};
