//! Predictive pre-scaling of HPA replica floors
//!
//! This module provides:
//! - the [`Forecaster`] contract and its HTTP client
//! - per-deployment [`PreScaleProfile`] state
//! - [`PreScaleManager`], the pre-scale state machine and its rollback worker

mod forecast;
mod manager;
mod profile;


pub use forecast::{ForecastError, ForecastWindow, Forecaster, HttpForecaster, Prediction};
pub use manager::{
    required_replicas, spawn_rollback_worker, PreScaleConfig, PreScaleError, PreScaleManager,
    PreScaleOutcome,
};
pub use profile::{
    PreScaleProfile, PreScaleSnapshot, PreScaleState, PreScaleStats, PredictionRecord,
    RollbackReason,
};
