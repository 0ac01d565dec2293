//! # Virosig Core
//!
//! Shared types for cellularized interferon / viral replication models.
//!
//! ## Model Scales
//!
//! | Scale | Owner | State |
//! |-------|-------|-------|
//! | Intracellular | one `ModelInstance` per (cell, network) | species concentrations |
//! | Extracellular | one field per run | secreted IFN total |
//! | Population | host framework | cell kinds and volumes |
//!
//! ## Time Units
//!
//! Rate constants are expressed per hour. The host advances in Monte Carlo
//! steps (MCS); [`StepClock`] converts between the two.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Host-assigned cell identifier
pub type CellId = u64;

/// Model time (hours)
pub type Time = f64;

/// State vector for ODE systems
pub type StateVector = Array1<f64>;

/// Common errors
#[derive(Debug, Error)]
pub enum VirosigError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Network not found: {0}")]
    NetworkNotFound(String),

    #[error("No {network} instance for cell {cell}")]
    InstanceNotFound { cell: CellId, network: String },

    #[error("Unknown variable {name} in network {network}")]
    UnknownVariable { network: String, name: String },

    #[error("Cell {cell} already has a {network} instance")]
    AlreadyAttached { cell: CellId, network: String },

    #[error("Non-finite value for {variable} in network {network}{}", .cell.map(|c| format!(" (cell {c})")).unwrap_or_default())]
    NonFinite {
        network: String,
        variable: String,
        cell: Option<CellId>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Numerical error: {0}")]
    NumericalError(String),
}

impl VirosigError {
    /// True for lookups a caller may skip over (log and continue)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound { .. } | Self::NetworkNotFound(_))
    }

    /// Attach a cell id to a `NonFinite` error raised below the manager
    pub fn for_cell(self, id: CellId) -> Self {
        match self {
            Self::NonFinite { network, variable, .. } => Self::NonFinite {
                network,
                variable,
                cell: Some(id),
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, VirosigError>;

/// Time series data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn with_units(name: &str, units: &str) -> Self {
        Self {
            units: Some(units.to_string()),
            ..Self::new(name)
        }
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Most recent sample
    pub fn last(&self) -> Option<(Time, f64)> {
        self.time.last().copied().zip(self.values.last().copied())
    }
}

/// ODE system trait (for integrators)
pub trait OdeSystem {
    /// System dimension
    fn dimension(&self) -> usize;

    /// Compute derivatives: dy/dt = f(t, y)
    fn derivatives(&self, t: Time, y: &StateVector) -> StateVector;
}

/// Conversion between host steps (MCS) and model hours
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepClock {
    /// Wall-model minutes represented by one MCS
    pub minutes_per_step: f64,
}

impl StepClock {
    pub fn new(minutes_per_step: f64) -> Self {
        Self { minutes_per_step }
    }

    /// Hours per MCS; also the integration increment handed to every instance
    pub fn hours_per_step(&self) -> Time {
        self.minutes_per_step / 60.0
    }

    /// Days per MCS
    pub fn days_per_step(&self) -> f64 {
        self.minutes_per_step / 1440.0
    }

    /// Model time at the end of step `mcs`
    pub fn hours_at(&self, mcs: u64) -> Time {
        mcs as f64 * self.hours_per_step()
    }

    /// Number of whole steps needed to cover `hours`
    ///
    /// Zero when either `hours` or the step length is not a positive finite number.
    pub fn steps_for_hours(&self, hours: Time) -> u64 {
        let step = self.hours_per_step();
        if !(hours.is_finite() && hours > 0.0 && step.is_finite() && step > 0.0) {
            return 0;
        }
        (hours / step).round() as u64
    }

    /// Scale a per-hour rate constant to a per-step probability/fraction
    pub fn per_step(&self, rate_per_hour: f64) -> f64 {
        rate_per_hour * self.hours_per_step()
    }
}

impl Default for StepClock {
    fn default() -> Self {
        Self::new(10.0)
    }
}
