//! # Boxplot-RS
//!
//! Offline statistics for replicate parameter sweeps.
//!
//! A sweep multiplies one model parameter (`k31`, `beta`, ...) by a list of
//! factors and runs every setting `replicates` times. Each run leaves two
//! comma-separated tables:
//!
//! | File | Columns |
//! |------|---------|
//! | `FullModelCellular_{param}_{p:.2}_{r}.txt` | Time, U, I1, I2, D, Ve, IFNe |
//! | `PlaqueAssay_{param}_{p:.2}_{r}.txt` | Time, avgI1rd, avgI2rd, avgDrd |
//!
//! Per replicate this crate computes the log10 AUC of `Ve` and `IFNe`
//! (trapezoid rule) and the plaque growth rate (least-squares slope of
//! `avgI1rd` over the last samples), then draws one box per multiplier.

use nalgebra::{DMatrix, DVector};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BoxPlotError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Malformed table {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Plot error: {0}")]
    Plot(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),
}

pub type Result<T> = std::result::Result<T, BoxPlotError>;

fn plot_err<E: std::fmt::Display>(e: E) -> BoxPlotError {
    BoxPlotError::Plot(e.to_string())
}

// ============================================================================
// SWEEP LAYOUT
// ============================================================================

/// Where a sweep's replicate tables live and how to read them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepLayout {
    pub data_dir: PathBuf,
    pub parameter: String,
    pub multipliers: Vec<f64>,
    pub replicates: usize,
    /// Data rows read per table (after the header)
    pub rows: usize,
    /// Sample spacing for the AUC (hours)
    pub dt: f64,
    /// Trailing samples used for the growth-rate fit
    pub fit_window: usize,
}

impl SweepLayout {
    pub fn new(data_dir: impl Into<PathBuf>, parameter: &str, multipliers: Vec<f64>) -> Self {
        Self {
            data_dir: data_dir.into(),
            parameter: parameter.to_string(),
            multipliers,
            replicates: 20,
            rows: 480,
            dt: 1.666667e-1,
            fit_window: 10,
        }
    }

    /// IFN production multiplier sweep
    pub fn k31(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            data_dir,
            "k31",
            vec![
                1.0, 3.98, 5.0, 6.31, 7.94, 10.0, 12.59, 15.85, 19.95, 25.12, 39.81, 50.0, 63.10,
                79.43, 100.0, 125.89,
            ],
        )
    }

    /// Infection rate multiplier sweep
    pub fn beta(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            data_dir,
            "beta",
            vec![
                0.01, 0.08, 0.1, 0.13, 0.16, 0.20, 0.25, 0.32, 0.40, 0.50, 0.63, 0.79, 1.0, 1.26,
                10.0, 100.0,
            ],
        )
    }

    pub fn cellular_path(&self, multiplier: f64, replicate: usize) -> PathBuf {
        self.data_dir.join(format!(
            "FullModelCellular_{}_{:.2}_{}.txt",
            self.parameter, multiplier, replicate
        ))
    }

    pub fn plaque_path(&self, multiplier: f64, replicate: usize) -> PathBuf {
        self.data_dir.join(format!(
            "PlaqueAssay_{}_{:.2}_{}.txt",
            self.parameter, multiplier, replicate
        ))
    }
}

// ============================================================================
// TABLES
// ============================================================================

/// Cellular output of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellularTable {
    pub time: Vec<f64>,
    pub uninfected: Vec<f64>,
    pub eclipse: Vec<f64>,
    pub infected: Vec<f64>,
    pub dead: Vec<f64>,
    pub ve: Vec<f64>,
    pub ifne: Vec<f64>,
}

impl CellularTable {
    pub const COLUMNS: [&'static str; 7] = ["Time", "U", "I1", "I2", "D", "Ve", "IFNe"];

    pub fn read(path: &Path, max_rows: usize) -> Result<Self> {
        let mut cols = read_columns(path, Self::COLUMNS.len(), max_rows)?.into_iter();
        let mut next = || cols.next().unwrap_or_default();
        Ok(Self {
            time: next(),
            uninfected: next(),
            eclipse: next(),
            infected: next(),
            dead: next(),
            ve: next(),
            ifne: next(),
        })
    }
}

/// Plaque-assay output of one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaqueTable {
    pub time: Vec<f64>,
    pub avg_i1_radius: Vec<f64>,
    pub avg_i2_radius: Vec<f64>,
    pub avg_dead_radius: Vec<f64>,
}

impl PlaqueTable {
    pub const COLUMNS: [&'static str; 4] = ["Time", "avgI1rd", "avgI2rd", "avgDrd"];

    pub fn read(path: &Path, max_rows: usize) -> Result<Self> {
        let mut cols = read_columns(path, Self::COLUMNS.len(), max_rows)?.into_iter();
        let mut next = || cols.next().unwrap_or_default();
        Ok(Self {
            time: next(),
            avg_i1_radius: next(),
            avg_i2_radius: next(),
            avg_dead_radius: next(),
        })
    }
}

/// First `n_columns` columns of a headed CSV, column-major
fn read_columns(path: &Path, n_columns: usize, max_rows: usize) -> Result<Vec<Vec<f64>>> {
    let csv_err = |source| BoxPlotError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_err)?;

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); n_columns];
    for (row, result) in reader.records().take(max_rows).enumerate() {
        let record = result.map_err(csv_err)?;
        if record.len() < n_columns {
            return Err(BoxPlotError::Malformed {
                path: path.to_path_buf(),
                message: format!("row {} has {} columns, expected {}", row + 1, record.len(), n_columns),
            });
        }
        for (column, field) in columns.iter_mut().zip(record.iter()) {
            let value = field.parse::<f64>().map_err(|e| BoxPlotError::Malformed {
                path: path.to_path_buf(),
                message: format!("row {}: {:?}: {}", row + 1, field, e),
            })?;
            column.push(value);
        }
    }
    log::debug!("read {} rows from {}", columns[0].len(), path.display());
    Ok(columns)
}

// ============================================================================
// METRICS
// ============================================================================

/// Trapezoid-rule integral of evenly spaced samples
pub fn trapz(y: &[f64], dx: f64) -> f64 {
    y.windows(2).map(|w| 0.5 * (w[0] + w[1]) * dx).sum()
}

/// log10 of the trapezoid AUC
pub fn log10_auc(y: &[f64], dx: f64) -> f64 {
    trapz(y, dx).log10()
}

/// Least-squares line through (x, y); returns (slope, intercept)
pub fn linear_fit(x: &[f64], y: &[f64]) -> Result<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return Err(BoxPlotError::InsufficientData(format!(
            "line fit needs 2 points, got {}",
            n
        )));
    }
    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { x[i] } else { 1.0 });
    let rhs = DVector::from_column_slice(&y[..n]);
    let normal = design.transpose() * &design;
    let projected = design.transpose() * rhs;
    let beta = normal.lu().solve(&projected).ok_or_else(|| {
        BoxPlotError::InsufficientData("line fit is singular (all x equal)".into())
    })?;
    Ok((beta[0], beta[1]))
}

/// Slope of `avgI1rd` against time over the last `window` samples
pub fn growth_rate(table: &PlaqueTable, window: usize) -> Result<f64> {
    let n = table.time.len().min(table.avg_i1_radius.len());
    let start = n.saturating_sub(window);
    let (slope, _) = linear_fit(&table.time[start..n], &table.avg_i1_radius[start..n])?;
    Ok(slope)
}

/// Plotted quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantity {
    VirusAuc,
    IfneAuc,
    GrowthRate,
}

impl Quantity {
    pub const ALL: [Quantity; 3] = [Self::VirusAuc, Self::IfneAuc, Self::GrowthRate];

    pub fn file_stem(self) -> &'static str {
        match self {
            Self::VirusAuc => "Virus_AUC",
            Self::IfneAuc => "IFNe_AUC",
            Self::GrowthRate => "Growth_Rate",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::VirusAuc => "Virus AUC",
            Self::IfneAuc => "IFN AUC",
            Self::GrowthRate => "Plaque Growth Rate",
        }
    }

    pub fn y_label(self) -> &'static str {
        match self {
            Self::VirusAuc => "PFU hr/ml",
            Self::IfneAuc => "μM hr",
            Self::GrowthRate => "Plaque Growth Rate (cell diameter/hrs)",
        }
    }

    /// Box fill
    pub fn color(self) -> RGBAColor {
        match self {
            Self::VirusAuc => RGBColor(0x66, 0x66, 0x99).mix(0.75),
            Self::IfneAuc => RGBColor(0x99, 0x33, 0x00).mix(0.75),
            Self::GrowthRate => BLACK.mix(0.5),
        }
    }
}

/// Per-replicate metrics for every multiplier of a sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepMetrics {
    pub parameter: String,
    pub multipliers: Vec<f64>,
    pub virus_auc: Vec<Vec<f64>>,
    pub ifne_auc: Vec<Vec<f64>>,
    pub growth_rate: Vec<Vec<f64>>,
}

impl SweepMetrics {
    /// Read every replicate table of the sweep
    pub fn collect(layout: &SweepLayout) -> Result<Self> {
        let mut metrics = Self {
            parameter: layout.parameter.clone(),
            multipliers: layout.multipliers.clone(),
            ..Default::default()
        };
        for &p in &layout.multipliers {
            let mut virus = Vec::with_capacity(layout.replicates);
            let mut ifne = Vec::with_capacity(layout.replicates);
            let mut growth = Vec::with_capacity(layout.replicates);
            for r in 1..=layout.replicates {
                let cellular = CellularTable::read(&layout.cellular_path(p, r), layout.rows)?;
                virus.push(log10_auc(&cellular.ve, layout.dt));
                ifne.push(log10_auc(&cellular.ifne, layout.dt));

                let plaque = PlaqueTable::read(&layout.plaque_path(p, r), layout.rows)?;
                growth.push(growth_rate(&plaque, layout.fit_window)?);
            }
            metrics.virus_auc.push(virus);
            metrics.ifne_auc.push(ifne);
            metrics.growth_rate.push(growth);
        }
        log::info!(
            "{} sweep: {} multipliers x {} replicates",
            layout.parameter,
            layout.multipliers.len(),
            layout.replicates
        );
        Ok(metrics)
    }

    pub fn groups(&self, quantity: Quantity) -> &[Vec<f64>] {
        match quantity {
            Quantity::VirusAuc => &self.virus_auc,
            Quantity::IfneAuc => &self.ifne_auc,
            Quantity::GrowthRate => &self.growth_rate,
        }
    }

    /// Tick labels, one per multiplier
    pub fn labels(&self) -> Vec<String> {
        self.multipliers.iter().map(|&p| multiplier_label(p)).collect()
    }
}

fn multiplier_label(p: f64) -> String {
    if p.fract() == 0.0 {
        format!("{:.1}", p)
    } else {
        format!("{}", p)
    }
}

// ============================================================================
// BOX STATISTICS
// ============================================================================

/// Five-number summary with 1.5·IQR whiskers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxStats {
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    /// Lowest sample within q1 − 1.5·IQR
    pub whisker_low: f64,
    /// Highest sample within q3 + 1.5·IQR
    pub whisker_high: f64,
    pub outliers: Vec<f64>,
}

impl BoxStats {
    /// `None` when no finite sample remains
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let q1 = quantile(&sorted, 0.25);
        let median = quantile(&sorted, 0.5);
        let q3 = quantile(&sorted, 0.75);
        let iqr = q3 - q1;
        let (lo_fence, hi_fence) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

        let inside = || sorted.iter().copied().filter(|v| (lo_fence..=hi_fence).contains(v));
        let whisker_low = inside().next().unwrap_or(q1);
        let whisker_high = inside().last().unwrap_or(q3);
        let outliers = sorted
            .iter()
            .copied()
            .filter(|v| !(lo_fence..=hi_fence).contains(v))
            .collect();

        Some(Self {
            q1,
            median,
            q3,
            whisker_low,
            whisker_high,
            outliers,
        })
    }

    /// (min, max) of what gets drawn
    fn extent(&self, with_outliers: bool) -> (f64, f64) {
        let mut lo = self.whisker_low;
        let mut hi = self.whisker_high;
        if with_outliers {
            for &v in &self.outliers {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        (lo, hi)
    }
}

/// Linear-interpolated quantile of sorted data
pub fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

// ============================================================================
// RENDERING
// ============================================================================

/// Figure variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlotVariant {
    /// Outliers hidden
    NoOutliers,
    /// Outliers shown, y axis clipped to a configured range
    Filtered,
    /// Every outlier shown
    AllOutliers,
}

impl PlotVariant {
    pub const ALL: [PlotVariant; 3] = [Self::NoOutliers, Self::Filtered, Self::AllOutliers];

    pub fn tag(self) -> &'static str {
        match self {
            Self::NoOutliers => "NoOutliers",
            Self::Filtered => "Filtered",
            Self::AllOutliers => "AllOutliers",
        }
    }

    pub fn shows_outliers(self) -> bool {
        !matches!(self, Self::NoOutliers)
    }
}

/// `Fig.Box{variant}.{quantity}_{param}.svg`
pub fn figure_name(variant: PlotVariant, quantity: Quantity, parameter: &str) -> String {
    format!("Fig.Box{}.{}_{}.svg", variant.tag(), quantity.file_stem(), parameter)
}

/// Rendering options
#[derive(Debug, Clone, Default)]
pub struct PlotOptions {
    /// y range applied by [`PlotVariant::Filtered`]
    pub filtered_ranges: HashMap<Quantity, (f64, f64)>,
    /// Pixel size; defaults to 640×640
    pub size: Option<(u32, u32)>,
}

impl PlotOptions {
    /// Ranges used for the `beta` sweep figures
    pub fn beta() -> Self {
        Self {
            filtered_ranges: [
                (Quantity::VirusAuc, (9.36, 10.01)),
                (Quantity::IfneAuc, (3.00, 3.40)),
            ]
            .into(),
            size: None,
        }
    }
}

/// Draw one box-plot figure to an SVG file
pub fn render_boxplot(
    path: &Path,
    quantity: Quantity,
    variant: PlotVariant,
    labels: &[String],
    groups: &[Vec<f64>],
    y_range: Option<(f64, f64)>,
    size: (u32, u32),
) -> Result<()> {
    let stats: Vec<Option<BoxStats>> = groups.iter().map(|g| BoxStats::from_samples(g)).collect();
    let n = stats.len();
    if stats.iter().all(Option::is_none) {
        return Err(BoxPlotError::InsufficientData(format!(
            "no finite samples for {}",
            quantity.title()
        )));
    }

    let (lo, hi) = match y_range {
        Some(range) => range,
        None => {
            let (lo, hi) = stats
                .iter()
                .flatten()
                .map(|s| s.extent(variant.shows_outliers()))
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), (lo, hi)| {
                    (a.min(lo), b.max(hi))
                });
            let pad = ((hi - lo) * 0.05).max(1e-9);
            (lo - pad, hi + pad)
        }
    };

    let root = SVGBackend::new(path, size).into_drawing_area();

    let mut chart = ChartBuilder::on(&root)
        .caption(quantity.title(), ("sans-serif", 20))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(70)
        .build_cartesian_2d(-0.5..(n as f64 - 0.5), lo..hi)
        .map_err(plot_err)?;

    let tick = |x: &f64| {
        let i = x.round();
        if (x - i).abs() < 1e-6 && i >= 0.0 && (i as usize) < labels.len() {
            labels[i as usize].clone()
        } else {
            String::new()
        }
    };

    chart
        .configure_mesh()
        .disable_x_mesh()
        .disable_y_mesh()
        .x_labels(n)
        .x_label_formatter(&tick)
        .x_label_style(("sans-serif", 12).into_font().transform(FontTransform::Rotate270))
        .x_desc("Parameter Multiplier")
        .y_desc(quantity.y_label())
        .draw()
        .map_err(plot_err)?;

    let half = 0.3;
    let cap = 0.15;
    for (i, s) in stats.iter().enumerate() {
        let Some(s) = s else { continue };
        let x = i as f64;

        // whiskers and caps
        let lines = [
            vec![(x, s.q1), (x, s.whisker_low)],
            vec![(x, s.q3), (x, s.whisker_high)],
            vec![(x - cap, s.whisker_low), (x + cap, s.whisker_low)],
            vec![(x - cap, s.whisker_high), (x + cap, s.whisker_high)],
        ];
        chart
            .draw_series(lines.into_iter().map(|l| PathElement::new(l, BLACK.stroke_width(1))))
            .map_err(plot_err)?;

        chart
            .draw_series([
                Rectangle::new([(x - half, s.q1), (x + half, s.q3)], quantity.color().filled()),
                Rectangle::new([(x - half, s.q1), (x + half, s.q3)], BLACK.stroke_width(1)),
            ])
            .map_err(plot_err)?;

        chart
            .draw_series(std::iter::once(PathElement::new(
                vec![(x - half, s.median), (x + half, s.median)],
                BLACK.stroke_width(2),
            )))
            .map_err(plot_err)?;

        if variant.shows_outliers() {
            chart
                .draw_series(
                    s.outliers
                        .iter()
                        .filter(|v| (lo..=hi).contains(*v))
                        .map(|&v| Circle::new((x, v), 3, BLACK.stroke_width(1))),
                )
                .map_err(plot_err)?;
        }
    }

    root.present().map_err(plot_err)?;
    log::debug!("wrote {}", path.display());
    Ok(())
}

/// All three variants of all three quantities; returns the written paths
pub fn render_all(metrics: &SweepMetrics, out_dir: &Path, options: &PlotOptions) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(out_dir).map_err(|source| BoxPlotError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;
    let labels = metrics.labels();
    let size = options.size.unwrap_or((640, 640));

    let mut written = Vec::with_capacity(9);
    for variant in PlotVariant::ALL {
        for quantity in Quantity::ALL {
            let path = out_dir.join(figure_name(variant, quantity, &metrics.parameter));
            let y_range = match variant {
                PlotVariant::Filtered => options.filtered_ranges.get(&quantity).copied(),
                _ => None,
            };
            render_boxplot(
                &path,
                quantity,
                variant,
                &labels,
                metrics.groups(quantity),
                y_range,
                size,
            )?;
            written.push(path);
        }
    }
    log::info!("wrote {} figures to {}", written.len(), out_dir.display());
    Ok(written)
}

// ============================================================================
// TESTS
// ============================================================================
