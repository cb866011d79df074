//! Dispersion estimation for weighted negative binomial models
//!
//! Three stages run in sequence: weighted method-of-moments gene-wise
//! estimates, a parametric mean-dispersion trend, and empirical Bayes
//! shrinkage of the gene-wise values toward the trend.

mod gene_wise;
mod map;
mod trend;

pub use gene_wise::{estimate_dispersion_gene, estimate_gene_dispersions};
pub use map::{estimate_map_dispersions, estimate_prior_variance, shrink_dispersion};
pub use trend::{fit_dispersion_trend, fit_parametric_trend, TREND_DISP_THRESHOLD};

use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};

/// Configurable parameters for dispersion estimation.
#[derive(Debug, Clone)]
pub struct DispersionParams {
    /// Minimum dispersion value; estimates are clamped here from below.
    pub min_disp: f64,
    /// Gene filter for trend fitting: only genes with a raw dispersion above
    /// this enter the trend regression. Stricter than `min_disp` so genes
    /// stuck at the estimation floor cannot drag the curve down.
    pub trend_disp_threshold: f64,
    /// Count filter for trend fitting, separate from any prefilter applied
    /// to the matrix: a gene informs the regression only when at least
    /// `trend_min_cells` cells reach this raw count.
    pub trend_min_count: f64,
    /// Number of cells that must reach `trend_min_count`.
    pub trend_min_cells: usize,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            trend_disp_threshold: TREND_DISP_THRESHOLD,
            trend_min_count: 5.0,
            trend_min_cells: 3,
        }
    }
}

/// Estimate all dispersions (gene-wise, trended, and MAP).
///
/// When the trend regression fails on the default gene subset, the stage
/// retries once with a doubled dispersion threshold, which removes genes
/// hovering just above the floor. A second `TrendFittingFailed` propagates
/// to the caller.
pub fn estimate_dispersions(dds: &mut ZinbDataSet, params: &DispersionParams) -> Result<()> {
    estimate_gene_dispersions(dds, params)?;

    match fit_dispersion_trend(dds, params, params.trend_disp_threshold) {
        Ok(()) => {}
        Err(ZinbDiffError::TrendFittingFailed { reason }) => {
            let stricter = params.trend_disp_threshold * 2.0;
            log::warn!(
                "Dispersion trend fit failed ({}); retrying with threshold {:.1e}",
                reason,
                stricter
            );
            fit_dispersion_trend(dds, params, stricter)?;
        }
        Err(e) => return Err(e),
    }

    estimate_map_dispersions(dds, params)
}
