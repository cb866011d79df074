//! MAP dispersion estimation
//!
//! Empirical Bayes shrinkage of the gene-wise dispersions toward the fitted
//! trend. Each gene-wise estimate is treated as a noisy observation of the
//! true log dispersion with sampling variance trigamma(df / 2), where df is
//! the effective residual degrees of freedom (total observation weight minus
//! the number of design coefficients). Combined with a log-normal prior
//! centered on the trend, the posterior mode has a closed form on the log
//! scale.

use ndarray::Array1;
use rayon::prelude::*;

use crate::data::ZinbDataSet;
use crate::dispersion::DispersionParams;
use crate::error::{Result, ZinbDiffError};
use crate::glm::create_design_matrix;
use crate::stats::{mad_squared, trigamma};

/// Floor for the shrinkage prior variance.
const MIN_PRIOR_VAR: f64 = 0.25;

/// Shrink gene-wise dispersions toward the trend and store the MAP values.
///
/// Every gene is shrunk, including genes at the estimation floor; how far a
/// gene moves toward the trend depends only on its effective residual
/// degrees of freedom. Genes whose raw estimate is undefined (all-zero rows)
/// take the trend value directly. The prior variance is cached on the
/// dataset for the diagnostics surface.
pub fn estimate_map_dispersions(dds: &mut ZinbDataSet, params: &DispersionParams) -> Result<()> {
    let gene_dispersions = dds
        .gene_dispersions()
        .ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Gene-wise dispersions required before MAP shrinkage".to_string(),
        })?
        .clone();

    let trended_dispersions = dds
        .trended_dispersions()
        .ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Trended dispersions required before MAP shrinkage".to_string(),
        })?
        .clone();

    let n_genes = dds.n_genes();
    let n_cells = dds.n_cells();
    let (design, _) = create_design_matrix(dds.cell_metadata(), dds.condition_variable())?;
    let n_coef = design.ncols() as f64;

    // Effective residual degrees of freedom per gene. Down-weighted
    // observations carry less information, so sum(weights) replaces the
    // cell count.
    let residual_df: Vec<f64> = match dds.weights() {
        Some(w) => w.rows().into_iter().map(|row| row.sum() - n_coef).collect(),
        None => vec![n_cells as f64 - n_coef; n_genes],
    };
    let mean_df = residual_df.iter().sum::<f64>() / n_genes as f64;

    let raw_slice = gene_dispersions
        .as_slice()
        .ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Dispersion array is not contiguous".to_string(),
        })?;
    let trend_slice = trended_dispersions
        .as_slice()
        .ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Trended dispersion array is not contiguous".to_string(),
        })?;

    let prior_var = estimate_prior_variance(raw_slice, trend_slice, mean_df, params.min_disp);

    log::debug!(
        "Dispersion shrinkage: prior variance {:.6}, mean residual df {:.2}",
        prior_var,
        mean_df
    );
    dds.set_dispersion_prior_var(prior_var);

    let min_disp = params.min_disp;
    let max_disp = (n_cells as f64).max(10.0);

    let map_dispersions: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            shrink_dispersion(
                gene_dispersions[i],
                trended_dispersions[i],
                residual_df[i],
                prior_var,
                min_disp,
                max_disp,
            )
        })
        .collect();

    dds.set_map_dispersions(Array1::from_vec(map_dispersions))?;
    Ok(())
}

/// Estimate the prior variance for dispersion shrinkage.
///
/// The spread of log residuals `ln(raw) - ln(trend)` is measured by the
/// squared median absolute deviation over genes clear of the estimation
/// floor, then the expected sampling variance `trigamma(df / 2)` is
/// subtracted so the prior reflects only the biological excess. Floored at
/// 0.25 so shrinkage never becomes degenerate.
pub fn estimate_prior_variance(
    gene_dispersions: &[f64],
    trended_dispersions: &[f64],
    residual_df: f64,
    min_disp: f64,
) -> f64 {
    // Genes clamped to the floor say nothing about the spread.
    let disp_floor = min_disp * 100.0;

    let log_residuals: Vec<f64> = gene_dispersions
        .iter()
        .zip(trended_dispersions.iter())
        .filter(|(&g, &t)| g.is_finite() && t.is_finite() && g >= disp_floor && t > 0.0)
        .map(|(&g, &t)| g.ln() - t.ln())
        .collect();

    if log_residuals.len() < 3 {
        return MIN_PRIOR_VAR;
    }

    let spread = mad_squared(&log_residuals);

    if residual_df <= 0.0 {
        return MIN_PRIOR_VAR;
    }

    (spread - trigamma(residual_df / 2.0)).max(MIN_PRIOR_VAR)
}

/// Closed-form posterior mode for one gene.
///
/// Log raw and log trend are averaged with weights inverse to the sampling
/// variance and the prior variance, so the result always lies between the
/// two inputs. Undefined raw estimates and exhausted degrees of freedom
/// collapse onto the trend.
pub fn shrink_dispersion(
    raw: f64,
    trend: f64,
    residual_df: f64,
    prior_var: f64,
    min_disp: f64,
    max_disp: f64,
) -> f64 {
    if !trend.is_finite() || trend <= 0.0 {
        if raw.is_finite() && raw > 0.0 {
            return raw.max(min_disp).min(max_disp);
        }
        return min_disp;
    }

    if !raw.is_finite() || raw <= 0.0 || residual_df <= 0.0 {
        return trend.max(min_disp).min(max_disp);
    }

    let samp_var = trigamma(residual_df / 2.0);
    let log_map = (prior_var * raw.ln() + samp_var * trend.ln()) / (prior_var + samp_var);

    log_map.exp().max(min_disp).min(max_disp)
}
