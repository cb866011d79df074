//! Parametric dispersion-mean trend fitting

use ndarray::Array1;

use super::DispersionParams;
use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};

/// Genes must exceed this dispersion to enter the trend fit. The raw
/// stage floors estimates at min_disp, so anything near the floor is a
/// boundary artifact, not information about the trend.
pub const TREND_DISP_THRESHOLD: f64 = 1e-6;

/// Fit the parametric trend `dispersion(mean) = asympt_disp + extra_pois / mean`
/// to the gene-wise dispersions and store the trended values.
///
/// The fit runs on a stricter gene subset than raw estimation: genes with
/// at least `trend_min_cells` cells at or above `trend_min_count`, positive
/// mean, and dispersion above `disp_threshold`. Trend values are still
/// produced for every gene from the fitted coefficients. When the Gamma GLM
/// cannot produce positive coefficients the error is returned as
/// `TrendFittingFailed` so the caller can distinguish it from other failures
/// and retry on a stricter subset.
pub fn fit_dispersion_trend(
    dds: &mut ZinbDataSet,
    params: &DispersionParams,
    disp_threshold: f64,
) -> Result<()> {
    let gene_dispersions =
        dds.gene_dispersions()
            .ok_or_else(|| ZinbDiffError::TrendFittingFailed {
                reason: "Gene-wise dispersions must be estimated first".to_string(),
            })?;

    let normalized = dds
        .normalized_counts()
        .ok_or_else(|| ZinbDiffError::TrendFittingFailed {
            reason: "Normalized counts required for trend fitting".to_string(),
        })?;

    let n_cells = dds.n_cells() as f64;
    let means: Vec<f64> = normalized
        .rows()
        .into_iter()
        .map(|row| row.sum() / n_cells)
        .collect();

    let counts = dds.counts().counts();
    let mut fit_means = Vec::with_capacity(means.len());
    let mut fit_disps = Vec::with_capacity(means.len());
    for (g, row) in counts.rows().into_iter().enumerate() {
        let cells_above = row
            .iter()
            .filter(|&&c| c >= params.trend_min_count)
            .count();
        if cells_above >= params.trend_min_cells {
            fit_means.push(means[g]);
            fit_disps.push(gene_dispersions[g]);
        }
    }

    let (asympt_disp, extra_pois) = fit_parametric_trend(&fit_means, &fit_disps, disp_threshold)?;

    let trended: Vec<f64> = means
        .iter()
        .map(|&m| {
            if m > 0.0 {
                asympt_disp + extra_pois / m
            } else {
                asympt_disp
            }
        })
        .collect();

    dds.set_dispersion_function(asympt_disp, extra_pois);
    dds.set_trended_dispersions(Array1::from_vec(trended))?;
    Ok(())
}

/// Fit the parametric trend coefficients to (mean, dispersion) pairs.
/// Returns (asympt_disp, extra_pois), both strictly positive.
pub fn fit_parametric_trend(
    means: &[f64],
    dispersions: &[f64],
    disp_threshold: f64,
) -> Result<(f64, f64)> {
    let valid: Vec<(f64, f64)> = means
        .iter()
        .zip(dispersions.iter())
        .filter(|(&m, &d)| m > 0.0 && d > disp_threshold && d.is_finite())
        .map(|(&m, &d)| (m, d))
        .collect();

    if valid.len() < 3 {
        return Err(ZinbDiffError::TrendFittingFailed {
            reason: format!(
                "Only {} genes passed the trend filter (dispersion > {:.1e}); at least 3 required",
                valid.len(),
                disp_threshold
            ),
        });
    }

    fit_trend_iterative(&valid)
}

/// Iterative Gamma GLM with outlier exclusion.
///
/// Each round drops genes whose ratio to the current fitted trend falls
/// outside (1e-4, 15) and refits until the coefficients stabilize.
fn fit_trend_iterative(data: &[(f64, f64)]) -> Result<(f64, f64)> {
    let mut coefs = (0.1_f64, 1.0_f64);
    let max_iter = 11;
    let tol = 1e-6;

    for _iter in 0..max_iter {
        let old_coefs = coefs;

        let good_data: Vec<(f64, f64)> = data
            .iter()
            .filter(|&&(mean, disp)| {
                let fitted = coefs.0 + coefs.1 / mean;
                if fitted <= 0.0 {
                    return false;
                }
                let ratio = disp / fitted;
                ratio > 1e-4 && ratio < 15.0
            })
            .copied()
            .collect();

        if good_data.len() < 3 {
            return Err(ZinbDiffError::TrendFittingFailed {
                reason: "Too few genes remained after outlier exclusion".to_string(),
            });
        }

        let (new_coefs, glm_converged) = fit_gamma_glm_identity(&good_data, coefs);
        coefs = new_coefs;

        if coefs.0 <= 0.0 || coefs.1 <= 0.0 || !coefs.0.is_finite() || !coefs.1.is_finite() {
            return Err(ZinbDiffError::TrendFittingFailed {
                reason: format!(
                    "Trend coefficients not positive (asympt_disp={:.4}, extra_pois={:.4}); \
                     dispersion does not decrease with mean on this subset",
                    coefs.0, coefs.1
                ),
            });
        }

        let log_change =
            (coefs.0 / old_coefs.0).ln().powi(2) + (coefs.1 / old_coefs.1).ln().powi(2);

        if log_change < tol && glm_converged {
            log::debug!(
                "Parametric trend converged: asympt_disp={:.6}, extra_pois={:.4}",
                coefs.0,
                coefs.1
            );
            return Ok(coefs);
        }
    }

    Err(ZinbDiffError::TrendFittingFailed {
        reason: "Parametric trend fit did not converge within 11 rounds".to_string(),
    })
}

/// Fit a Gamma GLM with identity link: disp ~ 1 + 1/mean.
/// Returns ((asympt_disp, extra_pois), converged).
fn fit_gamma_glm_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let mut a0 = start.0;
    let mut a1 = start.1;
    let irls_max_iter = 25;
    let irls_tol = 1e-8;
    let mut converged = false;

    let deviance = |a0: f64, a1: f64| -> f64 {
        let mut dev = 0.0;
        for &(mean, disp) in data {
            let mu = (a0 + a1 / mean).max(1e-8);
            dev += 2.0 * (-(disp / mu).ln() + (disp - mu) / mu);
        }
        dev
    };

    let mut dev_old = deviance(a0, a1);

    for _iter in 0..irls_max_iter {
        let mut sum_w = 0.0_f64;
        let mut sum_wx = 0.0_f64;
        let mut sum_wz = 0.0_f64;
        let mut sum_wxx = 0.0_f64;
        let mut sum_wxz = 0.0_f64;

        for &(mean, disp) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            // Gamma variance is mu^2, so the identity-link IRLS weight is 1/mu^2
            let w = 1.0 / (mu * mu);
            let z = disp;

            sum_w += w;
            sum_wx += w * x;
            sum_wz += w * z;
            sum_wxx += w * x * x;
            sum_wxz += w * x * z;
        }

        let det = sum_w * sum_wxx - sum_wx * sum_wx;
        if det.abs() < 1e-10 {
            break;
        }

        a0 = (sum_wxx * sum_wz - sum_wx * sum_wxz) / det;
        a1 = (sum_w * sum_wxz - sum_wx * sum_wz) / det;

        let dev = deviance(a0, a1);
        let dev_change = (dev_old - dev).abs() / (0.1 + dev.abs());
        if dev_change < irls_tol {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    ((a0, a1), converged)
}
