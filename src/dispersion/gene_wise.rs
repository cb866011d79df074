//! Raw gene-wise dispersion estimation using weighted moments
//!
//! Observation weights from the zero-inflation model reduce each cell's
//! contribution to the moment sums, so excluded zeros neither inflate the
//! variance nor count toward the effective sample size.

use ndarray::{Array1, Array2};
use rayon::prelude::*;

use crate::data::ZinbDataSet;
use crate::dispersion::DispersionParams;
use crate::error::{Result, ZinbDiffError};
use crate::glm::create_design_matrix;

/// Floor for preliminary expected counts
const MIN_PRELIM_MU: f64 = 0.5;

/// Estimate raw gene-wise dispersions with the weighted moments method
/// and store them along with the preliminary expected counts.
pub fn estimate_gene_dispersions(dds: &mut ZinbDataSet, params: &DispersionParams) -> Result<()> {
    if !dds.has_size_factors() {
        return Err(ZinbDiffError::InvalidInput {
            reason: "Size factors must be estimated before dispersion estimation".to_string(),
        });
    }

    let (design, _info) = create_design_matrix(dds.cell_metadata(), dds.condition_variable())?;

    let n_genes = dds.n_genes();
    let n_cells = dds.n_cells();

    if n_cells <= design.ncols() {
        return Err(ZinbDiffError::InvalidInput {
            reason: format!(
                "Design has {} coefficients for {} cells; no replication left for \
                 dispersion estimation",
                design.ncols(),
                n_cells
            ),
        });
    }

    let results: Vec<(f64, Vec<f64>)> = {
        let counts = dds.counts().counts();
        let size_factors = dds.size_factors().ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Size factors missing".to_string(),
        })?;
        let sf_slice = size_factors.as_slice().ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Size factor array is not contiguous".to_string(),
        })?;
        let weights = dds.weights();

        let xim: f64 =
            sf_slice.iter().map(|&s| 1.0 / s.max(1e-10)).sum::<f64>() / n_cells as f64;

        (0..n_genes)
            .into_par_iter()
            .map(|i| {
                let gene_counts: Vec<f64> = (0..n_cells).map(|j| counts[[i, j]]).collect();
                let gene_weights: Vec<f64> = match weights {
                    Some(w) => (0..n_cells).map(|j| w[[i, j]]).collect(),
                    None => vec![1.0; n_cells],
                };
                estimate_dispersion_gene(
                    &gene_counts,
                    &gene_weights,
                    sf_slice,
                    &design,
                    xim,
                    params,
                )
            })
            .collect()
    };

    let n_nan = results.iter().filter(|(d, _)| d.is_nan()).count();
    if n_nan > 0 {
        log::warn!(
            "{} genes have all-zero counts; their dispersions are undefined",
            n_nan
        );
    }

    let dispersions: Vec<f64> = results.iter().map(|(d, _)| *d).collect();
    let mut mu_matrix = Array2::zeros((n_genes, n_cells));
    for (i, (_, mu)) in results.iter().enumerate() {
        for (j, &mu_val) in mu.iter().enumerate() {
            mu_matrix[[i, j]] = mu_val;
        }
    }

    dds.set_gene_dispersions(Array1::from_vec(dispersions))?;
    dds.set_mu(mu_matrix)?;

    Ok(())
}

/// Estimate a single gene's raw dispersion.
///
/// Takes the smaller of two weighted moment estimators, both computed on
/// size-factor-normalized counts:
/// residual-based against fitted group means, and variance-based against
/// the weighted mean. The result is clamped to [min_disp, max(n, 10)].
///
/// Returns (dispersion, mu) where mu holds the preliminary expected counts
/// on the raw count scale. All-zero genes get a NaN dispersion.
pub fn estimate_dispersion_gene(
    counts: &[f64],
    obs_weights: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    xim: f64,
    params: &DispersionParams,
) -> (f64, Vec<f64>) {
    let n_cells = counts.len();

    if counts.iter().all(|&c| c == 0.0) {
        return (f64::NAN, vec![0.0; n_cells]);
    }

    let min_disp = params.min_disp;
    let max_disp = (n_cells as f64).max(10.0);

    let normalized: Vec<f64> = counts
        .iter()
        .zip(size_factors.iter())
        .map(|(&c, &s)| if s > 0.0 { c / s } else { 0.0 })
        .collect();

    let mu_norm = weighted_linear_model_mu(&normalized, obs_weights, design);

    let rough = weighted_rough_disp(&normalized, obs_weights, &mu_norm, design.ncols());
    let moments = weighted_moments_disp(&normalized, obs_weights, xim);

    let alpha = rough.min(moments).max(min_disp).min(max_disp);

    let mu: Vec<f64> = mu_norm
        .iter()
        .zip(size_factors.iter())
        .map(|(&m, &s)| (m * s).max(MIN_PRELIM_MU))
        .collect();

    (alpha, mu)
}

/// Weighted least squares fit of normalized counts on the design,
/// giving weighted group means as fitted values
fn weighted_linear_model_mu(
    normalized: &[f64],
    obs_weights: &[f64],
    design: &Array2<f64>,
) -> Vec<f64> {
    let n = normalized.len();
    let p = design.ncols();

    let mut xtwx = vec![vec![0.0; p]; p];
    let mut xtwy = vec![0.0; p];

    for i in 0..n {
        let w = obs_weights[i];
        for j in 0..p {
            xtwy[j] += w * design[[i, j]] * normalized[i];
            for k in 0..p {
                xtwx[j][k] += w * design[[i, j]] * design[[i, k]];
            }
        }
    }

    let weighted_mean = || {
        let sum_w: f64 = obs_weights.iter().sum();
        if sum_w > 0.0 {
            normalized
                .iter()
                .zip(obs_weights.iter())
                .map(|(&y, &w)| w * y)
                .sum::<f64>()
                / sum_w
        } else {
            normalized.iter().sum::<f64>() / n as f64
        }
    };

    let beta = if p == 2 {
        let det = xtwx[0][0] * xtwx[1][1] - xtwx[0][1] * xtwx[1][0];
        if det.abs() > 1e-10 {
            vec![
                (xtwx[1][1] * xtwy[0] - xtwx[0][1] * xtwy[1]) / det,
                (xtwx[0][0] * xtwy[1] - xtwx[1][0] * xtwy[0]) / det,
            ]
        } else {
            vec![weighted_mean(), 0.0]
        }
    } else {
        solve_linear_system(&xtwx, &xtwy).unwrap_or_else(|| {
            let mut fallback = vec![0.0; p];
            fallback[0] = weighted_mean();
            fallback
        })
    };

    (0..n)
        .map(|i| {
            let mut mu = 0.0;
            for j in 0..p {
                mu += design[[i, j]] * beta[j];
            }
            mu
        })
        .collect()
}

/// Residual-based moment estimator:
/// sum_i w_i * ((y_i - mu_i)^2 - mu_i) / mu_i^2, divided by the effective
/// residual degrees of freedom sum(w) - p
fn weighted_rough_disp(
    normalized: &[f64],
    obs_weights: &[f64],
    mu_norm: &[f64],
    p: usize,
) -> f64 {
    let mut sum_term = 0.0;
    let mut sum_w = 0.0;
    for i in 0..normalized.len() {
        let w = obs_weights[i];
        let mu = mu_norm[i].max(1.0);
        let y = normalized[i];
        sum_term += w * ((y - mu).powi(2) - mu) / (mu * mu);
        sum_w += w;
    }

    let dof = (sum_w - p as f64).max(1.0);
    (sum_term / dof).max(0.0)
}

/// Variance-based moment estimator:
/// (weighted var - xim * weighted mean) / weighted mean^2
/// where xim is the mean of 1/size_factor across cells
fn weighted_moments_disp(normalized: &[f64], obs_weights: &[f64], xim: f64) -> f64 {
    let sum_w: f64 = obs_weights.iter().sum();
    if sum_w <= 1.0 {
        return f64::INFINITY;
    }

    let mean: f64 = normalized
        .iter()
        .zip(obs_weights.iter())
        .map(|(&y, &w)| w * y)
        .sum::<f64>()
        / sum_w;

    let var: f64 = normalized
        .iter()
        .zip(obs_weights.iter())
        .map(|(&y, &w)| w * (y - mean).powi(2))
        .sum::<f64>()
        / (sum_w - 1.0);

    if mean > 1e-10 {
        (var - xim * mean) / (mean * mean)
    } else {
        // Very low expression: undefined, caller clamps to max_disp
        f64::INFINITY
    }
}

/// Gaussian elimination with partial pivoting; None when singular
fn solve_linear_system(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = a.len();
    if n == 0 || b.len() != n {
        return None;
    }

    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut new_row = row.clone();
            new_row.push(b[i]);
            new_row
        })
        .collect();

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[col][col].abs();
        for row in (col + 1)..n {
            if aug[row][col].abs() > max_val {
                max_val = aug[row][col].abs();
                max_row = row;
            }
        }

        if max_val < 1e-14 {
            return None;
        }

        aug.swap(col, max_row);

        for row in (col + 1)..n {
            let factor = aug[row][col] / aug[col][col];
            for j in col..=n {
                aug[row][j] -= factor * aug[col][j];
            }
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        x[i] = aug[i][n];
        for j in (i + 1)..n {
            x[i] -= aug[i][j] * x[j];
        }
        x[i] /= aug[i][i];
    }

    Some(x)
}
