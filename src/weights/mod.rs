//! Zero-inflation observation weights
//!
//! Fits a zero-inflated negative binomial factor model to the raw counts and
//! converts it into per-observation weights. Each observation is either a
//! structural zero (dropout, probability pi from a logistic model with
//! per-gene and per-cell terms) or a draw from NB(mu, alpha_gene) where
//! log(mu) carries per-gene and per-cell intercepts plus optional rank-R
//! latent factors.
//!
//! The fit alternates an E-step (posterior probability that an observed zero
//! is a real count) with coordinate M-steps over the model blocks. Every
//! iteration operates on an immutable snapshot of the parameters and
//! produces a new one, so the best iterate can always be returned when the
//! loop stops without converging.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use statrs::function::gamma::digamma;

use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};
use crate::glm::{nb_irls_weight, nb_log_likelihood, nb_zero_prob, MAX_BETA, MAX_ETA};

/// Floor on fitted means inside the weight model.
const MU_FLOOR: f64 = 1e-10;

/// Stabilizing floor added to the logistic Hessian of the dropout model.
/// Genes with no zeros drive their logit toward the boundary where the
/// curvature vanishes; the floor keeps the Newton step defined.
const LOGIT_HESSIAN_FLOOR: f64 = 1e-6;

/// Largest coordinate move accepted in a single M-step pass.
const MAX_NEWTON_STEP: f64 = 5.0;

/// Bounds for the per-gene log dispersion.
const MIN_LOG_DISP: f64 = -20.0;
const MAX_LOG_DISP: f64 = 5.0;

/// Step halvings allowed in the dispersion line search.
const MAX_HALVINGS: usize = 10;

/// Configurable parameters for the zero-inflation weight model.
#[derive(Debug, Clone)]
pub struct ZinbWeightParams {
    /// Rank of the latent factors in the mean model. 0 fits intercepts only.
    pub rank: usize,
    /// Regularization constant epsilon. The ridge penalty on latent factors
    /// and loadings is 1/epsilon, so a very large value effectively disables
    /// it while keeping the normal equations solvable.
    pub ridge_epsilon: f64,
    /// Stop when the penalized log-likelihood improves by less than this.
    pub tol: f64,
    /// Iteration bound; exceeding it returns the best iterate with a flag.
    pub max_iter: usize,
    /// Seed for latent factor initialization. Rank 0 ignores it.
    pub seed: u64,
}

impl Default for ZinbWeightParams {
    fn default() -> Self {
        Self {
            rank: 0,
            ridge_epsilon: 1e12,
            tol: 1e-4,
            max_iter: 100,
            seed: 0,
        }
    }
}

/// Result of fitting the weight model.
#[derive(Debug, Clone)]
pub struct ZinbFit {
    /// Observation weights (genes x cells), entries in [0,1];
    /// exactly 1 wherever the count is nonzero
    pub weights: Array2<f64>,
    /// Whether the penalized log-likelihood stabilized within the bound
    pub converged: bool,
    /// Iterations actually run
    pub iterations: usize,
    /// Penalized log-likelihood of the returned iterate
    pub log_likelihood: f64,
}

/// One immutable snapshot of the model parameters.
#[derive(Debug, Clone)]
struct ZinbModel {
    /// Per-gene mean intercepts (log scale)
    gene_mean: Array1<f64>,
    /// Per-cell mean intercepts (log scale)
    cell_mean: Array1<f64>,
    /// Gene loadings of the latent factors (genes x rank)
    gene_loadings: Array2<f64>,
    /// Cell scores of the latent factors (cells x rank)
    cell_scores: Array2<f64>,
    /// Per-gene dropout logit intercepts
    gene_logit: Array1<f64>,
    /// Per-cell dropout logit intercepts
    cell_logit: Array1<f64>,
    /// Per-gene log dispersion
    log_dispersion: Array1<f64>,
}

impl ZinbModel {
    fn init(counts: &ArrayView2<f64>, params: &ZinbWeightParams) -> Self {
        let (n_genes, n_cells) = counts.dim();

        // Means of the positive counts approximate the non-dropout mean
        // better than row means under heavy zero inflation.
        let gene_mean = Array1::from_iter((0..n_genes).map(|g| {
            let row = counts.row(g);
            let positive_sum: f64 = row.iter().filter(|&&y| y > 0.0).sum();
            let positive_n = row.iter().filter(|&&y| y > 0.0).count();
            (positive_sum / positive_n.max(1) as f64).max(MU_FLOOR).ln()
        }));

        let totals: Vec<f64> = (0..n_cells)
            .map(|c| counts.column(c).sum().max(1.0))
            .collect();
        let mean_total = totals.iter().sum::<f64>() / n_cells as f64;
        let cell_mean = Array1::from_iter(totals.iter().map(|&t| (t / mean_total).ln()));

        // Dropout logits start at the observed zero fraction.
        let gene_logit = Array1::from_iter((0..n_genes).map(|g| {
            let zeros = counts.row(g).iter().filter(|&&y| y == 0.0).count();
            let frac = (zeros as f64 / n_cells as f64).clamp(0.01, 0.99);
            (frac / (1.0 - frac)).ln()
        }));
        let cell_logit = Array1::zeros(n_cells);

        let log_dispersion = Array1::from_elem(n_genes, 0.1_f64.ln());

        let (gene_loadings, cell_scores) = if params.rank > 0 {
            let mut rng = StdRng::seed_from_u64(params.seed);
            let mut loadings = Array2::zeros((n_genes, params.rank));
            for value in loadings.iter_mut() {
                *value = 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
            let mut scores = Array2::zeros((n_cells, params.rank));
            for value in scores.iter_mut() {
                *value = 0.1 * rng.sample::<f64, _>(StandardNormal);
            }
            (loadings, scores)
        } else {
            (Array2::zeros((n_genes, 0)), Array2::zeros((n_cells, 0)))
        };

        Self {
            gene_mean,
            cell_mean,
            gene_loadings,
            cell_scores,
            gene_logit,
            cell_logit,
            log_dispersion,
        }
    }

    fn log_mean(&self, g: usize, c: usize) -> f64 {
        let latent = self.gene_loadings.row(g).dot(&self.cell_scores.row(c));
        (self.gene_mean[g] + self.cell_mean[c] + latent).min(MAX_ETA)
    }

    fn mu(&self, g: usize, c: usize) -> f64 {
        self.log_mean(g, c).exp().max(MU_FLOOR)
    }

    fn dropout_logit(&self, g: usize, c: usize) -> f64 {
        self.gene_logit[g] + self.cell_logit[c]
    }
}

/// Estimate zero-inflation weights for a dataset and store them.
///
/// Non-convergence of the weight model is a warning, not an error; the best
/// iterate is stored together with the flag so downstream stages can report
/// it.
pub fn estimate_zinb_weights(dds: &mut ZinbDataSet, params: &ZinbWeightParams) -> Result<()> {
    let zero_rows = dds.counts().all_zero_genes();
    if !zero_rows.is_empty() {
        return Err(ZinbDiffError::WeightEstimationFailed {
            reason: format!(
                "{} gene(s) have no nonzero counts (first: '{}'); \
                 filter low-count genes before weight estimation",
                zero_rows.len(),
                dds.counts().gene_ids()[zero_rows[0]],
            ),
        });
    }

    let fit = fit_zinb_model(dds.counts().counts(), params)?;

    if !fit.converged {
        log::warn!(
            "Zero-inflation weight model did not converge within {} iterations; using best iterate",
            params.max_iter
        );
    }
    log::debug!(
        "Weight model: {} iterations, penalized log-likelihood {:.4}",
        fit.iterations,
        fit.log_likelihood
    );

    dds.set_weights(fit.weights, fit.converged)
}

/// Fit the zero-inflated NB model and return posterior observation weights.
///
/// Each iteration clones the current snapshot and rebuilds its parameter
/// blocks in turn: mean intercepts (per gene, then per cell), latent factors
/// when rank > 0, dropout logits, and per-gene dispersion. The blocks use
/// single damped Newton steps on the weighted likelihood, so one iteration
/// is one coordinate sweep.
pub fn fit_zinb_model(counts: ArrayView2<f64>, params: &ZinbWeightParams) -> Result<ZinbFit> {
    let n_zero_rows = counts
        .rows()
        .into_iter()
        .filter(|row| row.iter().all(|&y| y == 0.0))
        .count();
    if n_zero_rows > 0 {
        return Err(ZinbDiffError::WeightEstimationFailed {
            reason: format!(
                "{} gene row(s) have no nonzero counts; the likelihood is undefined for them",
                n_zero_rows
            ),
        });
    }

    let mut model = ZinbModel::init(&counts, params);
    let mut ll = penalized_log_likelihood(&counts, &model, params.ridge_epsilon);

    let mut best = model.clone();
    let mut best_ll = ll;
    let mut converged = false;
    let mut iterations = 0;

    for iter in 0..params.max_iter {
        let weights = e_step(&counts, &model);

        let mut next = model.clone();
        next.gene_mean = updated_gene_means(&counts, &weights, &next);
        next.cell_mean = updated_cell_means(&counts, &weights, &next);

        // Gene and cell intercepts are identified only up to a shared
        // constant; keep the cell block centered.
        let delta_shift = next.cell_mean.mean().unwrap_or(0.0);
        next.cell_mean -= delta_shift;
        next.gene_mean += delta_shift;

        if params.rank > 0 {
            next.gene_loadings =
                updated_gene_loadings(&counts, &weights, &next, params.ridge_epsilon);
            next.cell_scores =
                updated_cell_scores(&counts, &weights, &next, params.ridge_epsilon);
        }

        next.gene_logit = updated_gene_logits(&weights, &next);
        next.cell_logit = updated_cell_logits(&weights, &next);
        let xi_shift = next.cell_logit.mean().unwrap_or(0.0);
        next.cell_logit -= xi_shift;
        next.gene_logit += xi_shift;

        next.log_dispersion = updated_log_dispersions(&counts, &weights, &next);

        let new_ll = penalized_log_likelihood(&counts, &next, params.ridge_epsilon);
        model = next;
        iterations = iter + 1;

        if new_ll > best_ll {
            best = model.clone();
            best_ll = new_ll;
        }

        if new_ll - ll < params.tol {
            converged = true;
            break;
        }
        ll = new_ll;
    }

    let weights = e_step(&counts, &best);

    Ok(ZinbFit {
        weights,
        converged,
        iterations,
        log_likelihood: best_ll,
    })
}

/// Posterior probability that each observation is a real count.
/// Nonzero counts cannot be structural zeros, so their weight is exactly 1.
fn e_step(counts: &ArrayView2<f64>, model: &ZinbModel) -> Array2<f64> {
    let (n_genes, n_cells) = counts.dim();

    let rows: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let alpha = model.log_dispersion[g].exp();
            (0..n_cells)
                .map(|c| {
                    if counts[[g, c]] > 0.0 {
                        return 1.0;
                    }
                    let mu = model.mu(g, c);
                    let pi = sigmoid(model.dropout_logit(g, c));
                    let p_zero = nb_zero_prob(mu, alpha);
                    let denom = (pi + (1.0 - pi) * p_zero).max(1e-300);
                    ((1.0 - pi) * p_zero / denom).clamp(0.0, 1.0)
                })
                .collect()
        })
        .collect();

    let mut weights = Array2::zeros((n_genes, n_cells));
    for (g, row) in rows.iter().enumerate() {
        for (c, &w) in row.iter().enumerate() {
            weights[[g, c]] = w;
        }
    }
    weights
}

/// Observed-data log-likelihood of the mixture, minus the ridge penalty on
/// the latent factor blocks.
fn penalized_log_likelihood(
    counts: &ArrayView2<f64>,
    model: &ZinbModel,
    ridge_epsilon: f64,
) -> f64 {
    let (n_genes, n_cells) = counts.dim();

    let data_ll: f64 = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let alpha = model.log_dispersion[g].exp();
            let mut ll = 0.0;
            for c in 0..n_cells {
                let y = counts[[g, c]];
                let mu = model.mu(g, c);
                let pi = sigmoid(model.dropout_logit(g, c)).clamp(1e-12, 1.0 - 1e-12);
                if y > 0.0 {
                    ll += (1.0 - pi).ln() + nb_log_likelihood(y, mu, alpha);
                } else {
                    ll += (pi + (1.0 - pi) * nb_zero_prob(mu, alpha)).max(1e-300).ln();
                }
            }
            ll
        })
        .sum();

    let factor_norm: f64 = model.gene_loadings.iter().map(|v| v * v).sum::<f64>()
        + model.cell_scores.iter().map(|v| v * v).sum::<f64>();

    data_ll - factor_norm / (2.0 * ridge_epsilon)
}

/// One damped Newton step per gene mean intercept.
fn updated_gene_means(
    counts: &ArrayView2<f64>,
    weights: &Array2<f64>,
    model: &ZinbModel,
) -> Array1<f64> {
    let (n_genes, n_cells) = counts.dim();

    let updated: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let alpha = model.log_dispersion[g].exp();
            let mut score = 0.0;
            let mut info = 0.0;
            for c in 0..n_cells {
                let w = weights[[g, c]];
                if w <= 0.0 {
                    continue;
                }
                let mu = model.mu(g, c);
                score += w * (counts[[g, c]] - mu) / (1.0 + alpha * mu);
                info += nb_irls_weight(mu, alpha, w);
            }
            let step = (score / info.max(1e-8)).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
            (model.gene_mean[g] + step).clamp(-MAX_BETA, MAX_BETA)
        })
        .collect();

    Array1::from_vec(updated)
}

/// One damped Newton step per cell mean intercept.
fn updated_cell_means(
    counts: &ArrayView2<f64>,
    weights: &Array2<f64>,
    model: &ZinbModel,
) -> Array1<f64> {
    let (n_genes, n_cells) = counts.dim();

    let updated: Vec<f64> = (0..n_cells)
        .into_par_iter()
        .map(|c| {
            let mut score = 0.0;
            let mut info = 0.0;
            for g in 0..n_genes {
                let w = weights[[g, c]];
                if w <= 0.0 {
                    continue;
                }
                let alpha = model.log_dispersion[g].exp();
                let mu = model.mu(g, c);
                score += w * (counts[[g, c]] - mu) / (1.0 + alpha * mu);
                info += nb_irls_weight(mu, alpha, w);
            }
            let step = (score / info.max(1e-8)).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
            (model.cell_mean[c] + step).clamp(-MAX_BETA, MAX_BETA)
        })
        .collect();

    Array1::from_vec(updated)
}

/// Ridge-penalized Newton step on each gene's factor loadings, holding the
/// cell scores fixed. A singular system leaves the row unchanged.
fn updated_gene_loadings(
    counts: &ArrayView2<f64>,
    weights: &Array2<f64>,
    model: &ZinbModel,
    ridge_epsilon: f64,
) -> Array2<f64> {
    let (n_genes, n_cells) = counts.dim();
    let rank = model.gene_loadings.ncols();
    let ridge = 1.0 / ridge_epsilon;

    let rows: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let alpha = model.log_dispersion[g].exp();
            let mut grad = vec![0.0; rank];
            let mut hess = vec![vec![0.0; rank]; rank];
            for c in 0..n_cells {
                let w = weights[[g, c]];
                if w <= 0.0 {
                    continue;
                }
                let mu = model.mu(g, c);
                let resid = w * (counts[[g, c]] - mu) / (1.0 + alpha * mu);
                let irls = nb_irls_weight(mu, alpha, w);
                for r in 0..rank {
                    let u_r = model.cell_scores[[c, r]];
                    grad[r] += resid * u_r;
                    for s in 0..rank {
                        hess[r][s] += irls * u_r * model.cell_scores[[c, s]];
                    }
                }
            }
            for r in 0..rank {
                grad[r] -= ridge * model.gene_loadings[[g, r]];
                hess[r][r] += ridge;
            }

            match solve_small_system(&hess, &grad) {
                Some(delta) => (0..rank)
                    .map(|r| {
                        let step = delta[r].clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
                        (model.gene_loadings[[g, r]] + step).clamp(-MAX_BETA, MAX_BETA)
                    })
                    .collect(),
                None => (0..rank).map(|r| model.gene_loadings[[g, r]]).collect(),
            }
        })
        .collect();

    let mut out = Array2::zeros((n_genes, rank));
    for (g, row) in rows.iter().enumerate() {
        for (r, &v) in row.iter().enumerate() {
            out[[g, r]] = v;
        }
    }
    out
}

/// Ridge-penalized Newton step on each cell's factor scores, holding the
/// gene loadings fixed.
fn updated_cell_scores(
    counts: &ArrayView2<f64>,
    weights: &Array2<f64>,
    model: &ZinbModel,
    ridge_epsilon: f64,
) -> Array2<f64> {
    let (n_genes, n_cells) = counts.dim();
    let rank = model.cell_scores.ncols();
    let ridge = 1.0 / ridge_epsilon;

    let rows: Vec<Vec<f64>> = (0..n_cells)
        .into_par_iter()
        .map(|c| {
            let mut grad = vec![0.0; rank];
            let mut hess = vec![vec![0.0; rank]; rank];
            for g in 0..n_genes {
                let w = weights[[g, c]];
                if w <= 0.0 {
                    continue;
                }
                let alpha = model.log_dispersion[g].exp();
                let mu = model.mu(g, c);
                let resid = w * (counts[[g, c]] - mu) / (1.0 + alpha * mu);
                let irls = nb_irls_weight(mu, alpha, w);
                for r in 0..rank {
                    let v_r = model.gene_loadings[[g, r]];
                    grad[r] += resid * v_r;
                    for s in 0..rank {
                        hess[r][s] += irls * v_r * model.gene_loadings[[g, s]];
                    }
                }
            }
            for r in 0..rank {
                grad[r] -= ridge * model.cell_scores[[c, r]];
                hess[r][r] += ridge;
            }

            match solve_small_system(&hess, &grad) {
                Some(delta) => (0..rank)
                    .map(|r| {
                        let step = delta[r].clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
                        (model.cell_scores[[c, r]] + step).clamp(-MAX_BETA, MAX_BETA)
                    })
                    .collect(),
                None => (0..rank).map(|r| model.cell_scores[[c, r]]).collect(),
            }
        })
        .collect();

    let mut out = Array2::zeros((n_cells, rank));
    for (c, row) in rows.iter().enumerate() {
        for (r, &v) in row.iter().enumerate() {
            out[[c, r]] = v;
        }
    }
    out
}

/// Logistic Newton step per gene on the dropout responsibilities (1 - w).
fn updated_gene_logits(weights: &Array2<f64>, model: &ZinbModel) -> Array1<f64> {
    let (n_genes, n_cells) = weights.dim();

    let updated: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let mut score = 0.0;
            let mut info = 0.0;
            for c in 0..n_cells {
                let pi = sigmoid(model.dropout_logit(g, c));
                score += (1.0 - weights[[g, c]]) - pi;
                info += pi * (1.0 - pi);
            }
            let step =
                (score / (info + LOGIT_HESSIAN_FLOOR)).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
            (model.gene_logit[g] + step).clamp(-MAX_BETA, MAX_BETA)
        })
        .collect();

    Array1::from_vec(updated)
}

/// Logistic Newton step per cell on the dropout responsibilities.
fn updated_cell_logits(weights: &Array2<f64>, model: &ZinbModel) -> Array1<f64> {
    let (n_genes, n_cells) = weights.dim();

    let updated: Vec<f64> = (0..n_cells)
        .into_par_iter()
        .map(|c| {
            let mut score = 0.0;
            let mut info = 0.0;
            for g in 0..n_genes {
                let pi = sigmoid(model.dropout_logit(g, c));
                score += (1.0 - weights[[g, c]]) - pi;
                info += pi * (1.0 - pi);
            }
            let step =
                (score / (info + LOGIT_HESSIAN_FLOOR)).clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
            (model.cell_logit[c] + step).clamp(-MAX_BETA, MAX_BETA)
        })
        .collect();

    Array1::from_vec(updated)
}

/// Gradient step with halving on each gene's log dispersion. The weighted
/// NB likelihood of the row must not decrease; if every halving fails the
/// dispersion is left unchanged.
fn updated_log_dispersions(
    counts: &ArrayView2<f64>,
    weights: &Array2<f64>,
    model: &ZinbModel,
) -> Array1<f64> {
    let (n_genes, n_cells) = counts.dim();

    let updated: Vec<f64> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let mus: Vec<f64> = (0..n_cells).map(|c| model.mu(g, c)).collect();
            let t = model.log_dispersion[g];

            let row_ll = |log_alpha: f64| -> f64 {
                let alpha = log_alpha.exp();
                let mut ll = 0.0;
                for c in 0..n_cells {
                    let w = weights[[g, c]];
                    if w <= 0.0 {
                        continue;
                    }
                    ll += w * nb_log_likelihood(counts[[g, c]], mus[c], alpha);
                }
                ll
            };

            let ll_current = row_ll(t);
            let grad = dispersion_gradient(counts.row(g), &mus, weights.row(g), t);
            if !grad.is_finite() {
                return t;
            }

            let mut step = grad.clamp(-MAX_NEWTON_STEP, MAX_NEWTON_STEP);
            let mut proposal = (t + step).clamp(MIN_LOG_DISP, MAX_LOG_DISP);
            let mut halvings = 0;
            while row_ll(proposal) < ll_current && halvings < MAX_HALVINGS {
                step *= 0.5;
                proposal = (t + step).clamp(MIN_LOG_DISP, MAX_LOG_DISP);
                halvings += 1;
            }

            if row_ll(proposal) >= ll_current {
                proposal
            } else {
                t
            }
        })
        .collect();

    Array1::from_vec(updated)
}

/// Derivative of the weighted NB log-likelihood with respect to log(alpha).
/// Written in terms of r = 1/alpha: d/dt = -r * d/dr.
fn dispersion_gradient(
    counts: ArrayView1<f64>,
    mus: &[f64],
    weights: ArrayView1<f64>,
    log_alpha: f64,
) -> f64 {
    let r = (-log_alpha).exp();
    let mut sum = 0.0;
    for ((&y, &mu), &w) in counts.iter().zip(mus.iter()).zip(weights.iter()) {
        if w <= 0.0 {
            continue;
        }
        sum += w
            * (digamma(y + r) - digamma(r) + r.ln() + 1.0
                - (r + mu).ln()
                - (r + y) / (r + mu));
    }
    -r * sum
}

/// Gaussian elimination with partial pivoting for the rank x rank factor
/// systems. Returns None when the system is singular.
fn solve_small_system(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
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

        if max_val < 1e-12 {
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
    for row in (0..n).rev() {
        let mut sum = aug[row][n];
        for j in (row + 1)..n {
            sum -= aug[row][j] * x[j];
        }
        x[row] = sum / aug[row][row];
    }
    Some(x)
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
