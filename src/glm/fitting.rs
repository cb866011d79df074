//! Weighted negative binomial GLM fitting using iteratively reweighted
//! least squares

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use super::design::{
    create_design_matrix, create_reduced_design_matrix, validate_nested_designs, DesignInfo,
};
use super::negative_binomial::{
    nb_irls_weight, nb_mean, nb_weighted_log_likelihood, DEFAULT_MIN_MU, MAX_BETA,
};
use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};

/// Configurable parameters for weighted GLM fitting
#[derive(Debug, Clone)]
pub struct GlmFitParams {
    /// Maximum IRLS iterations
    pub maxit: usize,
    /// Relative deviance change below which the fit is declared converged
    pub beta_tol: f64,
    /// Minimum number of mean updates before the convergence test may
    /// stop the iteration. Down-weighted observations can make the
    /// deviance change look tiny on the first pass, so an early exit
    /// would freeze the fit at its initialization.
    pub min_iterations: usize,
    /// Floor applied to fitted means
    pub min_mu: f64,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        Self {
            maxit: 100,
            beta_tol: 1e-8,
            min_iterations: 2,
            min_mu: DEFAULT_MIN_MU,
        }
    }
}

/// Fitted GLM artifact for one design matrix across all genes
#[derive(Debug, Clone)]
pub struct GlmFit {
    /// Coefficients on the natural log scale (genes x coefficients)
    pub coefficients: Array2<f64>,
    /// Standard errors of the coefficients (genes x coefficients)
    pub standard_errors: Array2<f64>,
    /// Fitted means (genes x cells)
    pub mu: Array2<f64>,
    /// Weighted log-likelihood at the fitted coefficients, per gene
    pub log_likelihoods: Array1<f64>,
    /// Per-gene convergence status; non-convergence is recorded, never raised
    pub converged: Vec<bool>,
    /// IRLS iterations used per gene
    pub iterations: Vec<usize>,
    /// Coefficient names matching the design columns
    pub coef_names: Vec<String>,
}

impl GlmFit {
    pub fn n_coefs(&self) -> usize {
        self.coefficients.ncols()
    }

    pub fn n_unconverged(&self) -> usize {
        self.converged.iter().filter(|&&c| !c).count()
    }
}

/// Fit the full and reduced weighted NB GLMs and store both on the dataset.
///
/// The full design is intercept plus treatment contrasts for the condition
/// variable; the reduced design is intercept only. Observation weights are
/// taken from the dataset when present, otherwise every observation gets
/// weight 1.
pub fn fit_glms(dds: &mut ZinbDataSet, params: &GlmFitParams) -> Result<DesignInfo> {
    if !dds.has_size_factors() {
        return Err(ZinbDiffError::GlmSetupFailed {
            reason: "Size factors must be estimated before GLM fitting".to_string(),
        });
    }
    if !dds.has_dispersions() {
        return Err(ZinbDiffError::GlmSetupFailed {
            reason: "Dispersions must be estimated before GLM fitting".to_string(),
        });
    }
    if !dds.has_weights() {
        log::debug!("No observation weights on dataset; fitting GLMs with unit weights");
    }

    let (full_design, info) = create_design_matrix(dds.cell_metadata(), dds.condition_variable())?;
    let reduced_design = create_reduced_design_matrix(dds.n_cells())?;
    validate_nested_designs(&full_design, &reduced_design)?;

    let fit_full = {
        let counts = dds.counts().counts();
        let size_factors = dds.size_factors().ok_or_else(|| ZinbDiffError::GlmSetupFailed {
            reason: "Size factors missing".to_string(),
        })?;
        let dispersions = dds.dispersions().ok_or_else(|| ZinbDiffError::GlmSetupFailed {
            reason: "Dispersions missing".to_string(),
        })?;
        fit_design(
            counts,
            dds.weights(),
            &full_design,
            size_factors,
            dispersions,
            info.coef_names.clone(),
            params,
        )
    };

    let fit_reduced = {
        let counts = dds.counts().counts();
        let size_factors = dds.size_factors().ok_or_else(|| ZinbDiffError::GlmSetupFailed {
            reason: "Size factors missing".to_string(),
        })?;
        let dispersions = dds.dispersions().ok_or_else(|| ZinbDiffError::GlmSetupFailed {
            reason: "Dispersions missing".to_string(),
        })?;
        fit_design(
            counts,
            dds.weights(),
            &reduced_design,
            size_factors,
            dispersions,
            vec!["Intercept".to_string()],
            params,
        )
    };

    let n_unconverged = fit_full.n_unconverged().max(fit_reduced.n_unconverged());
    if n_unconverged > 0 {
        log::warn!(
            "{} of {} genes did not reach GLM convergence within {} iterations",
            n_unconverged,
            dds.n_genes(),
            params.maxit
        );
    }

    dds.set_fit_full(fit_full)?;
    dds.set_fit_reduced(fit_reduced)?;

    Ok(info)
}

/// Fit one design matrix across all genes in parallel
pub fn fit_design(
    counts: ArrayView2<f64>,
    weights: Option<&Array2<f64>>,
    design: &Array2<f64>,
    size_factors: &Array1<f64>,
    dispersions: &Array1<f64>,
    coef_names: Vec<String>,
    params: &GlmFitParams,
) -> GlmFit {
    let n_genes = counts.nrows();
    let n_cells = counts.ncols();
    let n_coefs = design.ncols();

    let results: Vec<GlmFitResult> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let gene_counts = counts.row(i);
            let gene_weights: Array1<f64> = match weights {
                Some(w) => w.row(i).to_owned(),
                None => Array1::ones(n_cells),
            };
            fit_single_gene(
                gene_counts,
                gene_weights.view(),
                design,
                size_factors.view(),
                dispersions[i],
                None,
                params,
            )
        })
        .collect();

    let mut coefficients = Array2::zeros((n_genes, n_coefs));
    let mut standard_errors = Array2::zeros((n_genes, n_coefs));
    let mut mu = Array2::zeros((n_genes, n_cells));
    let mut log_likelihoods = Array1::zeros(n_genes);
    let mut converged = Vec::with_capacity(n_genes);
    let mut iterations = Vec::with_capacity(n_genes);

    for (i, result) in results.into_iter().enumerate() {
        for j in 0..n_coefs {
            coefficients[[i, j]] = result.coefficients[j];
            standard_errors[[i, j]] = result.standard_errors[j];
        }
        for j in 0..n_cells {
            mu[[i, j]] = result.mu[j];
        }
        log_likelihoods[i] = result.log_likelihood;
        converged.push(result.converged);
        iterations.push(result.iterations);
    }

    GlmFit {
        coefficients,
        standard_errors,
        mu,
        log_likelihoods,
        converged,
        iterations,
        coef_names,
    }
}

pub struct GlmFitResult {
    pub coefficients: Vec<f64>,
    pub standard_errors: Vec<f64>,
    pub mu: Vec<f64>,
    pub log_likelihood: f64,
    pub converged: bool,
    pub iterations: usize,
}

/// Fit a single gene's weighted NB GLM.
///
/// The IRLS working weight for observation i is
/// `w_i * mu_i / (1 + alpha * mu_i)` where w_i is the observation weight,
/// so down-weighted cells contribute proportionally less to the normal
/// equations and to the reported log-likelihood.
///
/// `initial_beta` warm-starts the iteration, for refits from an earlier
/// converged solution; `None` initializes by OLS on log normalized counts.
pub fn fit_single_gene(
    counts: ArrayView1<f64>,
    obs_weights: ArrayView1<f64>,
    design: &Array2<f64>,
    size_factors: ArrayView1<f64>,
    alpha: f64,
    initial_beta: Option<&[f64]>,
    params: &GlmFitParams,
) -> GlmFitResult {
    let n_cells = counts.len();
    let n_coefs = design.ncols();
    let alpha = alpha.max(1e-12);
    let min_mu = params.min_mu;

    let mut beta = match initial_beta {
        Some(b0) if b0.len() == n_coefs && b0.iter().all(|b| b.is_finite()) => b0.to_vec(),
        _ => {
            // Initialize coefficients by OLS on log normalized counts
            let log_counts: Vec<f64> = counts
                .iter()
                .zip(size_factors.iter())
                .map(|(&c, &s)| {
                    let norm_ct = if s > 0.0 { c / s } else { 0.0 };
                    (norm_ct + 0.1).ln()
                })
                .collect();

            let mut xtx = vec![0.0; n_coefs * n_coefs];
            let mut xty = vec![0.0; n_coefs];
            for i in 0..n_cells {
                for j in 0..n_coefs {
                    for k in 0..n_coefs {
                        xtx[j * n_coefs + k] += design[[i, j]] * design[[i, k]];
                    }
                    xty[j] += design[[i, j]] * log_counts[i];
                }
            }
            solve_symmetric_system(&xtx, &xty, n_coefs)
        }
    };

    if beta.iter().any(|&b| !b.is_finite()) {
        let mean_count: f64 = counts
            .iter()
            .zip(size_factors.iter())
            .map(|(&c, &s)| if s > 0.0 { c / s } else { 0.0 })
            .sum::<f64>()
            / n_cells as f64;
        beta = vec![0.0; n_coefs];
        beta[0] = (mean_count.max(0.1)).ln();
    }

    let compute_mu = |beta: &[f64], mus: &mut [f64]| {
        for i in 0..n_cells {
            let eta: f64 = (0..n_coefs).map(|j| design[[i, j]] * beta[j]).sum();
            mus[i] = nb_mean(eta, size_factors[i]).max(min_mu);
        }
    };

    let mut converged = false;
    let mut iterations = params.maxit;
    let mut dev_old = 0.0f64;

    let mut mus = vec![0.0; n_cells];
    let mut irls_weights = vec![0.0; n_cells];
    let mut working_response = vec![0.0; n_cells];

    for iter in 0..params.maxit {
        for i in 0..n_cells {
            let eta: f64 = (0..n_coefs).map(|j| design[[i, j]] * beta[j]).sum();
            let mu = nb_mean(eta, size_factors[i]).max(min_mu);
            mus[i] = mu;
            irls_weights[i] = nb_irls_weight(mu, alpha, obs_weights[i]);
            working_response[i] = (mu / size_factors[i]).ln() + (counts[i] - mu) / mu;
        }

        let mut beta_prop = weighted_least_squares_ridge(design, &irls_weights, &working_response);

        if beta_prop.iter().any(|&b| b.abs() > MAX_BETA) {
            iterations = iter + 1;
            break;
        }

        compute_mu(&beta_prop, &mut mus);
        let mut dev = -2.0
            * nb_weighted_log_likelihood(
                counts,
                ArrayView1::from(&mus[..]),
                obs_weights,
                alpha,
            );

        // Step-halving keeps the weighted deviance monotone when a full
        // WLS step overshoots
        if iter > 0 {
            let mut halvings = 0;
            while dev > dev_old && dev.is_finite() && halvings < 10 {
                for j in 0..n_coefs {
                    beta_prop[j] = 0.5 * (beta_prop[j] + beta[j]);
                }
                compute_mu(&beta_prop, &mut mus);
                dev = -2.0
                    * nb_weighted_log_likelihood(
                        counts,
                        ArrayView1::from(&mus[..]),
                        obs_weights,
                        alpha,
                    );
                halvings += 1;
            }
        }

        beta = beta_prop;

        let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
        if conv_test.is_nan() {
            iterations = iter + 1;
            break;
        }
        if iter + 1 >= params.min_iterations && conv_test < params.beta_tol {
            converged = true;
            iterations = iter + 1;
            break;
        }
        dev_old = dev;
    }

    compute_mu(&beta, &mut mus);
    for i in 0..n_cells {
        irls_weights[i] = nb_irls_weight(mus[i], alpha, obs_weights[i]);
    }

    let log_likelihood =
        nb_weighted_log_likelihood(counts, ArrayView1::from(&mus[..]), obs_weights, alpha);

    let standard_errors = calculate_standard_errors(design, &irls_weights);

    GlmFitResult {
        coefficients: beta,
        standard_errors,
        mu: mus,
        log_likelihood,
        converged,
        iterations,
    }
}

fn weighted_least_squares_ridge(
    design: &Array2<f64>,
    weights: &[f64],
    response: &[f64],
) -> Vec<f64> {
    let n_coefs = design.ncols();
    let mut xtwx = vec![0.0; n_coefs * n_coefs];
    for i in 0..design.nrows() {
        let w = weights[i];
        for j in 0..n_coefs {
            for k in 0..n_coefs {
                xtwx[j * n_coefs + k] += w * design[[i, j]] * design[[i, k]];
            }
        }
    }

    // Small ridge penalty on the natural-log scale keeps the normal
    // equations solvable when heavy down-weighting empties a group
    let lambda = 1e-6;
    for j in 0..n_coefs {
        xtwx[j * n_coefs + j] += lambda;
    }

    let mut xtwz = vec![0.0; n_coefs];
    for i in 0..design.nrows() {
        let w = weights[i];
        for j in 0..n_coefs {
            xtwz[j] += w * design[[i, j]] * response[i];
        }
    }

    solve_symmetric_system(&xtwx, &xtwz, n_coefs)
}

fn solve_symmetric_system(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0; n * n];

    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                // Guard against loss of positive definiteness from
                // accumulated rounding
                if sum <= 0.0 {
                    sum = 1e-12;
                }
                l[i * n + j] = sum.sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * y[j];
        }
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

/// Sandwich standard errors:
/// SE = sqrt(diag( (X'WX + lambda)^-1 X'WX (X'WX + lambda)^-1 ))
fn calculate_standard_errors(design: &Array2<f64>, weights: &[f64]) -> Vec<f64> {
    let n_cells = design.nrows();
    let n_coefs = design.ncols();

    let mut xtwx = vec![0.0; n_coefs * n_coefs];
    for i in 0..n_cells {
        let w = weights[i];
        for j in 0..n_coefs {
            for k in 0..n_coefs {
                xtwx[j * n_coefs + k] += w * design[[i, j]] * design[[i, k]];
            }
        }
    }

    let lambda = 1e-6;
    let mut xtwx_ridge = xtwx.clone();
    for j in 0..n_coefs {
        xtwx_ridge[j * n_coefs + j] += lambda;
    }

    let xtwx_ridge_inv = invert_symmetric_matrix(&xtwx_ridge, n_coefs);

    let mut temp = vec![0.0; n_coefs * n_coefs];
    for i in 0..n_coefs {
        for j in 0..n_coefs {
            for k in 0..n_coefs {
                temp[i * n_coefs + j] += xtwx_ridge_inv[i * n_coefs + k] * xtwx[k * n_coefs + j];
            }
        }
    }

    let mut sigma = vec![0.0; n_coefs * n_coefs];
    for i in 0..n_coefs {
        for j in 0..n_coefs {
            for k in 0..n_coefs {
                sigma[i * n_coefs + j] += temp[i * n_coefs + k] * xtwx_ridge_inv[k * n_coefs + j];
            }
        }
    }

    (0..n_coefs)
        .map(|i| {
            if sigma[i * n_coefs + i] > 0.0 {
                sigma[i * n_coefs + i].sqrt()
            } else {
                f64::NAN
            }
        })
        .collect()
}

fn invert_symmetric_matrix(a: &[f64], n: usize) -> Vec<f64> {
    let mut result = vec![0.0; n * n];
    for i in 0..n {
        let mut e = vec![0.0; n];
        e[i] = 1.0;
        let col = solve_symmetric_system(a, &e, n);
        for j in 0..n {
            result[j * n + i] = col[j];
        }
    }
    result
}
