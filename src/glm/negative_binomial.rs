//! Negative binomial distribution utilities

use ndarray::ArrayView1;
use statrs::function::gamma::ln_gamma;

/// Default floor on fitted means during GLM fitting.
/// Configurable per fit through GlmFitParams::min_mu.
pub const DEFAULT_MIN_MU: f64 = 1e-6;

/// Maximum absolute value for a coefficient on the natural-log scale.
/// If any |beta| exceeds this, iteration stops and the gene is flagged.
pub const MAX_BETA: f64 = 30.0;

/// Maximum eta value to prevent overflow (exp(700) ~ 1e304)
pub const MAX_ETA: f64 = 700.0;

/// Mean of a negative binomial GLM observation given the linear predictor
/// eta and size factor: mu = size_factor * exp(eta)
pub fn nb_mean(eta: f64, size_factor: f64) -> f64 {
    // Clamp only to prevent overflow, not to limit fold changes
    let eta_clamped = eta.clamp(-MAX_ETA, MAX_ETA);
    size_factor * eta_clamped.exp()
}

/// Variance of a negative binomial distribution
///
/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log-likelihood of a single observation under the negative binomial
/// distribution
///
/// P(Y = k | mu, alpha) = (k + r - 1 choose k) * (1/(1+alpha*mu))^r * (alpha*mu/(1+alpha*mu))^k
/// where r = 1/alpha
pub fn nb_log_likelihood(k: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 || alpha <= 0.0 {
        return f64::NEG_INFINITY;
    }

    let r = 1.0 / alpha;
    let p = alpha * mu / (1.0 + alpha * mu);

    ln_gamma(k + r) - ln_gamma(r) - ln_gamma(k + 1.0) + r * (1.0 - p).ln() + k * p.ln()
}

/// Probability of observing a zero under NB(mu, alpha):
/// (1 + alpha * mu)^(-1/alpha)
pub fn nb_zero_prob(mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 {
        return 1.0;
    }
    if alpha <= 0.0 {
        // Poisson limit
        return (-mu).exp();
    }
    (1.0 + alpha * mu).powf(-1.0 / alpha)
}

/// Weight-summed NB log-likelihood for one gene: sum_c w_c * ll(y_c; mu_c).
/// Observations with zero weight contribute nothing even when their
/// individual likelihood is degenerate.
pub fn nb_weighted_log_likelihood(
    counts: ArrayView1<f64>,
    mu: ArrayView1<f64>,
    weights: ArrayView1<f64>,
    alpha: f64,
) -> f64 {
    let mut ll = 0.0;
    for ((&y, &m), &w) in counts.iter().zip(mu.iter()).zip(weights.iter()) {
        if w <= 0.0 {
            continue;
        }
        ll += w * nb_log_likelihood(y, m, alpha);
    }
    ll
}

/// IRLS working weight for a single observation, combining the GLM weight
/// mu/(1 + alpha*mu) with the observation weight
pub fn nb_irls_weight(mu: f64, alpha: f64, obs_weight: f64) -> f64 {
    obs_weight * mu / (1.0 + alpha * mu)
}
