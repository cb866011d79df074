//! Independent filtering on mean expression
//!
//! Genes whose mean normalized count is too low to ever reach significance
//! only inflate the multiple-testing burden. The filter scans candidate
//! mean-expression cutoffs over a quantile grid, applies the BH adjustment
//! to the genes above each cutoff, and keeps the smallest cutoff that
//! maximizes the rejection count. Genes below the chosen cutoff get NaN
//! adjusted p-values.

use crate::testing::benjamini_hochberg;

/// Candidate thresholds scanned across the base-mean quantiles
const N_THETA: usize = 50;

/// When no cutoff yields more rejections than this, filtering is skipped
/// and the lowest cutoff (zero-mean genes only) is used.
const MIN_REJECTIONS_TO_FILTER: usize = 10;

/// Outcome of the threshold scan
#[derive(Debug, Clone)]
pub struct FilteredAdjustment {
    /// BH-adjusted p-values at the chosen cutoff; NaN below it
    pub padj: Vec<f64>,
    /// Quantile of the chosen cutoff
    pub theta: f64,
    /// Base-mean cutoff applied
    pub threshold: f64,
    /// Rejections at `alpha` under the chosen cutoff
    pub n_rejections: usize,
}

/// Scan mean-expression cutoffs and adjust p-values at the best one.
///
/// `alpha` is the significance level the rejection count is optimized for.
/// NaN p-values stay NaN regardless of the cutoff.
pub fn independent_filtering(
    base_means: &[f64],
    pvalues: &[f64],
    alpha: f64,
) -> FilteredAdjustment {
    let n = pvalues.len();
    if n == 0 || base_means.len() != n {
        return FilteredAdjustment {
            padj: benjamini_hochberg(pvalues),
            theta: 0.0,
            threshold: f64::NAN,
            n_rejections: 0,
        };
    }

    let mut sorted_means: Vec<f64> = base_means
        .iter()
        .filter(|m| m.is_finite())
        .copied()
        .collect();
    sorted_means.sort_by(|a, b| a.total_cmp(b));

    if sorted_means.is_empty() {
        return FilteredAdjustment {
            padj: benjamini_hochberg(pvalues),
            theta: 0.0,
            threshold: f64::NAN,
            n_rejections: 0,
        };
    }

    // The grid starts at the zero-mean fraction: cutoffs below that only
    // remove genes that are untestable anyway
    let zero_fraction = base_means
        .iter()
        .filter(|&&m| m == 0.0 || !m.is_finite())
        .count() as f64
        / n as f64;
    let upper = if zero_fraction < 0.95 { 0.95 } else { 1.0 };

    let thetas: Vec<f64> = (0..N_THETA)
        .map(|i| zero_fraction + (upper - zero_fraction) * i as f64 / (N_THETA as f64 - 1.0))
        .collect();
    let cutoffs: Vec<f64> = thetas
        .iter()
        .map(|&theta| quantile_type7(&sorted_means, theta))
        .collect();

    let mut all_padj: Vec<Vec<f64>> = Vec::with_capacity(N_THETA);
    let mut num_rej: Vec<usize> = Vec::with_capacity(N_THETA);

    for &cutoff in &cutoffs {
        let masked: Vec<f64> = pvalues
            .iter()
            .zip(base_means.iter())
            .map(|(&p, &m)| if m >= cutoff { p } else { f64::NAN })
            .collect();
        let padj = benjamini_hochberg(&masked);
        let rejections = padj.iter().filter(|&&q| q.is_finite() && q < alpha).count();
        all_padj.push(padj);
        num_rej.push(rejections);
    }

    let max_rej = num_rej.iter().copied().max().unwrap_or(0);
    let best_j = if max_rej <= MIN_REJECTIONS_TO_FILTER {
        0
    } else {
        num_rej.iter().position(|&r| r == max_rej).unwrap_or(0)
    };

    log::debug!(
        "Independent filtering: theta={:.3}, cutoff={:.3}, rejections={} (max {})",
        thetas[best_j],
        cutoffs[best_j],
        num_rej[best_j],
        max_rej
    );

    FilteredAdjustment {
        padj: all_padj.swap_remove(best_j),
        theta: thetas[best_j],
        threshold: cutoffs[best_j],
        n_rejections: num_rej[best_j],
    }
}

/// Quantile with linear interpolation between order statistics
/// (h = (n-1)p, interpolating x[floor(h)] and x[ceil(h)]).
fn quantile_type7(sorted_x: &[f64], p: f64) -> f64 {
    let n = sorted_x.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted_x[0];
    }

    let h = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lo = (h.floor() as usize).min(n - 1);
    let hi = (h.ceil() as usize).min(n - 1);

    if lo == hi {
        sorted_x[lo]
    } else {
        let frac = h - lo as f64;
        sorted_x[lo] + frac * (sorted_x[hi] - sorted_x[lo])
    }
}
