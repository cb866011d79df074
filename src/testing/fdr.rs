//! Benjamini-Hochberg adjustment for multiple testing
//!
//! NaN p-values mark genes that could not be tested; they are excluded
//! from the number of tests and stay NaN in the adjusted output.

/// Benjamini-Hochberg adjusted p-values controlling the false discovery
/// rate. The step-up construction is the usual cumulative minimum over
/// p * m / rank from the largest p-value down.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let n = pvalues.len();
    if n == 0 {
        return vec![];
    }

    let mut indices: Vec<usize> = (0..n).collect();
    indices.sort_by(|&a, &b| {
        let pa = pvalues[a];
        let pb = pvalues[b];
        // NaN sorts last so testable genes occupy the leading ranks
        if pa.is_nan() && pb.is_nan() {
            std::cmp::Ordering::Equal
        } else if pa.is_nan() {
            std::cmp::Ordering::Greater
        } else if pb.is_nan() {
            std::cmp::Ordering::Less
        } else {
            pa.total_cmp(&pb)
        }
    });

    let m = pvalues.iter().filter(|p| p.is_finite()).count();
    if m == 0 {
        return vec![f64::NAN; n];
    }

    let mut padj = vec![f64::NAN; n];
    let mut cummin = f64::INFINITY;
    let mut rank = m;

    for &i in indices.iter().rev() {
        let p = pvalues[i];
        if p.is_finite() {
            let adjusted = (p * m as f64 / rank as f64).min(1.0);
            cummin = cummin.min(adjusted);
            padj[i] = cummin;
            rank -= 1;
        }
    }

    padj
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_known_adjustment_values() {
        let pvalues = vec![0.005, 0.011, 0.02, 0.04];
        let padj = benjamini_hochberg(&pvalues);

        assert_relative_eq!(padj[0], 0.02, epsilon = 1e-12);
        assert_relative_eq!(padj[1], 0.022, epsilon = 1e-12);
        assert_relative_eq!(padj[2], 0.02 * 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(padj[3], 0.04, epsilon = 1e-12);
    }

    #[test]
    fn test_adjusted_at_least_raw_and_capped() {
        let pvalues = vec![0.01, 0.04, 0.03, 0.02, 0.9];
        let padj = benjamini_hochberg(&pvalues);

        for (p, adj) in pvalues.iter().zip(padj.iter()) {
            assert!(*adj >= *p);
            assert!(*adj <= 1.0);
        }
    }

    #[test]
    fn test_nan_rows_are_excluded_from_the_test_count() {
        let pvalues = vec![0.01, f64::NAN, 0.03, 0.02];
        let padj = benjamini_hochberg(&pvalues);

        assert!(padj[1].is_nan());
        // m = 3 testable genes, so the smallest p adjusts to 0.01 * 3 / 1
        assert_relative_eq!(padj[0], 0.03, epsilon = 1e-12);
    }

    #[test]
    fn test_ordering_is_preserved() {
        let pvalues = vec![0.001, 0.01, 0.05, 0.1];
        let padj = benjamini_hochberg(&pvalues);

        for window in padj.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(benjamini_hochberg(&[]).is_empty());
        let all_nan = benjamini_hochberg(&[f64::NAN, f64::NAN]);
        assert!(all_nan.iter().all(|q| q.is_nan()));
    }
}
