//! Likelihood ratio test on the stored full and reduced GLM fits
//!
//! The statistic is 2 * (loglik_full - loglik_reduced) per gene, referred
//! to a chi-square distribution whose degrees of freedom equal the
//! difference in coefficient counts between the two designs. Genes whose
//! fits did not converge keep their best-iterate likelihoods and are
//! flagged through the fit artifacts rather than dropped here.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use super::fdr::benjamini_hochberg;
use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};

/// Per-gene LRT output
#[derive(Debug, Clone)]
pub struct LrtTest {
    /// 2 * (loglik_full - loglik_reduced), floored at 0
    pub stat: Vec<f64>,
    /// Chi-square degrees of freedom shared by all genes
    pub df: f64,
    /// Upper-tail chi-square p-values
    pub pvalues: Vec<f64>,
    /// Benjamini-Hochberg adjusted p-values
    pub padj: Vec<f64>,
}

/// Run the likelihood ratio test over all genes.
///
/// Requires both GLM fits on the dataset. A gene whose likelihoods are not
/// finite gets NaN statistic and p-value; NaNs are excluded from the BH
/// adjustment and stay NaN in `padj`.
pub fn likelihood_ratio_test(dds: &ZinbDataSet) -> Result<LrtTest> {
    let fit_full = dds.fit_full().ok_or_else(|| ZinbDiffError::InvalidInput {
        reason: "Full model fit is required before the likelihood ratio test".to_string(),
    })?;
    let fit_reduced = dds.fit_reduced().ok_or_else(|| ZinbDiffError::InvalidInput {
        reason: "Reduced model fit is required before the likelihood ratio test".to_string(),
    })?;

    let p_full = fit_full.n_coefs();
    let p_reduced = fit_reduced.n_coefs();
    if p_full <= p_reduced {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: format!(
                "full model ({} coefficients) must have more coefficients \
                 than the reduced model ({})",
                p_full, p_reduced
            ),
        });
    }
    let df = (p_full - p_reduced) as f64;

    let chi2 = ChiSquared::new(df).map_err(|e| ZinbDiffError::InvalidInput {
        reason: format!("chi-square with {} degrees of freedom: {}", df, e),
    })?;

    let stat: Vec<f64> = fit_full
        .log_likelihoods
        .iter()
        .zip(fit_reduced.log_likelihoods.iter())
        .map(|(&ll_full, &ll_reduced)| {
            if ll_full.is_finite() && ll_reduced.is_finite() {
                // Best-iterate likelihoods can dip below the nested
                // optimum; the statistic is 0 in that case, not negative
                (2.0 * (ll_full - ll_reduced)).max(0.0)
            } else {
                f64::NAN
            }
        })
        .collect();

    let pvalues: Vec<f64> = stat
        .iter()
        .map(|&s| if s.is_finite() { chi2.sf(s) } else { f64::NAN })
        .collect();

    let padj = benjamini_hochberg(&pvalues);

    Ok(LrtTest {
        stat,
        df,
        pvalues,
        padj,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellMetadata, CountMatrix, ZinbDataSet};
    use crate::glm::{fit_glms, GlmFitParams};
    use ndarray::{array, Array1};

    fn fitted_dataset() -> ZinbDataSet {
        let counts = array![
            [100.0, 110.0, 90.0, 400.0, 420.0, 380.0],
            [500.0, 520.0, 480.0, 500.0, 510.0, 490.0],
            [200.0, 210.0, 190.0, 50.0, 55.0, 45.0],
            [30.0, 34.0, 28.0, 31.0, 29.0, 33.0],
        ];
        let gene_ids = vec![
            "gene_up".to_string(),
            "gene_nc1".to_string(),
            "gene_down".to_string(),
            "gene_nc2".to_string(),
        ];
        let cell_ids: Vec<String> = (0..6).map(|c| format!("c{}", c)).collect();
        let matrix = CountMatrix::new(counts, gene_ids, cell_ids.clone()).unwrap();

        let mut metadata = CellMetadata::new(cell_ids);
        metadata
            .add_condition(
                "condition",
                vec!["A", "A", "A", "B", "B", "B"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            )
            .unwrap();

        let mut dds = ZinbDataSet::new(matrix, metadata, "condition").unwrap();
        dds.set_size_factors(Array1::ones(6)).unwrap();
        dds.set_gene_dispersions(Array1::from_elem(4, 0.05)).unwrap();
        fit_glms(&mut dds, &GlmFitParams::default()).unwrap();
        dds
    }

    #[test]
    fn test_lrt_separates_changed_from_flat_genes() {
        let dds = fitted_dataset();
        let lrt = likelihood_ratio_test(&dds).unwrap();

        assert_eq!(lrt.df, 1.0);
        for (s, p) in lrt.stat.iter().zip(lrt.pvalues.iter()) {
            assert!(*s >= 0.0);
            assert!((0.0..=1.0).contains(p));
        }

        // 4x and -4x genes are far more significant than the flat ones
        assert!(lrt.pvalues[0] < 1e-4, "gene_up p = {}", lrt.pvalues[0]);
        assert!(lrt.pvalues[2] < 1e-4, "gene_down p = {}", lrt.pvalues[2]);
        assert!(lrt.pvalues[1] > 0.1, "gene_nc1 p = {}", lrt.pvalues[1]);
        assert!(lrt.pvalues[3] > 0.1, "gene_nc2 p = {}", lrt.pvalues[3]);
    }

    #[test]
    fn test_adjusted_never_below_raw() {
        let dds = fitted_dataset();
        let lrt = likelihood_ratio_test(&dds).unwrap();

        for (p, q) in lrt.pvalues.iter().zip(lrt.padj.iter()) {
            assert!(*q >= *p - 1e-15);
            assert!(*q <= 1.0);
        }
    }

    #[test]
    fn test_requires_both_fits() {
        let counts = array![[5.0, 8.0, 4.0, 9.0], [3.0, 2.0, 6.0, 4.0]];
        let gene_ids = vec!["g0".to_string(), "g1".to_string()];
        let cell_ids: Vec<String> = (0..4).map(|c| format!("c{}", c)).collect();
        let matrix = CountMatrix::new(counts, gene_ids, cell_ids.clone()).unwrap();

        let mut metadata = CellMetadata::new(cell_ids);
        metadata
            .add_condition(
                "condition",
                vec!["A", "A", "B", "B"].into_iter().map(String::from).collect(),
            )
            .unwrap();
        let dds = ZinbDataSet::new(matrix, metadata, "condition").unwrap();

        let err = likelihood_ratio_test(&dds);
        assert!(matches!(err, Err(ZinbDiffError::InvalidInput { .. })));
    }
}
