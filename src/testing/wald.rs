//! Wald test on the tested condition coefficient
//!
//! Secondary to the likelihood ratio test: the statistic is the fitted
//! coefficient divided by its standard error, referred to a t distribution
//! whose per-gene degrees of freedom subtract the coefficient count from
//! the summed observation weights. Down-weighted zeros reduce the
//! effective sample size, which the plain normal reference ignores.

use statrs::distribution::{ContinuousCDF, StudentsT};

use super::fdr::benjamini_hochberg;
use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};

/// Per-gene Wald output
#[derive(Debug, Clone)]
pub struct WaldTest {
    /// Coefficient / standard error
    pub stat: Vec<f64>,
    /// Effective degrees of freedom per gene (sum of weights minus
    /// coefficient count)
    pub df: Vec<f64>,
    /// Two-sided t p-values
    pub pvalues: Vec<f64>,
    /// Benjamini-Hochberg adjusted p-values
    pub padj: Vec<f64>,
}

/// Test the last condition coefficient of the full model against zero.
///
/// For a two-level condition this is the treatment contrast relative to the
/// reference level. Genes with unusable standard errors get NaN rows.
pub fn wald_test(dds: &ZinbDataSet) -> Result<WaldTest> {
    let fit = dds.fit_full().ok_or_else(|| ZinbDiffError::InvalidInput {
        reason: "Full model fit is required before the Wald test".to_string(),
    })?;

    let n_genes = dds.n_genes();
    let n_cells = dds.n_cells();
    let p = fit.n_coefs();
    if p < 2 {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: "Wald test needs a condition coefficient besides the intercept".to_string(),
        });
    }
    let coef_idx = p - 1;

    let df: Vec<f64> = (0..n_genes)
        .map(|g| {
            let effective_n = match dds.weights() {
                Some(w) => w.row(g).sum(),
                None => n_cells as f64,
            };
            effective_n - p as f64
        })
        .collect();

    let stat: Vec<f64> = (0..n_genes)
        .map(|g| {
            let coef = fit.coefficients[[g, coef_idx]];
            let se = fit.standard_errors[[g, coef_idx]];
            if se > 0.0 && se.is_finite() && coef.is_finite() {
                coef / se
            } else {
                f64::NAN
            }
        })
        .collect();

    let pvalues: Vec<f64> = stat
        .iter()
        .zip(df.iter())
        .map(|(&s, &d)| two_sided_t_pvalue(s, d))
        .collect();

    let padj = benjamini_hochberg(&pvalues);

    Ok(WaldTest {
        stat,
        df,
        pvalues,
        padj,
    })
}

/// Two-sided p-value from a t statistic with the given degrees of freedom.
pub fn two_sided_t_pvalue(stat: f64, df: f64) -> f64 {
    if !stat.is_finite() || df <= 0.0 {
        return f64::NAN;
    }

    match StudentsT::new(0.0, 1.0, df) {
        Ok(t_dist) => (2.0 * t_dist.cdf(-stat.abs())).min(1.0),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellMetadata, CountMatrix, ZinbDataSet};
    use crate::glm::{fit_glms, GlmFitParams};
    use ndarray::{array, Array1, Array2};

    fn make_dataset(counts: Array2<f64>) -> ZinbDataSet {
        let n_genes = counts.nrows();
        let n_cells = counts.ncols();
        let gene_ids = (0..n_genes).map(|g| format!("g{}", g)).collect();
        let cell_ids: Vec<String> = (0..n_cells).map(|c| format!("c{}", c)).collect();
        let matrix = CountMatrix::new(counts, gene_ids, cell_ids.clone()).unwrap();

        let mut metadata = CellMetadata::new(cell_ids);
        let labels = (0..n_cells)
            .map(|c| if c < n_cells / 2 { "A".to_string() } else { "B".to_string() })
            .collect();
        metadata.add_condition("condition", labels).unwrap();

        ZinbDataSet::new(matrix, metadata, "condition").unwrap()
    }

    #[test]
    fn test_wald_direction_and_significance() {
        let counts = array![
            [100.0, 110.0, 90.0, 400.0, 420.0, 380.0],
            [500.0, 520.0, 480.0, 500.0, 510.0, 490.0],
            [200.0, 210.0, 190.0, 50.0, 55.0, 45.0],
        ];
        let mut dds = make_dataset(counts);
        dds.set_size_factors(Array1::ones(6)).unwrap();
        dds.set_gene_dispersions(Array1::from_elem(3, 0.05)).unwrap();
        fit_glms(&mut dds, &GlmFitParams::default()).unwrap();

        let wald = wald_test(&dds).unwrap();

        assert!(wald.stat[0] > 0.0, "up gene stat {}", wald.stat[0]);
        assert!(wald.stat[2] < 0.0, "down gene stat {}", wald.stat[2]);
        assert!(wald.pvalues[0] < 0.01);
        assert!(wald.pvalues[2] < 0.01);
        assert!(wald.pvalues[1] > 0.1);

        // No weights on the dataset: df = cells - coefficients everywhere
        assert!(wald.df.iter().all(|&d| d == 4.0));
    }

    #[test]
    fn test_weights_reduce_effective_df() {
        let counts = array![
            [30.0, 0.0, 28.0, 25.0, 0.0, 27.0],
            [12.0, 15.0, 11.0, 13.0, 14.0, 12.0],
        ];
        let mut dds = make_dataset(counts);
        dds.set_size_factors(Array1::ones(6)).unwrap();
        dds.set_gene_dispersions(Array1::from_elem(2, 0.1)).unwrap();

        let mut weights = Array2::ones((2, 6));
        weights[[0, 1]] = 0.2;
        weights[[0, 4]] = 0.3;
        dds.set_weights(weights, true).unwrap();
        fit_glms(&mut dds, &GlmFitParams::default()).unwrap();

        let wald = wald_test(&dds).unwrap();

        let expected_df0 = (4.0 + 0.2 + 0.3) - 2.0;
        assert!((wald.df[0] - expected_df0).abs() < 1e-12);
        assert!((wald.df[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_t_pvalue_behaves_like_reference() {
        let p_sym_pos = two_sided_t_pvalue(2.0, 10.0);
        let p_sym_neg = two_sided_t_pvalue(-2.0, 10.0);
        assert!((p_sym_pos - p_sym_neg).abs() < 1e-12);

        assert!((two_sided_t_pvalue(0.0, 10.0) - 1.0).abs() < 1e-10);

        // Small df is more conservative than large df
        assert!(two_sided_t_pvalue(2.0, 3.0) > two_sided_t_pvalue(2.0, 1000.0));

        assert!(two_sided_t_pvalue(f64::NAN, 10.0).is_nan());
        assert!(two_sided_t_pvalue(2.0, 0.0).is_nan());
    }

    #[test]
    fn test_requires_full_fit() {
        let counts = array![[5.0, 8.0, 4.0, 9.0], [3.0, 2.0, 6.0, 4.0]];
        let dds = make_dataset(counts);
        let err = wald_test(&dds);
        assert!(matches!(err, Err(ZinbDiffError::InvalidInput { .. })));
    }
}
