//! Per-gene differential expression results

use ndarray::{Array1, Axis};
use serde::{Deserialize, Serialize};

use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};
use crate::filter::independent_filtering;
use crate::testing::{LrtTest, WaldTest};

/// Options controlling results assembly
#[derive(Debug, Clone)]
pub struct ResultsOptions {
    /// Significance threshold used by the summary and, when enabled, for
    /// choosing the independent filtering cutoff
    pub alpha: f64,
    /// Re-run the BH adjustment over a grid of mean-expression cutoffs and
    /// keep the one that maximizes rejections. Genes below the chosen
    /// cutoff get NaN in `padj`.
    pub independent_filtering: bool,
}

impl Default for ResultsOptions {
    fn default() -> Self {
        Self {
            alpha: 0.05,
            independent_filtering: false,
        }
    }
}

/// Condition contrast the fold change column refers to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contrast {
    /// Condition variable name
    pub variable: String,
    /// Tested level
    pub numerator: String,
    /// Reference level
    pub denominator: String,
}

/// Per-gene test columns in the shape shared by both test methods
#[derive(Debug, Clone)]
pub struct TestColumns {
    pub stat: Vec<f64>,
    pub df: Vec<f64>,
    pub pvalues: Vec<f64>,
    pub padj: Vec<f64>,
}

impl From<&LrtTest> for TestColumns {
    fn from(test: &LrtTest) -> Self {
        Self {
            stat: test.stat.clone(),
            df: vec![test.df; test.stat.len()],
            pvalues: test.pvalues.clone(),
            padj: test.padj.clone(),
        }
    }
}

impl From<&WaldTest> for TestColumns {
    fn from(test: &WaldTest) -> Self {
        Self {
            stat: test.stat.clone(),
            df: test.df.clone(),
            pvalues: test.pvalues.clone(),
            padj: test.padj.clone(),
        }
    }
}

/// Results of a differential expression analysis
///
/// One entry per gene across all vectors. `log2_fold_changes` reports the
/// last design coefficient (the highest-sorted level against the
/// reference); with more than two condition levels the LRT statistic still
/// tests all condition coefficients jointly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeResults {
    /// Gene identifiers
    pub gene_ids: Vec<String>,
    /// Mean of size-factor normalized counts across all cells
    pub base_means: Vec<f64>,
    /// Log2 fold change of the tested condition coefficient
    pub log2_fold_changes: Vec<f64>,
    /// Standard error of the log2 fold change
    pub lfc_se: Vec<f64>,
    /// Test statistic
    pub stat: Vec<f64>,
    /// Test degrees of freedom: constant across genes for the LRT,
    /// per-gene effective df for the Wald test
    pub df: Vec<f64>,
    /// Raw p-values
    pub pvalues: Vec<f64>,
    /// BH-adjusted p-values
    pub padj: Vec<f64>,
    /// Gene-wise dispersion estimates before shrinkage
    pub gene_dispersions: Vec<f64>,
    /// Fitted dispersion trend values
    pub trended_dispersions: Vec<f64>,
    /// MAP dispersions used by the GLMs
    pub map_dispersions: Vec<f64>,
    /// Whether both GLM fits converged for the gene
    pub glm_converged: Vec<bool>,
    /// Whether the weight model converged, if weights were estimated
    pub weights_converged: Option<bool>,
    /// Contrast described by the fold change column
    pub contrast: Contrast,
}

/// Build the per-gene results table from a tested dataset.
///
/// Requires size factors and both GLM fits on the dataset. Dispersion
/// diagnostic columns are NaN-filled when the corresponding estimates were
/// never stored.
pub fn assemble_results(
    dds: &ZinbDataSet,
    test: &TestColumns,
    options: &ResultsOptions,
) -> Result<DeResults> {
    let n_genes = dds.n_genes();
    if test.stat.len() != n_genes {
        return Err(ZinbDiffError::DimensionMismatch {
            expected: format!("{} genes", n_genes),
            got: format!("{} test results", test.stat.len()),
        });
    }

    let normalized = dds
        .normalized_counts()
        .ok_or_else(|| ZinbDiffError::InvalidInput {
            reason: "Size factors must be estimated before assembling results".to_string(),
        })?;
    let fit_full = dds.fit_full().ok_or_else(|| ZinbDiffError::InvalidInput {
        reason: "Full model fit is required before assembling results".to_string(),
    })?;
    let fit_reduced = dds.fit_reduced().ok_or_else(|| ZinbDiffError::InvalidInput {
        reason: "Reduced model fit is required before assembling results".to_string(),
    })?;

    let p = fit_full.n_coefs();
    if p < 2 {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: "Full design has no condition coefficient beyond the intercept".to_string(),
        });
    }
    let coef_idx = p - 1;

    let base_means: Vec<f64> = normalized
        .axis_iter(Axis(0))
        .map(|row| row.mean().unwrap_or(f64::NAN))
        .collect();

    // Coefficients are on the natural log scale
    let log2_fold_changes: Vec<f64> = (0..n_genes)
        .map(|g| fit_full.coefficients[[g, coef_idx]] * std::f64::consts::LOG2_E)
        .collect();
    let lfc_se: Vec<f64> = (0..n_genes)
        .map(|g| fit_full.standard_errors[[g, coef_idx]] * std::f64::consts::LOG2_E)
        .collect();

    let padj = if options.independent_filtering {
        let filtered = independent_filtering(&base_means, &test.pvalues, options.alpha);
        log::debug!(
            "Independent filtering kept genes with base mean >= {:.4} ({} rejections)",
            filtered.threshold,
            filtered.n_rejections
        );
        filtered.padj
    } else {
        test.padj.clone()
    };

    let nan_filled = |column: Option<&Array1<f64>>| -> Vec<f64> {
        column
            .map(|values| values.to_vec())
            .unwrap_or_else(|| vec![f64::NAN; n_genes])
    };

    let glm_converged: Vec<bool> = fit_full
        .converged
        .iter()
        .zip(fit_reduced.converged.iter())
        .map(|(&full_ok, &reduced_ok)| full_ok && reduced_ok)
        .collect();

    let levels = dds
        .cell_metadata()
        .levels(dds.condition_variable())
        .ok_or_else(|| ZinbDiffError::InvalidMetadata {
            reason: format!(
                "Condition variable '{}' has no levels",
                dds.condition_variable()
            ),
        })?;
    let contrast = Contrast {
        variable: dds.condition_variable().to_string(),
        numerator: levels.last().cloned().unwrap_or_default(),
        denominator: levels.first().cloned().unwrap_or_default(),
    };

    Ok(DeResults {
        gene_ids: dds.counts().gene_ids().to_vec(),
        base_means,
        log2_fold_changes,
        lfc_se,
        stat: test.stat.clone(),
        df: test.df.clone(),
        pvalues: test.pvalues.clone(),
        padj,
        gene_dispersions: nan_filled(dds.gene_dispersions()),
        trended_dispersions: nan_filled(dds.trended_dispersions()),
        map_dispersions: nan_filled(dds.map_dispersions()),
        glm_converged,
        weights_converged: dds.weights_converged(),
        contrast,
    })
}

impl DeResults {
    /// Get number of genes
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Get significant genes at given alpha level
    pub fn significant_genes(&self, alpha: f64) -> Vec<&str> {
        self.gene_ids
            .iter()
            .zip(self.padj.iter())
            .filter(|(_, &p)| p.is_finite() && p < alpha)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Get up-regulated genes (positive log2FC, significant)
    pub fn upregulated_genes(&self, alpha: f64, min_lfc: f64) -> Vec<&str> {
        self.gene_ids
            .iter()
            .zip(self.padj.iter().zip(self.log2_fold_changes.iter()))
            .filter(|(_, (&p, &lfc))| p.is_finite() && p < alpha && lfc >= min_lfc)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Get down-regulated genes (negative log2FC, significant)
    pub fn downregulated_genes(&self, alpha: f64, min_lfc: f64) -> Vec<&str> {
        self.gene_ids
            .iter()
            .zip(self.padj.iter().zip(self.log2_fold_changes.iter()))
            .filter(|(_, (&p, &lfc))| p.is_finite() && p < alpha && lfc <= -min_lfc)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Summary statistics
    pub fn summary(&self, alpha: f64) -> ResultsSummary {
        let total = self.n_genes();
        let tested = self.pvalues.iter().filter(|p| p.is_finite()).count();
        let significant = self.significant_genes(alpha).len();
        let upregulated = self.upregulated_genes(alpha, 0.0).len();
        let downregulated = self.downregulated_genes(alpha, 0.0).len();

        ResultsSummary {
            total_genes: total,
            genes_tested: tested,
            significant,
            upregulated,
            downregulated,
            alpha,
        }
    }
}

/// Summary of differential expression results
#[derive(Debug, Clone)]
pub struct ResultsSummary {
    pub total_genes: usize,
    pub genes_tested: usize,
    pub significant: usize,
    pub upregulated: usize,
    pub downregulated: usize,
    pub alpha: f64,
}

impl std::fmt::Display for ResultsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Differential Expression Summary")?;
        writeln!(f, "===============================")?;
        writeln!(f, "Total genes: {}", self.total_genes)?;
        writeln!(f, "Genes tested: {}", self.genes_tested)?;
        writeln!(
            f,
            "Significant (padj < {}): {}",
            self.alpha, self.significant
        )?;
        writeln!(f, "  Up-regulated: {}", self.upregulated)?;
        writeln!(f, "  Down-regulated: {}", self.downregulated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellMetadata, CountMatrix, ZinbDataSet};
    use crate::glm::{fit_glms, GlmFitParams};
    use crate::testing::likelihood_ratio_test;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1};

    fn tested_dataset() -> (ZinbDataSet, LrtTest) {
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
        let lrt = likelihood_ratio_test(&dds).unwrap();
        (dds, lrt)
    }

    #[test]
    fn test_table_columns_are_aligned_and_filled() {
        let (dds, lrt) = tested_dataset();
        let results =
            assemble_results(&dds, &TestColumns::from(&lrt), &ResultsOptions::default()).unwrap();

        assert_eq!(results.n_genes(), 4);
        assert_eq!(results.gene_ids[0], "gene_up");
        assert_eq!(results.base_means.len(), 4);
        assert_eq!(results.log2_fold_changes.len(), 4);
        assert_eq!(results.lfc_se.len(), 4);
        assert_eq!(results.pvalues.len(), 4);
        assert_eq!(results.padj.len(), 4);
        assert_eq!(results.df, vec![1.0; 4]);

        // Unit size factors: base mean is the plain count mean
        assert_relative_eq!(results.base_means[0], 250.0, epsilon = 1e-10);
        assert_relative_eq!(results.base_means[3], 30.833333333333332, epsilon = 1e-9);

        // Count ratio of 4 between groups gives a log2 fold change near 2
        assert!(
            (results.log2_fold_changes[0] - 2.0).abs() < 0.05,
            "gene_up lfc = {}",
            results.log2_fold_changes[0]
        );
        assert!(
            (results.log2_fold_changes[2] + 2.0).abs() < 0.05,
            "gene_down lfc = {}",
            results.log2_fold_changes[2]
        );
        for se in &results.lfc_se {
            assert!(se.is_finite() && *se > 0.0);
        }

        // Filtering off: adjusted values come straight from the test
        for (a, b) in results.padj.iter().zip(lrt.padj.iter()) {
            assert_relative_eq!(*a, *b);
        }

        assert_eq!(results.contrast.variable, "condition");
        assert_eq!(results.contrast.numerator, "B");
        assert_eq!(results.contrast.denominator, "A");
    }

    #[test]
    fn test_diagnostic_columns_reflect_stored_estimates() {
        let (dds, lrt) = tested_dataset();
        let results =
            assemble_results(&dds, &TestColumns::from(&lrt), &ResultsOptions::default()).unwrap();

        for d in &results.gene_dispersions {
            assert_relative_eq!(*d, 0.05);
        }
        // Trend and MAP stages never ran for this dataset
        assert!(results.trended_dispersions.iter().all(|d| d.is_nan()));
        assert!(results.map_dispersions.iter().all(|d| d.is_nan()));
        assert!(results.glm_converged.iter().all(|&c| c));
        assert_eq!(results.weights_converged, None);
    }

    #[test]
    fn test_independent_filtering_with_few_genes_matches_plain_adjustment() {
        let (dds, lrt) = tested_dataset();
        let options = ResultsOptions {
            alpha: 0.05,
            independent_filtering: true,
        };
        let results = assemble_results(&dds, &TestColumns::from(&lrt), &options).unwrap();

        // Too few rejections to justify a cutoff, so every gene is kept
        for (a, b) in results.padj.iter().zip(lrt.padj.iter()) {
            assert_relative_eq!(*a, *b);
        }
    }

    #[test]
    fn test_gene_classification_helpers() {
        let (dds, lrt) = tested_dataset();
        let results =
            assemble_results(&dds, &TestColumns::from(&lrt), &ResultsOptions::default()).unwrap();

        let significant = results.significant_genes(0.05);
        assert_eq!(significant, vec!["gene_up", "gene_down"]);
        assert_eq!(results.upregulated_genes(0.05, 1.0), vec!["gene_up"]);
        assert_eq!(results.downregulated_genes(0.05, 1.0), vec!["gene_down"]);

        let summary = results.summary(0.05);
        assert_eq!(summary.total_genes, 4);
        assert_eq!(summary.genes_tested, 4);
        assert_eq!(summary.significant, 2);
        assert_eq!(summary.upregulated, 1);
        assert_eq!(summary.downregulated, 1);

        let text = format!("{}", summary);
        assert!(text.contains("padj < 0.05"));
        assert!(text.contains("Total genes: 4"));
    }

    #[test]
    fn test_requires_fits_and_size_factors() {
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

        let test = TestColumns {
            stat: vec![1.0, 2.0],
            df: vec![1.0, 1.0],
            pvalues: vec![0.3, 0.2],
            padj: vec![0.3, 0.3],
        };
        let err = assemble_results(&dds, &test, &ResultsOptions::default());
        assert!(matches!(err, Err(ZinbDiffError::InvalidInput { .. })));
    }

    #[test]
    fn test_mismatched_test_length_is_rejected() {
        let (dds, lrt) = tested_dataset();
        let short = TestColumns {
            stat: lrt.stat[..2].to_vec(),
            df: vec![lrt.df; 2],
            pvalues: lrt.pvalues[..2].to_vec(),
            padj: lrt.padj[..2].to_vec(),
        };
        let err = assemble_results(&dds, &short, &ResultsOptions::default());
        assert!(matches!(err, Err(ZinbDiffError::DimensionMismatch { .. })));
    }
}
