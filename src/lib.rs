//! zinbdiff: zero-inflation-aware differential expression for single-cell
//! RNA-seq counts
//!
//! The pipeline runs a weighted adaptation of the negative binomial
//! workflow used for bulk RNA-seq. A zero-inflated NB model first assigns
//! each observation a weight separating dropout zeros from genuinely low
//! counts; the weights then flow through dispersion estimation, GLM
//! fitting, and a likelihood ratio test over nested designs.
//!
//! # Example
//!
//! ```ignore
//! use zinbdiff::prelude::*;
//!
//! let mut dds = ZinbDataSet::new(counts, metadata, "condition")?;
//! let results = run_zinbdiff(&mut dds, &ZinbDiffParams::default())?;
//! println!("{}", results.summary(0.05));
//! ```

pub mod data;
pub mod dispersion;
pub mod error;
pub mod filter;
pub mod glm;
pub mod normalization;
pub mod results;
pub mod simulate;
pub mod stats;
pub mod testing;
pub mod weights;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::data::{CellMetadata, CountMatrix, ZinbDataSet};
    pub use crate::dispersion::{estimate_dispersions, DispersionParams};
    pub use crate::error::{Result, ZinbDiffError};
    pub use crate::filter::{independent_filtering, FilteredAdjustment};
    pub use crate::glm::{fit_glms, DesignInfo, GlmFitParams};
    pub use crate::normalization::{estimate_size_factors, PoolingParams, SizeFactorMethod};
    pub use crate::results::{assemble_results, Contrast, DeResults, ResultsOptions, TestColumns};
    pub use crate::simulate::{simulate_scenario, ScenarioParams, ScenarioTruth};
    pub use crate::testing::{
        benjamini_hochberg, likelihood_ratio_test, wald_test, LrtTest, TestMethod, WaldTest,
    };
    pub use crate::weights::{estimate_zinb_weights, ZinbFit, ZinbWeightParams};
    pub use crate::{run_zinbdiff, ZinbDiffParams};
}

use prelude::*;

/// Options for every stage of the pipeline
#[derive(Debug, Clone)]
pub struct ZinbDiffParams {
    pub weights: ZinbWeightParams,
    pub size_factor_method: SizeFactorMethod,
    pub dispersion: DispersionParams,
    pub glm: GlmFitParams,
    pub test_method: TestMethod,
    pub results: ResultsOptions,
}

impl Default for ZinbDiffParams {
    fn default() -> Self {
        Self {
            weights: ZinbWeightParams::default(),
            size_factor_method: SizeFactorMethod::PosCounts,
            dispersion: DispersionParams::default(),
            glm: GlmFitParams::default(),
            test_method: TestMethod::Lrt,
            results: ResultsOptions::default(),
        }
    }
}

/// Run the complete analysis pipeline and assemble the results table.
///
/// Weights and size factors are only estimated when the dataset does not
/// already carry them, so either can be precomputed and supplied.
pub fn run_zinbdiff(dds: &mut ZinbDataSet, params: &ZinbDiffParams) -> Result<DeResults> {
    if !dds.has_weights() {
        log::info!("Estimating zero-inflation weights");
        estimate_zinb_weights(dds, &params.weights)?;
    }

    if !dds.has_size_factors() {
        log::info!("Estimating size factors ({:?})", params.size_factor_method);
        estimate_size_factors(dds, params.size_factor_method)?;
    }

    log::info!("Estimating dispersions");
    estimate_dispersions(dds, &params.dispersion)?;

    log::info!("Fitting weighted GLMs");
    fit_glms(dds, &params.glm)?;

    log::info!("Testing ({:?})", params.test_method);
    let test = match params.test_method {
        TestMethod::Lrt => TestColumns::from(&likelihood_ratio_test(dds)?),
        TestMethod::Wald => TestColumns::from(&wald_test(dds)?),
    };
    assemble_results(dds, &test, &params.results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_full_pipeline_recovers_simulated_effects() {
        let scenario = ScenarioParams::default();
        let (mut dds, truth) = simulate_scenario(&scenario).unwrap();

        let results = run_zinbdiff(&mut dds, &ZinbDiffParams::default()).unwrap();

        assert_eq!(results.n_genes(), 100);
        assert!(results.df.iter().all(|&d| d == 1.0));
        for &m in &results.base_means {
            assert!(m.is_finite() && m > 0.0);
        }

        let n_de = truth.is_differential.iter().filter(|&&d| d).count();
        assert_eq!(n_de, 25);

        let mut detected = 0;
        let mut false_positives = 0;
        for g in 0..100 {
            let significant =
                results.padj[g].is_finite() && results.padj[g] < 0.05;
            if truth.is_differential[g] {
                if significant {
                    detected += 1;
                }
                // A strongly significant call must point the right way
                if results.padj[g].is_finite() && results.padj[g] < 0.01 {
                    assert!(
                        results.log2_fold_changes[g] * truth.log2_fold_changes[g] > 0.0,
                        "gene {} direction: estimated {}, simulated {}",
                        g,
                        results.log2_fold_changes[g],
                        truth.log2_fold_changes[g]
                    );
                }
            } else if significant {
                false_positives += 1;
            }
        }

        assert!(
            detected >= 18,
            "only {} of {} differential genes detected",
            detected,
            n_de
        );
        assert!(
            false_positives <= 8,
            "{} null genes called significant",
            false_positives
        );

        // Signed recovery: estimated effect in the simulated direction
        // should sit near the true magnitude of 2
        let recoveries: Vec<f64> = (0..100)
            .filter(|&g| truth.is_differential[g])
            .map(|g| results.log2_fold_changes[g] * truth.log2_fold_changes[g].signum())
            .collect();
        let typical_recovery = crate::stats::median(&recoveries);
        assert!(
            (typical_recovery - 2.0).abs() < 0.5,
            "typical recovered effect {} is far from the simulated 2",
            typical_recovery
        );

        let summary = results.summary(0.05);
        assert_eq!(summary.total_genes, 100);
        assert!(summary.significant >= detected);
    }

    #[test]
    fn test_pipeline_is_deterministic() {
        let scenario = ScenarioParams {
            n_genes: 60,
            n_cells: 30,
            seed: 19,
            ..ScenarioParams::default()
        };
        let mut params = ZinbDiffParams::default();
        params.weights.rank = 2;
        params.weights.seed = 7;

        let (mut dds_a, _) = simulate_scenario(&scenario).unwrap();
        let results_a = run_zinbdiff(&mut dds_a, &params).unwrap();

        let (mut dds_b, _) = simulate_scenario(&scenario).unwrap();
        let results_b = run_zinbdiff(&mut dds_b, &params).unwrap();

        for (a, b) in results_a.pvalues.iter().zip(results_b.pvalues.iter()) {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
        for (a, b) in results_a
            .log2_fold_changes
            .iter()
            .zip(results_b.log2_fold_changes.iter())
        {
            assert!(a == b || (a.is_nan() && b.is_nan()));
        }
    }

    #[test]
    fn test_constant_gene_flows_through_as_null() {
        let scenario = ScenarioParams {
            n_genes: 40,
            n_cells: 20,
            dropout_shape: 0.0,
            seed: 23,
            ..ScenarioParams::default()
        };
        let (sim, _) = simulate_scenario(&scenario).unwrap();

        // Rebuild the dataset with gene 0 forced to the same count everywhere
        let mut counts: Array2<f64> = sim.counts().counts().to_owned();
        for c in 0..20 {
            counts[[0, c]] = 5.0;
        }
        let gene_ids = sim.counts().gene_ids().to_vec();
        let cell_ids = sim.counts().cell_ids().to_vec();
        let matrix = CountMatrix::new(counts, gene_ids, cell_ids.clone()).unwrap();

        let mut metadata = CellMetadata::new(cell_ids);
        let conditions = sim
            .cell_metadata()
            .condition("condition")
            .unwrap()
            .clone();
        metadata.add_condition("condition", conditions).unwrap();
        let mut dds = ZinbDataSet::new(matrix, metadata, "condition").unwrap();

        let results = run_zinbdiff(&mut dds, &ZinbDiffParams::default()).unwrap();

        assert!(results.pvalues[0].is_finite());
        assert!(
            results.pvalues[0] > 0.5,
            "constant gene p = {}",
            results.pvalues[0]
        );
        assert!(
            results.log2_fold_changes[0].abs() < 0.2,
            "constant gene lfc = {}",
            results.log2_fold_changes[0]
        );
    }

    #[test]
    fn test_wald_method_finds_the_strong_genes() {
        let scenario = ScenarioParams {
            n_genes: 50,
            n_cells: 20,
            seed: 31,
            ..ScenarioParams::default()
        };
        let (mut dds, truth) = simulate_scenario(&scenario).unwrap();

        let params = ZinbDiffParams {
            test_method: TestMethod::Wald,
            ..ZinbDiffParams::default()
        };
        let results = run_zinbdiff(&mut dds, &params).unwrap();

        // Effective df is the weight total minus the two coefficients
        for &df in &results.df {
            assert!(df > 0.0 && df <= 18.0);
        }

        let n_de = truth.is_differential.iter().filter(|&&d| d).count();
        let detected = (0..50)
            .filter(|&g| {
                truth.is_differential[g]
                    && results.padj[g].is_finite()
                    && results.padj[g] < 0.05
            })
            .count();
        assert!(
            detected * 2 >= n_de,
            "Wald detected {} of {} differential genes",
            detected,
            n_de
        );
    }
}
