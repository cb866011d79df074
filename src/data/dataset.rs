//! ZinbDataSet - Main data structure for zero-inflation-aware differential expression

use ndarray::{Array1, Array2};

use super::{CellMetadata, CountMatrix};
use crate::error::{Result, ZinbDiffError};
use crate::glm::fitting::GlmFit;

/// Main data structure for the analysis pipeline.
/// Contains count data, metadata, and the derived artifacts of each stage.
/// Each artifact is written exactly once by its producing stage and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct ZinbDataSet {
    /// Raw count matrix (genes x cells)
    counts: CountMatrix,
    /// Cell metadata (experimental conditions)
    cell_metadata: CellMetadata,
    /// Condition variable used for differential expression
    condition_variable: String,

    // Zero-inflation weight results
    /// Observation weights (genes x cells), entries in [0,1];
    /// exactly 1 wherever the count is nonzero
    weights: Option<Array2<f64>>,
    /// Whether the weight model converged within its iteration bound
    weights_converged: Option<bool>,

    // Normalization results
    /// Size factors for each cell, geometric mean 1
    size_factors: Option<Array1<f64>>,
    /// Normalized counts (counts / size_factors)
    normalized_counts: Option<Array2<f64>>,

    // Dispersion estimation results
    /// Raw gene-wise dispersion estimates (weighted method-of-moments)
    gene_dispersions: Option<Array1<f64>>,
    /// Trended dispersion estimates
    trended_dispersions: Option<Array1<f64>>,
    /// Final MAP dispersion estimates
    map_dispersions: Option<Array1<f64>>,
    /// Preliminary expected counts (mu) from the raw dispersion stage
    mu: Option<Array2<f64>>,
    /// Trend coefficients from the parametric fit: (asympt_disp, extra_pois).
    /// Formula: dispersion(mean) = asympt_disp + extra_pois / mean
    dispersion_function: Option<(f64, f64)>,
    /// Prior variance used for MAP shrinkage
    dispersion_prior_var: Option<f64>,

    // GLM results
    /// Fit of the full design
    fit_full: Option<GlmFit>,
    /// Fit of the reduced design
    fit_reduced: Option<GlmFit>,
}

impl ZinbDataSet {
    /// Create a new dataset
    pub fn new(
        counts: CountMatrix,
        cell_metadata: CellMetadata,
        condition_variable: &str,
    ) -> Result<Self> {
        if counts.cell_ids() != cell_metadata.cell_ids() {
            return Err(ZinbDiffError::InvalidMetadata {
                reason: "Cell IDs in counts and metadata do not match".to_string(),
            });
        }

        if cell_metadata.condition(condition_variable).is_none() {
            return Err(ZinbDiffError::InvalidDesignMatrix {
                reason: format!(
                    "Condition variable '{}' not found in metadata",
                    condition_variable
                ),
            });
        }

        if let Some(levels) = cell_metadata.levels(condition_variable) {
            if levels.len() < 2 {
                return Err(ZinbDiffError::InvalidDesignMatrix {
                    reason: format!(
                        "Condition variable '{}' has only one level ('{}'); \
                         differential expression requires at least two",
                        condition_variable,
                        levels.first().map(|s| s.as_str()).unwrap_or(""),
                    ),
                });
            }
        }

        Ok(Self {
            counts,
            cell_metadata,
            condition_variable: condition_variable.to_string(),
            weights: None,
            weights_converged: None,
            size_factors: None,
            normalized_counts: None,
            gene_dispersions: None,
            trended_dispersions: None,
            map_dispersions: None,
            mu: None,
            dispersion_function: None,
            dispersion_prior_var: None,
            fit_full: None,
            fit_reduced: None,
        })
    }

    // Getters
    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn cell_metadata(&self) -> &CellMetadata {
        &self.cell_metadata
    }

    pub fn condition_variable(&self) -> &str {
        &self.condition_variable
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }

    pub fn n_cells(&self) -> usize {
        self.counts.n_cells()
    }

    pub fn weights(&self) -> Option<&Array2<f64>> {
        self.weights.as_ref()
    }

    pub fn weights_converged(&self) -> Option<bool> {
        self.weights_converged
    }

    pub fn size_factors(&self) -> Option<&Array1<f64>> {
        self.size_factors.as_ref()
    }

    pub fn normalized_counts(&self) -> Option<&Array2<f64>> {
        self.normalized_counts.as_ref()
    }

    pub fn gene_dispersions(&self) -> Option<&Array1<f64>> {
        self.gene_dispersions.as_ref()
    }

    pub fn trended_dispersions(&self) -> Option<&Array1<f64>> {
        self.trended_dispersions.as_ref()
    }

    pub fn map_dispersions(&self) -> Option<&Array1<f64>> {
        self.map_dispersions.as_ref()
    }

    /// Dispersions used downstream: MAP when available, raw otherwise
    pub fn dispersions(&self) -> Option<&Array1<f64>> {
        self.map_dispersions
            .as_ref()
            .or(self.gene_dispersions.as_ref())
    }

    /// Preliminary expected counts (mu) from the raw dispersion stage
    pub fn mu(&self) -> Option<&Array2<f64>> {
        self.mu.as_ref()
    }

    /// Trend coefficients (asympt_disp, extra_pois) from the parametric fit
    pub fn dispersion_function(&self) -> Option<(f64, f64)> {
        self.dispersion_function
    }

    pub fn dispersion_prior_var(&self) -> Option<f64> {
        self.dispersion_prior_var
    }

    pub fn fit_full(&self) -> Option<&GlmFit> {
        self.fit_full.as_ref()
    }

    pub fn fit_reduced(&self) -> Option<&GlmFit> {
        self.fit_reduced.as_ref()
    }

    /// Condition levels in reference-first order
    pub fn condition_levels(&self) -> Option<Vec<String>> {
        self.cell_metadata.levels(&self.condition_variable)
    }

    /// The reference level for the condition variable
    pub fn reference_level(&self) -> Option<String> {
        self.condition_levels()
            .and_then(|levels| levels.first().cloned())
    }

    // Setters (for internal use during analysis)

    /// Set observation weights. Enforces the weight contract: entries in
    /// [0,1], exactly 1 wherever the count is nonzero.
    pub fn set_weights(&mut self, weights: Array2<f64>, converged: bool) -> Result<()> {
        if weights.nrows() != self.n_genes() || weights.ncols() != self.n_cells() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{}x{} weight matrix", self.n_genes(), self.n_cells()),
                got: format!("{}x{}", weights.nrows(), weights.ncols()),
            });
        }
        if weights.iter().any(|&w| !w.is_finite() || !(0.0..=1.0).contains(&w)) {
            return Err(ZinbDiffError::InvalidInput {
                reason: "weights must be finite values in [0, 1]".to_string(),
            });
        }
        let raw = self.counts.counts();
        for i in 0..self.n_genes() {
            for j in 0..self.n_cells() {
                if raw[[i, j]] > 0.0 && weights[[i, j]] != 1.0 {
                    return Err(ZinbDiffError::InvalidInput {
                        reason: format!(
                            "weight for nonzero count at gene {} cell {} must be 1, got {}",
                            i,
                            j,
                            weights[[i, j]]
                        ),
                    });
                }
            }
        }
        self.weights = Some(weights);
        self.weights_converged = Some(converged);
        Ok(())
    }

    pub fn set_size_factors(&mut self, size_factors: Array1<f64>) -> Result<()> {
        if size_factors.len() != self.n_cells() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} size factors", self.n_cells()),
                got: format!("{}", size_factors.len()),
            });
        }
        if size_factors
            .iter()
            .any(|&x| x.is_nan() || x.is_infinite() || x <= 0.0)
        {
            return Err(ZinbDiffError::InvalidInput {
                reason: "size factors must be positive finite values".to_string(),
            });
        }
        self.size_factors = Some(size_factors);
        self.compute_normalized_counts();
        Ok(())
    }

    pub fn set_gene_dispersions(&mut self, dispersions: Array1<f64>) -> Result<()> {
        if dispersions.len() != self.n_genes() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} dispersions", self.n_genes()),
                got: format!("{}", dispersions.len()),
            });
        }
        self.gene_dispersions = Some(dispersions);
        Ok(())
    }

    pub fn set_trended_dispersions(&mut self, dispersions: Array1<f64>) -> Result<()> {
        if dispersions.len() != self.n_genes() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} dispersions", self.n_genes()),
                got: format!("{}", dispersions.len()),
            });
        }
        self.trended_dispersions = Some(dispersions);
        Ok(())
    }

    pub fn set_map_dispersions(&mut self, dispersions: Array1<f64>) -> Result<()> {
        if dispersions.len() != self.n_genes() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} dispersions", self.n_genes()),
                got: format!("{}", dispersions.len()),
            });
        }
        self.map_dispersions = Some(dispersions);
        Ok(())
    }

    /// Set the preliminary expected counts (mu) from the raw dispersion stage
    pub fn set_mu(&mut self, mu: Array2<f64>) -> Result<()> {
        if mu.nrows() != self.n_genes() || mu.ncols() != self.n_cells() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{}x{} mu matrix", self.n_genes(), self.n_cells()),
                got: format!("{}x{}", mu.nrows(), mu.ncols()),
            });
        }
        self.mu = Some(mu);
        Ok(())
    }

    /// Set trend coefficients from the parametric fit
    pub fn set_dispersion_function(&mut self, asympt_disp: f64, extra_pois: f64) {
        self.dispersion_function = Some((asympt_disp, extra_pois));
    }

    pub fn set_dispersion_prior_var(&mut self, var: f64) {
        self.dispersion_prior_var = Some(var);
    }

    pub fn set_fit_full(&mut self, fit: GlmFit) -> Result<()> {
        self.validate_fit(&fit)?;
        self.fit_full = Some(fit);
        Ok(())
    }

    pub fn set_fit_reduced(&mut self, fit: GlmFit) -> Result<()> {
        self.validate_fit(&fit)?;
        self.fit_reduced = Some(fit);
        Ok(())
    }

    fn validate_fit(&self, fit: &GlmFit) -> Result<()> {
        if fit.coefficients.nrows() != self.n_genes() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} genes in GLM fit", self.n_genes()),
                got: format!("{}", fit.coefficients.nrows()),
            });
        }
        if fit.mu.ncols() != self.n_cells() {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} cells in GLM fit", self.n_cells()),
                got: format!("{}", fit.mu.ncols()),
            });
        }
        Ok(())
    }

    /// Compute normalized counts from raw counts and size factors
    fn compute_normalized_counts(&mut self) {
        let raw = self.counts.counts();
        let n_genes = self.n_genes();

        if let Some(sf) = &self.size_factors {
            let mut normalized = raw.to_owned();
            for (j, &s) in sf.iter().enumerate() {
                if s > 0.0 {
                    for i in 0..n_genes {
                        normalized[[i, j]] /= s;
                    }
                }
            }
            self.normalized_counts = Some(normalized);
        }
    }

    /// Check if weights have been estimated
    pub fn has_weights(&self) -> bool {
        self.weights.is_some()
    }

    /// Check if size factors have been estimated
    pub fn has_size_factors(&self) -> bool {
        self.size_factors.is_some()
    }

    /// Check if dispersions have been estimated
    pub fn has_dispersions(&self) -> bool {
        self.gene_dispersions.is_some() || self.map_dispersions.is_some()
    }

    /// Check if both GLM designs have been fitted
    pub fn has_glm_fits(&self) -> bool {
        self.fit_full.is_some() && self.fit_reduced.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn create_test_dataset() -> ZinbDataSet {
        let counts = CountMatrix::new(
            array![
                [10.0, 20.0, 0.0, 15.0],
                [50.0, 60.0, 40.0, 55.0],
                [0.0, 2.0, 1.0, 3.0]
            ],
            vec!["gene1".to_string(), "gene2".to_string(), "gene3".to_string()],
            vec![
                "c1".to_string(),
                "c2".to_string(),
                "c3".to_string(),
                "c4".to_string(),
            ],
        )
        .unwrap();

        let mut metadata = CellMetadata::new(vec![
            "c1".to_string(),
            "c2".to_string(),
            "c3".to_string(),
            "c4".to_string(),
        ]);
        metadata
            .add_condition(
                "group",
                vec![
                    "ctrl".to_string(),
                    "ctrl".to_string(),
                    "stim".to_string(),
                    "stim".to_string(),
                ],
            )
            .unwrap();

        ZinbDataSet::new(counts, metadata, "group").unwrap()
    }

    #[test]
    fn test_dataset_creation() {
        let dds = create_test_dataset();
        assert_eq!(dds.n_genes(), 3);
        assert_eq!(dds.n_cells(), 4);
        assert_eq!(dds.condition_variable(), "group");
        assert_eq!(dds.reference_level().unwrap(), "ctrl");
    }

    #[test]
    fn test_single_level_condition_rejected() {
        let counts = CountMatrix::new(
            array![[1.0, 2.0]],
            vec!["g1".to_string()],
            vec!["c1".to_string(), "c2".to_string()],
        )
        .unwrap();
        let mut metadata = CellMetadata::new(vec!["c1".to_string(), "c2".to_string()]);
        metadata
            .add_condition("group", vec!["a".to_string(), "a".to_string()])
            .unwrap();

        assert!(ZinbDataSet::new(counts, metadata, "group").is_err());
    }

    #[test]
    fn test_size_factor_setting() {
        let mut dds = create_test_dataset();
        let sf = Array1::from_vec(vec![1.0, 1.5, 0.8, 1.2]);
        dds.set_size_factors(sf).unwrap();

        assert!(dds.has_size_factors());
        assert!(dds.normalized_counts().is_some());

        let normalized = dds.normalized_counts().unwrap();
        assert!((normalized[[0, 1]] - 20.0 / 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_weight_contract_enforced() {
        let mut dds = create_test_dataset();

        // Down-weighting a nonzero observation violates the contract
        let bad = Array2::from_elem((3, 4), 0.5);
        assert!(dds.set_weights(bad, true).is_err());

        // Weights below 1 only where the count is zero are valid
        let mut good = Array2::from_elem((3, 4), 1.0);
        good[[0, 2]] = 0.3;
        good[[2, 0]] = 0.7;
        dds.set_weights(good, true).unwrap();
        assert!(dds.has_weights());
        assert_eq!(dds.weights_converged(), Some(true));
    }

    #[test]
    fn test_out_of_range_weights_rejected() {
        let mut dds = create_test_dataset();
        let mut w = Array2::from_elem((3, 4), 1.0);
        w[[0, 2]] = 1.5;
        assert!(dds.set_weights(w, true).is_err());
    }
}
