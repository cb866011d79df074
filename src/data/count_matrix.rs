//! Count matrix representation for single-cell RNA-seq data

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{Result, ZinbDiffError};

/// Deduplicate names by appending _1, _2, etc. to duplicates
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut result = Vec::with_capacity(names.len());
    for name in &names {
        *seen.entry(name.clone()).or_insert(0) += 1;
    }
    let has_dups = seen.values().any(|&c| c > 1);
    if !has_dups {
        return names;
    }
    seen.clear();
    for name in names {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            result.push(name);
        } else {
            let new_name = format!("{}_{}", name, *count - 1);
            log::warn!("Duplicate gene name '{}' renamed to '{}'", name, new_name);
            result.push(new_name);
        }
    }
    result
}

/// A count matrix of UMI/read counts.
/// Rows are genes, columns are cells.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    /// Raw count data (genes x cells)
    counts: Array2<f64>,
    /// Gene identifiers
    gene_ids: Vec<String>,
    /// Cell identifiers
    cell_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new count matrix from raw data
    pub fn new(counts: Array2<f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_cells) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }

        if cell_ids.len() != n_cells {
            return Err(ZinbDiffError::DimensionMismatch {
                expected: format!("{} cell IDs", n_cells),
                got: format!("{} cell IDs", cell_ids.len()),
            });
        }

        // Counts must be non-negative finite numbers
        if counts.iter().any(|&x| x < 0.0 || x.is_nan() || x.is_infinite()) {
            return Err(ZinbDiffError::InvalidCountMatrix {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }

        if !counts.is_empty() && counts.iter().all(|&x| x == 0.0) {
            return Err(ZinbDiffError::InvalidCountMatrix {
                reason: "All cells have 0 counts for all genes".to_string(),
            });
        }

        if counts.iter().any(|&x| x != x.round()) {
            log::warn!(
                "Some count values are not integers. The NB model expects integer counts; \
                 non-integer values may affect statistical modeling."
            );
        }

        let gene_ids = deduplicate_names(gene_ids);

        Ok(Self {
            counts,
            gene_ids,
            cell_ids,
        })
    }

    /// Create from integer counts
    pub fn from_integers(
        counts: Array2<u32>,
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
    ) -> Result<Self> {
        let float_counts = counts.mapv(|x| x as f64);
        Self::new(float_counts, gene_ids, cell_ids)
    }

    /// Get the number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// Get the number of cells
    pub fn n_cells(&self) -> usize {
        self.counts.ncols()
    }

    /// Get the raw counts as a view
    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    /// Get gene IDs
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    /// Get cell IDs
    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// Get counts for a specific gene
    pub fn gene_counts(&self, gene_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(gene_idx)
    }

    /// Get counts for a specific cell
    pub fn cell_counts(&self, cell_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.column(cell_idx)
    }

    /// Get gene index by ID
    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Get cell index by ID
    pub fn cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cell_ids.iter().position(|id| id == cell_id)
    }

    /// Sum of counts per cell (library size)
    pub fn library_sizes(&self) -> Vec<f64> {
        self.counts.axis_iter(Axis(1)).map(|col| col.sum()).collect()
    }

    /// Mean counts per gene across cells
    pub fn gene_means(&self) -> Vec<f64> {
        let n = self.n_cells() as f64;
        self.counts.axis_iter(Axis(0)).map(|row| row.sum() / n).collect()
    }

    /// Fraction of zero entries per gene
    pub fn gene_zero_fractions(&self) -> Vec<f64> {
        let n = self.n_cells() as f64;
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.iter().filter(|&&x| x == 0.0).count() as f64 / n)
            .collect()
    }

    /// Indices of genes with zero counts in every cell
    pub fn all_zero_genes(&self) -> Vec<usize> {
        (0..self.n_genes())
            .filter(|&i| self.counts.row(i).iter().all(|&x| x == 0.0))
            .collect()
    }

    /// Filter genes by minimum count threshold: keep genes with
    /// count >= min_count in at least min_cells cells
    pub fn filter_low_counts(&self, min_count: f64, min_cells: usize) -> Result<Self> {
        let keep_genes: Vec<usize> = (0..self.n_genes())
            .filter(|&i| {
                let above_threshold =
                    self.counts.row(i).iter().filter(|&&x| x >= min_count).count();
                above_threshold >= min_cells
            })
            .collect();

        if keep_genes.is_empty() {
            return Err(ZinbDiffError::EmptyData {
                reason: "No genes passed the filtering threshold".to_string(),
            });
        }

        let new_counts = self.counts.select(Axis(0), &keep_genes);
        let new_gene_ids: Vec<String> =
            keep_genes.iter().map(|&i| self.gene_ids[i].clone()).collect();

        Self::new(new_counts, new_gene_ids, self.cell_ids.clone())
    }

    /// Subset to specific cells
    pub fn subset_cells(&self, cell_indices: &[usize]) -> Result<Self> {
        let new_counts = self.counts.select(Axis(1), cell_indices);
        let new_cell_ids: Vec<String> = cell_indices
            .iter()
            .map(|&i| self.cell_ids[i].clone())
            .collect();

        Self::new(new_counts, self.gene_ids.clone(), new_cell_ids)
    }

    /// Subset to specific genes
    pub fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        let new_counts = self.counts.select(Axis(0), gene_indices);
        let new_gene_ids: Vec<String> = gene_indices
            .iter()
            .map(|&i| self.gene_ids[i].clone())
            .collect();

        Self::new(new_counts, new_gene_ids, self.cell_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_count_matrix_creation() {
        let counts = array![[10.0, 20.0, 30.0], [5.0, 15.0, 25.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let cell_ids = vec!["c1".to_string(), "c2".to_string(), "c3".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, cell_ids).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_cells(), 3);
    }

    #[test]
    fn test_negative_counts_rejected() {
        let counts = array![[10.0, -5.0], [5.0, 15.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let cell_ids = vec!["c1".to_string(), "c2".to_string()];

        let result = CountMatrix::new(counts, gene_ids, cell_ids);
        assert!(result.is_err());
    }

    #[test]
    fn test_library_sizes() {
        let counts = array![[10.0, 20.0], [5.0, 15.0]];
        let gene_ids = vec!["gene1".to_string(), "gene2".to_string()];
        let cell_ids = vec!["c1".to_string(), "c2".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, cell_ids).unwrap();
        let lib_sizes = matrix.library_sizes();
        assert_eq!(lib_sizes, vec![15.0, 35.0]);
    }

    #[test]
    fn test_all_zero_gene_detection() {
        let counts = array![[10.0, 20.0], [0.0, 0.0], [5.0, 0.0]];
        let gene_ids = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let cell_ids = vec!["c1".to_string(), "c2".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, cell_ids).unwrap();
        assert_eq!(matrix.all_zero_genes(), vec![1]);
        assert_eq!(matrix.gene_zero_fractions(), vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn test_filter_low_counts() {
        let counts = array![[10.0, 20.0, 5.0], [0.0, 1.0, 0.0], [5.0, 8.0, 9.0]];
        let gene_ids = vec!["g1".to_string(), "g2".to_string(), "g3".to_string()];
        let cell_ids = vec!["c1".to_string(), "c2".to_string(), "c3".to_string()];

        let matrix = CountMatrix::new(counts, gene_ids, cell_ids).unwrap();
        let filtered = matrix.filter_low_counts(5.0, 3).unwrap();
        assert_eq!(filtered.n_genes(), 2);
        assert_eq!(filtered.gene_ids(), &["g1".to_string(), "g3".to_string()]);
    }
}
