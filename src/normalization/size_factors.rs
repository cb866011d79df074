//! Size factor estimation for sparse single-cell counts
//!
//! Two strategies are provided. The positive-counts ratio method adapts the
//! median-of-ratios estimator to sparse data by taking the per-gene
//! reference geometric mean over nonzero counts only. The pooling method
//! sums cells into overlapping pools before taking ratios, which cancels
//! the zeros that make per-cell ratios unstable, and recovers per-cell
//! factors from the pool equations by least squares (Lun et al. 2016).
//!
//! Both strategies rescale their result so the geometric mean of the
//! factors is exactly 1.

use ndarray::{Array1, ArrayView2, Axis};

use crate::data::ZinbDataSet;
use crate::error::{Result, ZinbDiffError};
use crate::stats::{geometric_mean_positive, median};

/// Method for size factor estimation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeFactorMethod {
    /// Median of ratios with geometric means over positive counts only
    PosCounts,
    /// Pooling deconvolution for data with many zeros
    Pooled,
}

/// Parameters for the pooling deconvolution method
#[derive(Debug, Clone)]
pub struct PoolingParams {
    /// Pool sizes to slide around the ring of cells. Empty selects a
    /// ladder suited to the number of cells.
    pub pool_sizes: Vec<usize>,
    /// Weight of the per-cell equations tying each factor to relative
    /// library size. Keeps the least-squares system full rank for any
    /// window configuration.
    pub anchor_weight: f64,
}

impl Default for PoolingParams {
    fn default() -> Self {
        Self {
            pool_sizes: Vec::new(),
            anchor_weight: 0.1,
        }
    }
}

/// Estimate size factors and store them on the dataset together with the
/// normalized count matrix.
pub fn estimate_size_factors(dds: &mut ZinbDataSet, method: SizeFactorMethod) -> Result<()> {
    let counts = dds.counts().counts();

    let size_factors = match method {
        SizeFactorMethod::PosCounts => poscounts_size_factors(counts)?,
        SizeFactorMethod::Pooled => pooled_size_factors(counts, &PoolingParams::default())?,
    };

    log::debug!(
        "Size factors ({:?}): range [{:.4}, {:.4}]",
        method,
        size_factors.iter().cloned().fold(f64::INFINITY, f64::min),
        size_factors.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    );

    dds.set_size_factors(size_factors)
}

/// Median-of-ratios factors with the reference geometric mean taken over
/// positive counts.
///
/// The log-sum of a gene's positive counts is divided by the total number
/// of cells, so the reference shrinks for sparse genes and every gene with
/// at least one positive count contributes.
pub fn poscounts_size_factors(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let (n_genes, n_cells) = counts.dim();

    if n_genes == 0 || n_cells == 0 {
        return Err(ZinbDiffError::EmptyData {
            reason: "count matrix is empty".to_string(),
        });
    }

    let mut geo_means = Vec::with_capacity(n_genes);
    let mut usable_genes = Vec::new();

    for (g, row) in counts.axis_iter(Axis(0)).enumerate() {
        let log_sum: f64 = row.iter().filter(|&&y| y > 0.0).map(|&y| y.ln()).sum();
        let n_positive = row.iter().filter(|&&y| y > 0.0).count();
        if n_positive > 0 {
            geo_means.push((log_sum / n_cells as f64).exp());
            usable_genes.push(g);
        }
    }

    if usable_genes.is_empty() {
        return Err(ZinbDiffError::SizeFactorFailed {
            reason: "no genes with positive counts".to_string(),
        });
    }

    let mut size_factors = Array1::zeros(n_cells);

    for c in 0..n_cells {
        let ratios: Vec<f64> = usable_genes
            .iter()
            .zip(geo_means.iter())
            .filter_map(|(&g, &geo_mean)| {
                let count = counts[[g, c]];
                if count > 0.0 && geo_mean > 0.0 {
                    Some(count / geo_mean)
                } else {
                    None
                }
            })
            .collect();

        if ratios.is_empty() {
            return Err(ZinbDiffError::SizeFactorFailed {
                reason: format!("cell {} has no positive counts", c),
            });
        }

        size_factors[c] = median(&ratios);
    }

    rescale_to_unit_geomean(&mut size_factors)?;
    Ok(size_factors)
}

/// Pooling deconvolution factors.
///
/// Cells are arranged on a ring along which library sizes rise and then
/// fall, so every window of adjacent cells mixes sequencing depths. For
/// each window the pooled count vector is compared to the average cell by
/// a median ratio, giving one linear equation on the sum of the member
/// factors. Together with the low-weight anchor equations the stacked
/// system is solved through its normal equations.
pub fn pooled_size_factors(
    counts: ArrayView2<f64>,
    params: &PoolingParams,
) -> Result<Array1<f64>> {
    let (n_genes, n_cells) = counts.dim();

    if n_genes == 0 || n_cells == 0 {
        return Err(ZinbDiffError::EmptyData {
            reason: "count matrix is empty".to_string(),
        });
    }
    if n_cells < 2 {
        return Err(ZinbDiffError::SizeFactorFailed {
            reason: "pooling requires at least 2 cells".to_string(),
        });
    }
    if !(params.anchor_weight > 0.0 && params.anchor_weight.is_finite()) {
        return Err(ZinbDiffError::InvalidInput {
            reason: "anchor weight must be positive and finite".to_string(),
        });
    }

    let totals: Vec<f64> = (0..n_cells).map(|c| counts.column(c).sum()).collect();
    if let Some(c) = totals.iter().position(|&t| t <= 0.0) {
        return Err(ZinbDiffError::SizeFactorFailed {
            reason: format!("cell {} has zero total count", c),
        });
    }
    let mean_total = totals.iter().sum::<f64>() / n_cells as f64;

    let pool_sizes = if params.pool_sizes.is_empty() {
        default_pool_sizes(n_cells)
    } else {
        params.pool_sizes.clone()
    };
    if pool_sizes.iter().any(|&s| s < 2 || s > n_cells) {
        return Err(ZinbDiffError::InvalidInput {
            reason: format!("pool sizes must be between 2 and {}", n_cells),
        });
    }

    // Average cell as the deconvolution reference
    let reference: Vec<f64> = (0..n_genes)
        .map(|g| counts.row(g).sum() / n_cells as f64)
        .collect();

    let ring = ring_order(&totals);

    let n = n_cells;
    let mut ata = vec![0.0; n * n];
    let mut atb = vec![0.0; n];

    let mut pooled = vec![0.0; n_genes];
    for &size in &pool_sizes {
        for start in 0..n_cells {
            let members: Vec<usize> = (0..size).map(|k| ring[(start + k) % n_cells]).collect();

            for value in pooled.iter_mut() {
                *value = 0.0;
            }
            for &c in &members {
                for g in 0..n_genes {
                    pooled[g] += counts[[g, c]];
                }
            }

            // Every cell has a positive total, so at least one gene has a
            // positive reference mean and the ratio list is never empty.
            let ratios: Vec<f64> = pooled
                .iter()
                .zip(reference.iter())
                .filter(|&(_, &r)| r > 0.0)
                .map(|(&v, &r)| v / r)
                .collect();
            let pool_ratio = median(&ratios);

            for &ci in &members {
                atb[ci] += pool_ratio;
                for &cj in &members {
                    ata[ci * n + cj] += 1.0;
                }
            }
        }
    }

    let anchor_sq = params.anchor_weight * params.anchor_weight;
    for c in 0..n_cells {
        ata[c * n + c] += anchor_sq;
        atb[c] += anchor_sq * totals[c] / mean_total;
    }

    let mut size_factors = Array1::from_vec(solve_normal_equations(&ata, &atb, n));

    if size_factors.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        return Err(ZinbDiffError::SizeFactorFailed {
            reason: "pooling deconvolution produced nonpositive factors; \
                     the counts may be too sparse for the pool sizes used"
                .to_string(),
        });
    }

    rescale_to_unit_geomean(&mut size_factors)?;
    Ok(size_factors)
}

/// Pool size ladder. The standard ladder 21..=101 applies when enough cells
/// are available; smaller datasets fall back to windows spanning roughly
/// half and all of the cells.
fn default_pool_sizes(n_cells: usize) -> Vec<usize> {
    let ladder: Vec<usize> = (21..=101).step_by(20).filter(|&s| s <= n_cells).collect();
    if !ladder.is_empty() {
        return ladder;
    }
    let half = (n_cells / 2).clamp(2, n_cells);
    if half == n_cells {
        vec![half]
    } else {
        vec![half, n_cells]
    }
}

/// Ring of cell indices: library sizes ascend through the odd sort
/// positions and descend back through the even ones, so adjacent cells on
/// the ring always mix small and large depths.
fn ring_order(totals: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..totals.len()).collect();
    order.sort_by(|&a, &b| totals[a].total_cmp(&totals[b]));

    let mut ring = Vec::with_capacity(order.len());
    ring.extend(order.iter().copied().step_by(2));
    ring.extend(order.iter().copied().skip(1).step_by(2).rev());
    ring
}

/// Rescale so the geometric mean of the factors is exactly 1.
fn rescale_to_unit_geomean(size_factors: &mut Array1<f64>) -> Result<()> {
    if size_factors.iter().any(|&s| s <= 0.0 || !s.is_finite()) {
        return Err(ZinbDiffError::SizeFactorFailed {
            reason: "nonpositive or nonfinite size factor before rescaling".to_string(),
        });
    }

    let center = geometric_mean_positive(&size_factors.to_vec());
    size_factors.mapv_inplace(|s| s / center);
    Ok(())
}

/// Cholesky solve of the symmetric positive definite normal equations,
/// row-major flat storage.
fn solve_normal_equations(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CellMetadata, CountMatrix};
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    fn geomean(values: &Array1<f64>) -> f64 {
        (values.iter().map(|&v| v.ln()).sum::<f64>() / values.len() as f64).exp()
    }

    /// Counts proportional in gene and cell: counts[g, c] = base[g] * depth[c]
    fn proportional_counts(base: &[f64], depth: &[f64]) -> Array2<f64> {
        let mut counts = Array2::zeros((base.len(), depth.len()));
        for (g, &b) in base.iter().enumerate() {
            for (c, &d) in depth.iter().enumerate() {
                counts[[g, c]] = b * d;
            }
        }
        counts
    }

    #[test]
    fn test_poscounts_reflects_depth_despite_zeros() {
        // Cells 1 and 3 at double depth; each gene carries one dropout zero
        let counts = array![
            [100.0, 200.0, 0.0, 160.0],
            [500.0, 0.0, 400.0, 800.0],
            [50.0, 100.0, 40.0, 0.0],
            [0.0, 400.0, 160.0, 320.0],
            [200.0, 400.0, 160.0, 320.0],
        ];
        let sf = poscounts_size_factors(counts.view()).unwrap();

        assert!(sf.iter().all(|&s| s > 0.0));
        assert_relative_eq!(geomean(&sf), 1.0, epsilon = 1e-10);
        let ratio = sf[1] / sf[0];
        assert!((1.6..=2.4).contains(&ratio), "depth ratio {}", ratio);
    }

    #[test]
    fn test_poscounts_rejects_all_zero_cell() {
        let counts = array![[5.0, 0.0, 3.0], [2.0, 0.0, 8.0]];
        let err = poscounts_size_factors(counts.view());
        assert!(matches!(err, Err(ZinbDiffError::SizeFactorFailed { .. })));
    }

    #[test]
    fn test_pooled_recovers_exact_depth_gradient() {
        // Proportional counts make every pool equation exact, so the
        // least-squares solution reproduces the depth ratios
        let base = [10.0, 20.0, 5.0, 40.0, 15.0];
        let depth = [1.0, 2.0, 1.0, 4.0, 2.0, 1.0];
        let counts = proportional_counts(&base, &depth);

        let sf = pooled_size_factors(counts.view(), &PoolingParams::default()).unwrap();

        assert_relative_eq!(geomean(&sf), 1.0, epsilon = 1e-10);
        for c in 0..depth.len() {
            assert_relative_eq!(sf[c] / sf[0], depth[c] / depth[0], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_pooled_stays_positive_under_heavy_zeros() {
        let counts = array![
            [4.0, 0.0, 9.0, 0.0, 5.0, 0.0, 12.0, 0.0],
            [0.0, 6.0, 0.0, 11.0, 0.0, 7.0, 0.0, 14.0],
            [3.0, 5.0, 0.0, 0.0, 8.0, 9.0, 10.0, 0.0],
            [0.0, 0.0, 7.0, 6.0, 0.0, 0.0, 9.0, 16.0],
            [2.0, 3.0, 4.0, 5.0, 4.0, 5.0, 6.0, 8.0],
        ];
        let sf = pooled_size_factors(counts.view(), &PoolingParams::default()).unwrap();

        assert!(sf.iter().all(|&s| s > 0.0 && s.is_finite()));
        assert_relative_eq!(geomean(&sf), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_pooled_rejects_all_zero_cell() {
        let counts = array![[5.0, 0.0, 3.0], [2.0, 0.0, 8.0]];
        let err = pooled_size_factors(counts.view(), &PoolingParams::default());
        assert!(matches!(err, Err(ZinbDiffError::SizeFactorFailed { .. })));
    }

    #[test]
    fn test_pool_size_bounds_are_checked() {
        let counts = proportional_counts(&[10.0, 20.0], &[1.0, 2.0, 1.0]);
        let params = PoolingParams {
            pool_sizes: vec![5],
            ..PoolingParams::default()
        };
        let err = pooled_size_factors(counts.view(), &params);
        assert!(matches!(err, Err(ZinbDiffError::InvalidInput { .. })));
    }

    #[test]
    fn test_ring_order_alternates_depths() {
        let totals = [10.0, 50.0, 20.0, 40.0, 30.0, 60.0];
        let ring = ring_order(&totals);

        let mut sorted_back = ring.clone();
        sorted_back.sort_unstable();
        assert_eq!(sorted_back, vec![0, 1, 2, 3, 4, 5]);

        // Depths rise along the first half of the ring and fall back along
        // the second: 10, 30, 50, 60, 40, 20
        assert_eq!(ring, vec![0, 4, 1, 5, 3, 2]);
    }

    #[test]
    fn test_default_pool_sizes_scale_with_cells() {
        assert_eq!(default_pool_sizes(6), vec![3, 6]);
        assert_eq!(default_pool_sizes(40), vec![21]);
        assert_eq!(default_pool_sizes(120), vec![21, 41, 61, 81, 101]);
    }

    #[test]
    fn test_both_strategies_track_simulated_depths() {
        use crate::simulate::{simulate_scenario, ScenarioParams};
        use crate::stats::pearson_correlation;

        let scenario = ScenarioParams {
            n_genes: 100,
            n_cells: 24,
            de_fraction: 0.0,
            seed: 13,
            ..ScenarioParams::default()
        };
        let (dds, truth) = simulate_scenario(&scenario).unwrap();
        let counts = dds.counts().counts();

        let pos = poscounts_size_factors(counts).unwrap();
        let pooled = pooled_size_factors(counts, &PoolingParams::default()).unwrap();

        let log_depth: Vec<f64> = truth.cell_depths.iter().map(|&d| d.ln()).collect();
        let log_pos: Vec<f64> = pos.iter().map(|&s| s.ln()).collect();
        let log_pooled: Vec<f64> = pooled.iter().map(|&s| s.ln()).collect();

        let r_pos = pearson_correlation(&log_pos, &log_depth);
        let r_pooled = pearson_correlation(&log_pooled, &log_depth);
        assert!(r_pos > 0.8, "poscounts depth correlation {}", r_pos);
        assert!(r_pooled > 0.8, "pooled depth correlation {}", r_pooled);
    }

    #[test]
    fn test_stage_stores_factors_and_normalized_counts() {
        let counts = proportional_counts(&[10.0, 20.0, 5.0, 40.0], &[1.0, 2.0, 1.0, 2.0]);
        let gene_ids = (0..4).map(|g| format!("g{}", g)).collect();
        let cell_ids: Vec<String> = (0..4).map(|c| format!("c{}", c)).collect();
        let matrix = CountMatrix::new(counts, gene_ids, cell_ids.clone()).unwrap();

        let mut metadata = CellMetadata::new(cell_ids);
        metadata
            .add_condition(
                "condition",
                vec!["A", "A", "B", "B"].into_iter().map(String::from).collect(),
            )
            .unwrap();
        let mut dds = ZinbDataSet::new(matrix, metadata, "condition").unwrap();

        estimate_size_factors(&mut dds, SizeFactorMethod::PosCounts).unwrap();

        assert!(dds.has_size_factors());
        let sf = dds.size_factors().unwrap();
        let normalized = dds.normalized_counts().unwrap();
        for c in 0..4 {
            assert_relative_eq!(
                normalized[[0, c]],
                dds.counts().counts()[[0, c]] / sf[c],
                epsilon = 1e-12
            );
        }
    }
}
