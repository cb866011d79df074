//! Design matrix creation for the weighted NB GLMs

use ndarray::Array2;

use crate::data::CellMetadata;
use crate::error::{Result, ZinbDiffError};

/// Information about the full design matrix
#[derive(Debug, Clone)]
pub struct DesignInfo {
    /// Names of the coefficients
    pub coef_names: Vec<String>,
    /// Reference level for the condition variable
    pub reference_level: String,
    /// All levels of the condition variable
    pub levels: Vec<String>,
}

/// Create the full design matrix for a categorical condition with
/// treatment contrasts (reference level coded as 0).
///
/// Column 0 is the intercept; columns 1..k are indicators for each
/// non-reference level, in level sort order.
pub fn create_design_matrix(
    metadata: &CellMetadata,
    condition: &str,
) -> Result<(Array2<f64>, DesignInfo)> {
    let values = metadata
        .condition(condition)
        .ok_or_else(|| ZinbDiffError::InvalidDesignMatrix {
            reason: format!("Variable '{}' not found in metadata", condition),
        })?;

    let levels = metadata
        .levels(condition)
        .ok_or_else(|| ZinbDiffError::InvalidDesignMatrix {
            reason: format!("No levels found for variable '{}'", condition),
        })?;

    if levels.len() < 2 {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: format!(
                "Condition '{}' must have at least 2 levels for testing",
                condition
            ),
        });
    }

    let n_cells = metadata.n_cells();
    let n_coefs = levels.len();

    let mut design = Array2::zeros((n_cells, n_coefs));
    let reference_level = &levels[0];

    for (i, value) in values.iter().enumerate() {
        design[[i, 0]] = 1.0;
        for (j, level) in levels.iter().enumerate().skip(1) {
            if value == level {
                design[[i, j]] = 1.0;
            }
        }
    }

    let mut coef_names = vec!["Intercept".to_string()];
    for level in levels.iter().skip(1) {
        coef_names.push(format!("{}_{}_vs_{}", condition, level, reference_level));
    }

    let info = DesignInfo {
        coef_names,
        reference_level: reference_level.clone(),
        levels,
    };

    check_full_rank(&design)?;
    Ok((design, info))
}

/// Create the intercept-only reduced design matrix
pub fn create_reduced_design_matrix(n_cells: usize) -> Result<Array2<f64>> {
    if n_cells == 0 {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: "Cannot build a design matrix for zero cells".to_string(),
        });
    }
    Ok(Array2::from_elem((n_cells, 1), 1.0))
}

/// Validate that the reduced design is strictly nested in the full design:
/// same rows, strictly fewer columns, every reduced column inside the full
/// column space, and both matrices full rank. Violations are fatal and are
/// raised before any per-gene fitting begins.
pub fn validate_nested_designs(full: &Array2<f64>, reduced: &Array2<f64>) -> Result<()> {
    if full.nrows() != reduced.nrows() {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: format!(
                "Full ({} rows) and reduced ({} rows) designs cover different cells",
                full.nrows(),
                reduced.nrows()
            ),
        });
    }

    if reduced.ncols() >= full.ncols() {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: format!(
                "Reduced design must have fewer coefficients than the full design \
                 ({} vs {})",
                reduced.ncols(),
                full.ncols()
            ),
        });
    }

    check_full_rank(full)?;
    check_full_rank(reduced)?;

    // Each reduced column must be reproducible from the full design:
    // project onto the full column space and require a near-zero residual.
    let n = full.nrows();
    let p = full.ncols();

    let mut xtx = vec![vec![0.0; p]; p];
    for a in 0..p {
        for b in 0..p {
            let mut s = 0.0;
            for i in 0..n {
                s += full[[i, a]] * full[[i, b]];
            }
            xtx[a][b] = s;
        }
    }

    for j in 0..reduced.ncols() {
        let mut xty = vec![0.0; p];
        for a in 0..p {
            let mut s = 0.0;
            for i in 0..n {
                s += full[[i, a]] * reduced[[i, j]];
            }
            xty[a] = s;
        }

        let coefs = solve_linear_system(&xtx, &xty).ok_or_else(|| {
            ZinbDiffError::InvalidDesignMatrix {
                reason: "Full design normal equations are singular".to_string(),
            }
        })?;

        let mut resid_sq = 0.0;
        let mut col_sq = 0.0;
        for i in 0..n {
            let mut fitted = 0.0;
            for a in 0..p {
                fitted += full[[i, a]] * coefs[a];
            }
            let r = reduced[[i, j]] - fitted;
            resid_sq += r * r;
            col_sq += reduced[[i, j]] * reduced[[i, j]];
        }

        if resid_sq > 1e-8 * col_sq.max(1.0) {
            return Err(ZinbDiffError::InvalidDesignMatrix {
                reason: format!(
                    "Reduced design column {} is not in the column space of the full design; \
                     the reduced model must be nested in the full model",
                    j
                ),
            });
        }
    }

    Ok(())
}

/// Solve a dense symmetric linear system by Gaussian elimination with
/// partial pivoting. Returns None when the system is singular.
fn solve_linear_system(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .zip(b.iter())
        .map(|(row, &bi)| {
            let mut r = row.clone();
            r.push(bi);
            r
        })
        .collect();

    for col in 0..n {
        let mut pivot = col;
        for row in (col + 1)..n {
            if aug[row][col].abs() > aug[pivot][col].abs() {
                pivot = row;
            }
        }
        if aug[pivot][col].abs() < 1e-12 {
            return None;
        }
        aug.swap(col, pivot);

        for row in (col + 1)..n {
            let factor = aug[row][col] / aug[col][col];
            for k in col..=n {
                aug[row][k] -= factor * aug[col][k];
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut sum = aug[row][n];
        for k in (row + 1)..n {
            sum -= aug[row][k] * x[k];
        }
        x[row] = sum / aug[row][row];
    }
    Some(x)
}

/// Check that a design matrix has full column rank
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let nrow = matrix.nrows();
    let ncol = matrix.ncols();

    if nrow == 0 || ncol == 0 {
        return Err(ZinbDiffError::InvalidDesignMatrix {
            reason: "Design matrix has zero rows or columns".to_string(),
        });
    }

    let rank = qr_rank(matrix);

    if rank < ncol {
        let has_zero_column = (0..ncol).any(|j| matrix.column(j).iter().all(|&v| v == 0.0));

        if has_zero_column {
            return Err(ZinbDiffError::InvalidDesignMatrix {
                reason: "the model matrix is not full rank, so the model cannot be fit as specified.\n  \
                    Levels without any cells have resulted in column(s) of zeros in the\n  \
                    model matrix."
                    .to_string(),
            });
        } else {
            return Err(ZinbDiffError::InvalidDesignMatrix {
                reason: "the model matrix is not full rank, so the model cannot be fit as specified.\n  \
                    One or more columns in the design are linear combinations of the others\n  \
                    and must be removed."
                    .to_string(),
            });
        }
    }

    Ok(())
}

/// Compute the numerical rank of a matrix using Householder QR with column pivoting.
///
/// Returns the number of diagonal elements of R whose absolute value exceeds
/// `max(nrow, ncol) * f64::EPSILON * max(|diag(R)|)`.
fn qr_rank(matrix: &Array2<f64>) -> usize {
    let nrow = matrix.nrows();
    let ncol = matrix.ncols();
    let k = nrow.min(ncol);

    let mut r = matrix.to_owned();

    let mut col_norms_sq: Vec<f64> = (0..ncol)
        .map(|j| r.column(j).iter().map(|&v| v * v).sum())
        .collect();

    let mut piv: Vec<usize> = (0..ncol).collect();

    for step in 0..k {
        // Column pivoting: find column with largest remaining norm
        let mut best_col = step;
        let mut best_norm = col_norms_sq[step];
        for j in (step + 1)..ncol {
            if col_norms_sq[j] > best_norm {
                best_norm = col_norms_sq[j];
                best_col = j;
            }
        }

        if best_col != step {
            for i in 0..nrow {
                let tmp = r[[i, step]];
                r[[i, step]] = r[[i, best_col]];
                r[[i, best_col]] = tmp;
            }
            col_norms_sq.swap(step, best_col);
            piv.swap(step, best_col);
        }

        // Householder reflection for column `step`
        let mut alpha = 0.0f64;
        for i in step..nrow {
            alpha += r[[i, step]] * r[[i, step]];
        }
        alpha = alpha.sqrt();

        if alpha < f64::EPSILON * 1e3 {
            // Remaining columns are effectively zero
            break;
        }

        if r[[step, step]] > 0.0 {
            alpha = -alpha;
        }

        let v0 = r[[step, step]] - alpha;
        r[[step, step]] = alpha;

        let mut v_norm_sq = v0 * v0;
        for i in (step + 1)..nrow {
            v_norm_sq += r[[i, step]] * r[[i, step]];
        }

        if v_norm_sq.abs() < f64::MIN_POSITIVE {
            continue;
        }

        let tau = 2.0 / v_norm_sq;

        for j in (step + 1)..ncol {
            let mut dot = v0 * r[[step, j]];
            for i in (step + 1)..nrow {
                dot += r[[i, step]] * r[[i, j]];
            }

            let scale = tau * dot;

            r[[step, j]] -= scale * v0;
            for i in (step + 1)..nrow {
                r[[i, j]] -= scale * r[[i, step]];
            }
        }

        for j in (step + 1)..ncol {
            col_norms_sq[j] -= r[[step, j]] * r[[step, j]];
            if col_norms_sq[j] < 0.0 {
                col_norms_sq[j] = 0.0;
            }
        }
    }

    let max_dim = nrow.max(ncol) as f64;
    let max_abs_diag = (0..k).map(|i| r[[i, i]].abs()).fold(0.0f64, f64::max);

    let tol = max_dim * f64::EPSILON * max_abs_diag;

    (0..k).filter(|&i| r[[i, i]].abs() > tol).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_group_metadata() -> CellMetadata {
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
        metadata
    }

    #[test]
    fn test_design_matrix_creation() {
        let metadata = two_group_metadata();
        let (design, info) = create_design_matrix(&metadata, "group").unwrap();

        assert_eq!(design.dim(), (4, 2));
        assert_eq!(info.reference_level, "ctrl");
        assert_eq!(info.coef_names[1], "group_stim_vs_ctrl");

        // Intercept everywhere; indicator only on stim cells
        assert_eq!(design.column(0).to_vec(), vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(design.column(1).to_vec(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_nested_validation_accepts_intercept_only() {
        let metadata = two_group_metadata();
        let (full, _) = create_design_matrix(&metadata, "group").unwrap();
        let reduced = create_reduced_design_matrix(4).unwrap();

        validate_nested_designs(&full, &reduced).unwrap();
    }

    #[test]
    fn test_nested_validation_rejects_non_nested() {
        let metadata = two_group_metadata();
        let (full, _) = create_design_matrix(&metadata, "group").unwrap();

        // A column outside the full design's column space
        let mut reduced = Array2::zeros((4, 1));
        reduced[[0, 0]] = 1.0;
        reduced[[1, 0]] = 2.0;
        reduced[[2, 0]] = 3.0;
        reduced[[3, 0]] = 4.0;

        assert!(validate_nested_designs(&full, &reduced).is_err());
    }

    #[test]
    fn test_nested_validation_rejects_equal_width() {
        let metadata = two_group_metadata();
        let (full, _) = create_design_matrix(&metadata, "group").unwrap();
        assert!(validate_nested_designs(&full, &full.clone()).is_err());
    }

    #[test]
    fn test_rank_deficient_rejected() {
        // Duplicate columns are rank deficient
        let mut bad = Array2::zeros((4, 2));
        for i in 0..4 {
            bad[[i, 0]] = 1.0;
            bad[[i, 1]] = 1.0;
        }
        assert!(check_full_rank(&bad).is_err());
    }
}
