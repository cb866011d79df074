//! Size factor normalization for single-cell count data

mod size_factors;

pub use size_factors::{
    estimate_size_factors, pooled_size_factors, poscounts_size_factors, PoolingParams,
    SizeFactorMethod,
};
