//! Statistical testing for differential expression

mod fdr;
mod lrt;
mod wald;

pub use fdr::benjamini_hochberg;
pub use lrt::{likelihood_ratio_test, LrtTest};
pub use wald::{two_sided_t_pvalue, wald_test, WaldTest};

/// Which per-gene test drives the results table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMethod {
    /// Likelihood ratio test of the nested designs against chi-square
    Lrt,
    /// Wald test of the tested coefficient against an effective-df t
    Wald,
}
