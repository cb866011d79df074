//! Weighted generalized linear model fitting for negative binomial data

mod design;
pub(crate) mod fitting;
mod negative_binomial;

pub use design::{
    check_full_rank, create_design_matrix, create_reduced_design_matrix, validate_nested_designs,
    DesignInfo,
};
pub use fitting::{fit_glms, fit_design, fit_single_gene, GlmFit, GlmFitParams, GlmFitResult};
pub use negative_binomial::{
    nb_irls_weight, nb_log_likelihood, nb_mean, nb_variance, nb_weighted_log_likelihood,
    nb_zero_prob, DEFAULT_MIN_MU, MAX_BETA, MAX_ETA,
};
