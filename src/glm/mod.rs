//! Ridge-penalized negative binomial GLMs for the rlog transformation

mod design;
mod negative_binomial;
mod penalized;

pub use design::{RlogDesign, INTERCEPT_NAME};
pub use negative_binomial::{nb_log_likelihood, nb_mean, nb_variance, nb_weight, MAX_BETA, MIN_MU};
pub use penalized::{
    fit_penalized_gene, fit_penalized_glms, ridge_penalty, GeneFit, PenalizedFit, PenalizedFitParams,
    INTERCEPT_PENALTY,
};
