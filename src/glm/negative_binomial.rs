//! Negative binomial log-likelihood and IRLS weights

use statrs::function::gamma::ln_gamma;

/// Lower bound applied to the fitted mean before computing weights
pub const MIN_MU: f64 = 0.5;

/// Largest absolute coefficient (natural log scale) an IRLS iterate may take
/// before the row is treated as unstable; 30 corresponds to a ~1e13-fold change
pub const MAX_BETA: f64 = 30.0;

/// Linear predictor cap to keep `exp` finite
pub const MAX_ETA: f64 = 700.0;

/// Mean of the count given the linear predictor and normalization factor:
/// `mu = nf * exp(eta)`, floored at [`MIN_MU`]
pub fn nb_mean(eta: f64, norm_factor: f64) -> f64 {
    (norm_factor * eta.clamp(-MAX_ETA, MAX_ETA).exp()).max(MIN_MU)
}

/// Var(Y) = mu + alpha * mu^2
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log-likelihood of a single observation.
///
/// A dispersion of zero is the Poisson limit and is evaluated as such.
pub fn nb_log_likelihood(k: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 || alpha < 0.0 {
        return f64::NEG_INFINITY;
    }
    if alpha == 0.0 {
        return k * mu.ln() - mu - ln_gamma(k + 1.0);
    }

    let r = 1.0 / alpha;
    let p = alpha * mu / (1.0 + alpha * mu);

    ln_gamma(k + r) - ln_gamma(r) - ln_gamma(k + 1.0) + r * (1.0 - p).ln() + k * p.ln()
}

/// IRLS weight `mu / (1 + alpha * mu)`
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nb_mean_floor() {
        assert!((nb_mean(2.0, 1.0) - 2.0_f64.exp()).abs() < 1e-10);
        assert_eq!(nb_mean(-50.0, 1.0), MIN_MU);
    }

    #[test]
    fn test_nb_variance() {
        assert!((nb_variance(10.0, 0.1) - 20.0).abs() < 1e-10);
    }

    #[test]
    fn test_nb_log_likelihood_poisson_limit() {
        let poisson = nb_log_likelihood(5.0, 5.0, 0.0);
        let near = nb_log_likelihood(5.0, 5.0, 1e-6);
        assert!(poisson.is_finite() && poisson < 0.0);
        assert!((poisson - near).abs() < 1e-3, "{} vs {}", poisson, near);
    }

    #[test]
    fn test_nb_log_likelihood_rejects_bad_mu() {
        assert_eq!(nb_log_likelihood(3.0, 0.0, 0.1), f64::NEG_INFINITY);
    }

    #[test]
    fn test_nb_weight() {
        assert!((nb_weight(10.0, 0.1) - 5.0).abs() < 1e-10);
        assert_eq!(nb_weight(10.0, 0.0), 10.0);
    }
}
