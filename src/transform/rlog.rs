//! Regularized Log Transformation (rlog)
//!
//! Transforms count data to the log2 scale by fitting, for every gene, a negative
//! binomial GLM with one coefficient per sample and a ridge penalty on those
//! coefficients. Genes with low counts are shrunk strongly toward their mean; genes
//! with high counts end up close to `log2(normalized count)`.
//!
//! The run moves through these states, each carrying what it produced:
//! 1. `NeedsDispersion`: obtain one trend dispersion per gene
//! 2. `NeedsDesignMatrix`: blind design, or frozen design with external intercepts
//! 3. `NeedsPrior`: supplied prior variance, or quantile matching of log fold changes
//! 4. `Fitting`: penalized GLMs over the genes that are not all zero
//! 5. `Reassembly`: `X beta` per gene, zero rows back in place, intercepts added
//! 6. `Done`

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

use super::frozen::FrozenRlogParams;
use super::sparsity::{sparse_test, SparsityAdvisory, SparsityThresholds};
use crate::data::RlogDataSet;
use crate::dispersion::{DispersionEstimator, DispersionFunction, TrendDispersionEstimator, TrendFitMethod};
use crate::error::{Result, RlogError};
use crate::glm::{fit_penalized_glms, ridge_penalty, PenalizedFit, PenalizedFitParams, RlogDesign};
use crate::normalization::{estimate_size_factors, Normalization, SizeFactorMethod};
use crate::stats::{estimate_prior_variance, DEFAULT_UPPER_QUANTILE};

/// Stand-in for a non-finite frozen intercept when building normalization factors
const NON_FINITE_INTERCEPT: f64 = -10.0;

/// Pseudocount of the log fold changes used to estimate the prior variance
const LFC_PSEUDOCOUNT: f64 = 0.5;

/// Options of an rlog run
#[derive(Debug, Clone, PartialEq)]
pub struct RlogConfig {
    /// Re-estimate dispersions ignoring any supplied fit
    pub blind: bool,
    /// Per-gene log2 intercepts from a previous run; switches to the frozen design
    pub intercept: Option<Vec<f64>>,
    /// Ridge prior variance; estimated from the data when `None`
    pub beta_prior_var: Option<f64>,
    /// Trend used when dispersions are estimated
    pub fit_type: TrendFitMethod,
    /// Frozen dispersion trend, evaluated on the base means of the new data
    pub dispersion_function: Option<DispersionFunction>,
    /// Upper tail matched by the prior variance estimator
    pub upper_quantile: f64,
    pub fit: PenalizedFitParams,
    pub sparsity: SparsityThresholds,
}

impl Default for RlogConfig {
    fn default() -> Self {
        Self {
            blind: true,
            intercept: None,
            beta_prior_var: None,
            fit_type: TrendFitMethod::Parametric,
            dispersion_function: None,
            upper_quantile: DEFAULT_UPPER_QUANTILE,
            fit: PenalizedFitParams::default(),
            sparsity: SparsityThresholds::default(),
        }
    }
}

impl RlogConfig {
    /// Non-blind configuration that reapplies frozen parameters to data with the
    /// given genes
    pub fn from_frozen(params: &FrozenRlogParams, gene_ids: &[String]) -> Result<Self> {
        params.check_genes(gene_ids)?;
        Ok(Self {
            blind: false,
            intercept: Some(params.intercept_values()),
            beta_prior_var: Some(params.beta_prior_var),
            dispersion_function: Some(params.dispersion_function.clone()),
            ..Self::default()
        })
    }
}

/// Plain-matrix input of [`rlog_data`]
#[derive(Debug, Clone, Copy)]
pub struct RlogInput<'a> {
    /// Raw counts, genes x samples
    pub counts: ArrayView2<'a, f64>,
    pub normalization: &'a Normalization,
    /// Previously fitted trend dispersion per gene
    pub dispersion_fit: Option<ArrayView1<'a, f64>>,
}

/// Non-fatal findings of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RlogDiagnostics {
    /// Genes whose fit hit the iteration cap or stopped on an unstable iterate
    pub non_converged: Vec<usize>,
    /// Genes refit by the coordinate-wise optimizer
    pub fallback: Vec<usize>,
    /// IRLS iterations per gene, 0 for genes that were not fit
    pub iterations: Vec<usize>,
    pub all_zero_genes: usize,
    pub sparsity: Option<SparsityAdvisory>,
}

/// Result of [`rlog_data`]
#[derive(Debug, Clone)]
pub struct RlogOutput {
    /// Transformed values, genes x samples, log2 scale
    pub data: Array2<f64>,
    pub beta_prior_var: f64,
    /// Fitted log2 intercept per gene (`-inf` for all-zero genes); `None` when the
    /// intercepts were supplied
    pub intercepts: Option<Vec<f64>>,
    pub dispersion_fit: Array1<f64>,
    pub dispersion_function: Option<DispersionFunction>,
    pub diagnostics: RlogDiagnostics,
}

/// Result of [`rlog`] on a dataset, with labels
#[derive(Debug, Clone)]
pub struct RlogResult {
    pub data: Array2<f64>,
    pub gene_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub beta_prior_var: f64,
    pub intercepts: Option<Vec<f64>>,
    pub dispersion_fit: Array1<f64>,
    pub dispersion_function: Option<DispersionFunction>,
    pub diagnostics: RlogDiagnostics,
}

impl RlogResult {
    /// Capture what is needed to transform new samples the same way
    pub fn frozen_params(&self) -> Result<FrozenRlogParams> {
        let intercepts = self.intercepts.as_ref().ok_or_else(|| RlogError::Precondition {
            reason: "frozen parameters need fitted intercepts; run without a supplied intercept".to_string(),
        })?;
        let function = self.dispersion_function.clone().ok_or_else(|| RlogError::Precondition {
            reason: "frozen parameters need a dispersion function; estimate dispersions first".to_string(),
        })?;
        FrozenRlogParams::new(self.gene_ids.clone(), intercepts, self.beta_prior_var, function)
    }
}

/// Dispersion per gene and the trend it came from
struct DispersionStage {
    fitted: Array1<f64>,
    function: Option<DispersionFunction>,
}

/// Design plus the factors each gene is fit with
struct DesignStage {
    design: RlogDesign,
    /// Effective normalization factors, genes x samples
    factors: Array2<f64>,
    all_zero: Vec<bool>,
    nonzero: Vec<usize>,
}

enum RlogState {
    NeedsDispersion,
    NeedsDesignMatrix {
        dispersion: DispersionStage,
    },
    NeedsPrior {
        dispersion: DispersionStage,
        design: DesignStage,
    },
    Fitting {
        dispersion: DispersionStage,
        design: DesignStage,
        beta_prior_var: f64,
    },
    Reassembly {
        dispersion: DispersionStage,
        design: DesignStage,
        beta_prior_var: f64,
        fit: Option<PenalizedFit>,
    },
    Done(RlogOutput),
}

/// Read-only context shared by the states of one run
struct RlogRun<'a, 'c> {
    counts: ArrayView2<'a, f64>,
    normalization: &'a Normalization,
    supplied_fit: Option<ArrayView1<'a, f64>>,
    config: &'c RlogConfig,
    estimator: Option<&'c dyn DispersionEstimator>,
    base_means: Vec<f64>,
}

/// Transform a count matrix.
///
/// `estimator` is consulted when dispersions must be estimated: in blind mode, or when
/// neither a dispersion fit nor a frozen dispersion function is available.
///
/// # Errors
/// - `InvalidInput` for inconsistent lengths, a bad `beta_prior_var` or `upper_quantile`
/// - `Precondition` when dispersions are needed but cannot be obtained
/// - `EmptyData` when every gene is all zero and the prior variance must be estimated
/// - `FatalNumerical` when the augmented system of any gene is singular
pub fn rlog_data(
    input: RlogInput<'_>,
    config: &RlogConfig,
    estimator: Option<&dyn DispersionEstimator>,
) -> Result<RlogOutput> {
    validate_input(&input, config)?;

    let base_means: Vec<f64> = input
        .normalization
        .normalize(input.counts)
        .rows()
        .into_iter()
        .map(|row| row.mean().unwrap_or(0.0))
        .collect();

    let run = RlogRun {
        counts: input.counts,
        normalization: input.normalization,
        supplied_fit: input.dispersion_fit,
        config,
        estimator,
        base_means,
    };

    let mut state = RlogState::NeedsDispersion;
    loop {
        state = match state {
            RlogState::NeedsDispersion => RlogState::NeedsDesignMatrix {
                dispersion: run.resolve_dispersion()?,
            },
            RlogState::NeedsDesignMatrix { dispersion } => RlogState::NeedsPrior {
                design: run.build_design(),
                dispersion,
            },
            RlogState::NeedsPrior { dispersion, design } => {
                run.check_dispersion(&dispersion, &design)?;
                let beta_prior_var = run.prior_variance(&dispersion, &design)?;
                RlogState::Fitting {
                    dispersion,
                    design,
                    beta_prior_var,
                }
            }
            RlogState::Fitting {
                dispersion,
                design,
                beta_prior_var,
            } => {
                let fit = run.fit(&dispersion, &design, beta_prior_var)?;
                RlogState::Reassembly {
                    dispersion,
                    design,
                    beta_prior_var,
                    fit,
                }
            }
            RlogState::Reassembly {
                dispersion,
                design,
                beta_prior_var,
                fit,
            } => RlogState::Done(run.reassemble(dispersion, design, beta_prior_var, fit)),
            RlogState::Done(output) => return Ok(output),
        };
    }
}

fn validate_input(input: &RlogInput<'_>, config: &RlogConfig) -> Result<()> {
    let (n_genes, n_samples) = input.counts.dim();
    if n_genes == 0 || n_samples == 0 {
        return Err(RlogError::EmptyData {
            reason: format!("count matrix is {} x {}", n_genes, n_samples),
        });
    }
    if input.counts.iter().any(|&c| !(c >= 0.0 && c.is_finite())) {
        return Err(RlogError::InvalidInput {
            reason: "counts must be non-negative and finite".to_string(),
        });
    }
    input.normalization.validate(n_genes, n_samples)?;

    if let Some(intercept) = &config.intercept {
        if intercept.len() != n_genes {
            return Err(RlogError::InvalidInput {
                reason: format!(
                    "intercept has {} entries but there are {} genes",
                    intercept.len(),
                    n_genes
                ),
            });
        }
    }
    if let Some(v) = config.beta_prior_var {
        if !(v > 0.0 && v.is_finite()) {
            return Err(RlogError::InvalidInput {
                reason: format!("beta_prior_var must be positive and finite, got {}", v),
            });
        }
    }
    if let Some(fit) = &input.dispersion_fit {
        if fit.len() != n_genes {
            return Err(RlogError::InvalidInput {
                reason: format!(
                    "dispersion fit has {} entries but there are {} genes",
                    fit.len(),
                    n_genes
                ),
            });
        }
    }
    if !(config.upper_quantile > 0.0 && config.upper_quantile < 1.0) {
        return Err(RlogError::InvalidInput {
            reason: format!("upper_quantile must lie in (0, 1), got {}", config.upper_quantile),
        });
    }
    Ok(())
}

impl<'a, 'c> RlogRun<'a, 'c> {
    fn resolve_dispersion(&self) -> Result<DispersionStage> {
        let have_source = self.supplied_fit.is_some() || self.config.dispersion_function.is_some();

        if self.config.blind || !have_source {
            let estimator = self.estimator.ok_or_else(|| RlogError::Precondition {
                reason: "first estimate dispersion".to_string(),
            })?;
            let trend = estimator.estimate(self.counts, self.normalization)?;
            if trend.fitted.len() != self.counts.nrows() {
                return Err(RlogError::DimensionMismatch {
                    expected: format!("{} fitted dispersions", self.counts.nrows()),
                    got: format!("{}", trend.fitted.len()),
                });
            }
            return Ok(DispersionStage {
                fitted: trend.fitted,
                function: trend.function,
            });
        }

        if let Some(function) = &self.config.dispersion_function {
            log::info!("Using the supplied dispersion function");
            return Ok(DispersionStage {
                fitted: function.predict_all(&self.base_means),
                function: Some(function.clone()),
            });
        }

        match self.supplied_fit {
            Some(fit) => Ok(DispersionStage {
                fitted: fit.to_owned(),
                function: None,
            }),
            None => Err(RlogError::Precondition {
                reason: "first estimate dispersion".to_string(),
            }),
        }
    }

    fn build_design(&self) -> DesignStage {
        let (n_genes, n_samples) = self.counts.dim();

        let design = RlogDesign::for_samples(n_samples, self.config.intercept.is_some());
        let factors = match &self.config.intercept {
            Some(intercept) => {
                let offset: Vec<f64> = intercept
                    .iter()
                    .map(|&b| if b.is_finite() { b } else { NON_FINITE_INTERCEPT })
                    .collect();
                self.normalization
                    .with_log2_offset(&offset, n_samples)
                    .to_matrix(n_genes, n_samples)
            }
            None => self.normalization.to_matrix(n_genes, n_samples),
        };

        let all_zero: Vec<bool> = self.counts.rows().into_iter().map(|row| row.sum() == 0.0).collect();
        let nonzero: Vec<usize> = (0..n_genes).filter(|&i| !all_zero[i]).collect();

        log::debug!(
            "rlog design: {} x {} ({}), {} all-zero genes",
            design.n_samples(),
            design.n_coefs(),
            if design.has_intercept() { "blind" } else { "frozen" },
            n_genes - nonzero.len()
        );

        DesignStage {
            design,
            factors,
            all_zero,
            nonzero,
        }
    }

    fn check_dispersion(&self, dispersion: &DispersionStage, design: &DesignStage) -> Result<()> {
        if let Some(&i) = design.nonzero.iter().find(|&&i| !dispersion.fitted[i].is_finite()) {
            return Err(RlogError::Precondition {
                reason: format!(
                    "first estimate dispersion (gene {} has dispersion {})",
                    i + 1,
                    dispersion.fitted[i]
                ),
            });
        }
        Ok(())
    }

    /// Supplied value, or quantile matching over
    /// `log2(nc + 0.5) - log2(mean(nc) + 0.5)` weighted by `1 / (1/baseMean + dispersion)`
    fn prior_variance(&self, dispersion: &DispersionStage, design: &DesignStage) -> Result<f64> {
        if let Some(v) = self.config.beta_prior_var {
            return Ok(v);
        }
        if design.nonzero.is_empty() {
            return Err(RlogError::EmptyData {
                reason: "every gene has zero counts; cannot estimate the prior variance".to_string(),
            });
        }

        let n_samples = self.counts.ncols();
        let mut lfc = Vec::with_capacity(design.nonzero.len() * n_samples);
        let mut weights = Vec::with_capacity(design.nonzero.len() * n_samples);

        for &i in &design.nonzero {
            let nc: Vec<f64> = self
                .counts
                .row(i)
                .iter()
                .zip(design.factors.row(i).iter())
                .map(|(&y, &f)| y / f)
                .collect();
            let log2_mean = (nc.iter().sum::<f64>() / n_samples as f64 + LFC_PSEUDOCOUNT).log2();
            let w = 1.0 / (1.0 / self.base_means[i] + dispersion.fitted[i]);
            for v in nc {
                lfc.push((v + LFC_PSEUDOCOUNT).log2() - log2_mean);
                weights.push(w);
            }
        }

        let v = estimate_prior_variance(&lfc, &weights, self.config.upper_quantile)?;
        log::info!("Estimated beta prior variance: {:.6}", v);
        Ok(v)
    }

    fn fit(&self, dispersion: &DispersionStage, design: &DesignStage, beta_prior_var: f64) -> Result<Option<PenalizedFit>> {
        if design.nonzero.is_empty() {
            return Ok(None);
        }

        let lambda = ridge_penalty(&design.design, beta_prior_var);
        let counts = self.counts.select(Axis(0), &design.nonzero);
        let factors = design.factors.select(Axis(0), &design.nonzero);
        let alphas: Vec<f64> = design.nonzero.iter().map(|&i| dispersion.fitted[i]).collect();

        log::info!("Fitting penalized GLMs for {} genes", design.nonzero.len());
        let fit = fit_penalized_glms(
            counts.view(),
            factors.view(),
            &design.design,
            &lambda,
            &alphas,
            &self.config.fit,
        )?;
        Ok(Some(fit))
    }

    fn reassemble(
        &self,
        dispersion: DispersionStage,
        design: DesignStage,
        beta_prior_var: f64,
        fit: Option<PenalizedFit>,
    ) -> RlogOutput {
        let (n_genes, n_samples) = self.counts.dim();
        let mut data = Array2::<f64>::zeros((n_genes, n_samples));
        let mut diagnostics = RlogDiagnostics {
            all_zero_genes: design.all_zero.iter().filter(|&&z| z).count(),
            iterations: vec![0; n_genes],
            ..RlogDiagnostics::default()
        };

        let intercept_col = design.design.intercept_index();
        let mut intercepts = intercept_col.map(|_| vec![f64::NEG_INFINITY; n_genes]);

        if let Some(fit) = &fit {
            for (r, &i) in design.nonzero.iter().enumerate() {
                diagnostics.iterations[i] = fit.iterations[r];
                let coefs = fit.coefficients.row(r);
                data.row_mut(i).assign(&design.design.fitted_values(coefs));
                if let (Some(values), Some(k)) = (intercepts.as_mut(), intercept_col) {
                    values[i] = coefs[k];
                }
            }
            diagnostics.non_converged = fit.non_converged().into_iter().map(|r| design.nonzero[r]).collect();
            diagnostics.fallback = fit
                .used_fallback
                .iter()
                .enumerate()
                .filter(|(_, &f)| f)
                .map(|(r, _)| design.nonzero[r])
                .collect();
        }

        if let Some(supplied) = &self.config.intercept {
            for (mut row, &b) in data.rows_mut().into_iter().zip(supplied.iter()) {
                if b.is_finite() {
                    row += b;
                }
            }
        }

        if !diagnostics.non_converged.is_empty() {
            log::warn!(
                "{} genes did not converge in the penalized fit",
                diagnostics.non_converged.len()
            );
        }
        if !diagnostics.fallback.is_empty() {
            log::debug!("{} genes refit by the coordinate-wise optimizer", diagnostics.fallback.len());
        }

        RlogOutput {
            data,
            beta_prior_var,
            intercepts,
            dispersion_fit: dispersion.fitted,
            dispersion_function: dispersion.function,
            diagnostics,
        }
    }
}

/// Apply the rlog to a dataset, estimating dispersions with the configured trend.
///
/// See [`rlog_with_estimator`].
pub fn rlog(dds: &mut RlogDataSet, config: &RlogConfig) -> Result<RlogResult> {
    let estimator = TrendDispersionEstimator::new(config.fit_type);
    rlog_with_estimator(dds, config, &estimator)
}

/// Apply the rlog to a dataset.
///
/// Estimates ratio size factors when the dataset has no normalization, runs the
/// sparsity check on the normalized counts, transforms, and stores the dispersion fit
/// and function used back on the dataset.
pub fn rlog_with_estimator(
    dds: &mut RlogDataSet,
    config: &RlogConfig,
    estimator: &dyn DispersionEstimator,
) -> Result<RlogResult> {
    config.sparsity.validate()?;

    if !dds.has_normalization() {
        log::info!("No normalization set, estimating size factors");
        let sf = estimate_size_factors(dds.counts().counts().view(), SizeFactorMethod::Ratio)?;
        dds.set_size_factors(sf)?;
    }
    let normalization = dds.normalization().ok_or_else(|| RlogError::Precondition {
        reason: "normalization is required".to_string(),
    })?;

    let counts = dds.counts().counts();
    let sparsity = sparse_test(normalization.normalize(counts.view()).view(), &config.sparsity);
    if let Some(advisory) = &sparsity {
        log::warn!("{}", advisory.message());
    }

    log::info!(
        "Running rlog on {} genes x {} samples ({})",
        dds.n_genes(),
        dds.n_samples(),
        if config.intercept.is_some() { "frozen" } else { "blind design" }
    );

    let input = RlogInput {
        counts: counts.view(),
        normalization: &normalization,
        dispersion_fit: dds.dispersion_fit().map(|d| d.view()),
    };
    let mut output = rlog_data(input, config, Some(estimator))?;
    output.diagnostics.sparsity = sparsity;

    dds.set_dispersion_fit(output.dispersion_fit.clone())?;
    if let Some(function) = &output.dispersion_function {
        dds.set_dispersion_function(function.clone());
    }

    Ok(RlogResult {
        data: output.data,
        gene_ids: dds.counts().gene_ids().to_vec(),
        sample_ids: dds.counts().sample_ids().to_vec(),
        beta_prior_var: output.beta_prior_var,
        intercepts: output.intercepts,
        dispersion_fit: output.dispersion_fit,
        dispersion_function: output.dispersion_function,
        diagnostics: output.diagnostics,
    })
}
