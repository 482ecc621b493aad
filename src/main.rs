//! rust_rlog command-line interface

use clap::Parser;
use log::{info, warn, LevelFilter};

use rust_rlog::cli::{Cli, Commands};
use rust_rlog::io::{
    align_to_ids, load_frozen_params, read_count_matrix, read_named_vector, save_frozen_params, write_matrix,
};
use rust_rlog::prelude::*;

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Commands::Rlog {
            counts,
            size_factors,
            dispersions,
            frozen,
            beta_prior_var,
            blind,
            fit_type,
            upper_quantile,
            threads,
            output,
            save_frozen,
        } => run_rlog(RlogArgs {
            counts,
            size_factors,
            dispersions,
            frozen,
            beta_prior_var,
            blind,
            fit_type,
            upper_quantile,
            threads,
            output,
            save_frozen,
        }),
        Commands::Sparsity {
            counts,
            size_factors,
            p,
            t1,
            t2,
        } => run_sparsity(&counts, size_factors.as_deref(), SparsityThresholds { p, t1, t2 }),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

struct RlogArgs {
    counts: String,
    size_factors: Option<String>,
    dispersions: Option<String>,
    frozen: Option<String>,
    beta_prior_var: Option<f64>,
    blind: Option<bool>,
    fit_type: String,
    upper_quantile: f64,
    threads: Option<usize>,
    output: String,
    save_frozen: Option<String>,
}

fn load_dataset(counts_path: &str, size_factors_path: Option<&str>) -> Result<RlogDataSet> {
    info!("Loading count matrix from: {}", counts_path);
    let counts = read_count_matrix(counts_path)?;
    let mut dds = RlogDataSet::new(counts);

    if let Some(path) = size_factors_path {
        info!("Loading size factors from: {}", path);
        let pairs = read_named_vector(path)?;
        let sf = align_to_ids(&pairs, dds.counts().sample_ids(), "size factors")?;
        dds.set_size_factors(sf)?;
    }
    Ok(dds)
}

fn run_rlog(args: RlogArgs) -> Result<()> {
    let mut dds = load_dataset(&args.counts, args.size_factors.as_deref())?;

    if let Some(path) = &args.dispersions {
        info!("Loading dispersions from: {}", path);
        let pairs = read_named_vector(path)?;
        let disp = align_to_ids(&pairs, dds.counts().gene_ids(), "dispersions")?;
        dds.set_dispersion_fit(disp)?;
    }

    let mut config = match &args.frozen {
        Some(path) => {
            info!("Loading frozen parameters from: {}", path);
            let params = load_frozen_params(path)?;
            RlogConfig::from_frozen(&params, dds.counts().gene_ids())?
        }
        None => RlogConfig::default(),
    };
    if let Some(blind) = args.blind {
        config.blind = blind;
    }
    if args.beta_prior_var.is_some() {
        config.beta_prior_var = args.beta_prior_var;
    }
    config.fit_type = args.fit_type.parse()?;
    config.upper_quantile = args.upper_quantile;
    config.fit.threads = args.threads;

    let result = rlog(&mut dds, &config)?;

    info!("Beta prior variance: {:.6}", result.beta_prior_var);
    if !result.diagnostics.non_converged.is_empty() {
        warn!(
            "{} genes did not converge; their last iterate was kept",
            result.diagnostics.non_converged.len()
        );
    }

    info!("Writing rlog-transformed data to: {}", args.output);
    write_matrix(&args.output, &result.gene_ids, &result.sample_ids, &result.data)?;

    if let Some(path) = &args.save_frozen {
        info!("Writing frozen parameters to: {}", path);
        save_frozen_params(path, &result.frozen_params()?)?;
    }

    info!("Done! rlog transformation complete.");
    Ok(())
}

fn run_sparsity(counts_path: &str, size_factors_path: Option<&str>, thresholds: SparsityThresholds) -> Result<()> {
    thresholds.validate()?;
    let mut dds = load_dataset(counts_path, size_factors_path)?;

    if !dds.has_normalization() {
        info!("Estimating size factors...");
        let sf = estimate_size_factors(dds.counts().counts(), SizeFactorMethod::Ratio)?;
        dds.set_size_factors(sf)?;
    }
    let normalized = dds.normalized_counts().ok_or_else(|| RlogError::Precondition {
        reason: "normalization is required".to_string(),
    })?;

    match sparse_test(normalized.view(), &thresholds) {
        Some(advisory) => println!("{}", advisory.message()),
        None => println!("No sparsity problem detected."),
    }
    Ok(())
}
