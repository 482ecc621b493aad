//! Command-line interface for rust_rlog

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rust_rlog")]
#[command(version)]
#[command(about = "Regularized log transformation of RNA-seq counts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply the regularized log transformation (rlog)
    #[command(
        long_about = "Apply the regularized log transformation.\n\n\
            Fits a ridge-penalized negative binomial GLM per gene and reports the fitted\n\
            values on the log2 scale. Low-count genes are shrunk toward their mean, so\n\
            sample-to-sample differences are not dominated by Poisson noise.",
        after_long_help = "\
Examples:
  # Blind transform, size factors estimated from the data
  rust_rlog rlog -c counts.csv -o rlog.tsv

  # Keep the fitted parameters for later samples
  rust_rlog rlog -c counts.csv -o rlog.tsv --save-frozen rlog_params.json

  # Transform new samples with frozen parameters
  rust_rlog rlog -c new_counts.csv --frozen rlog_params.json -o new_rlog.tsv

  # Supplied size factors and dispersions, not blind
  rust_rlog rlog -c counts.csv -s sf.csv --dispersions disp.csv --blind false"
    )]
    Rlog {
        /// Path to count matrix CSV file
        #[arg(short, long,
            long_help = "Path to count matrix CSV file.\n\
                Format: first column = gene IDs, remaining columns = raw counts per sample.\n\
                Supports both CSV (comma) and TSV (tab) delimiters (auto-detected).")]
        counts: String,

        /// Size factors file (sample id, value)
        #[arg(short, long,
            long_help = "Two-column file of sample id and size factor.\n\
                Without it, size factors are estimated by the median-of-ratios method.")]
        size_factors: Option<String>,

        /// Fitted dispersions file (gene id, value)
        #[arg(long, value_name = "FILE")]
        dispersions: Option<String>,

        /// Frozen parameters (JSON) from a previous run
        #[arg(long, value_name = "FILE",
            long_help = "Frozen parameters written by --save-frozen.\n\
                Reuses their intercepts, prior variance and dispersion trend, so new\n\
                samples are transformed on the same scale as the original ones.")]
        frozen: Option<String>,

        /// Ridge prior variance (estimated when omitted)
        #[arg(long, value_name = "VAR")]
        beta_prior_var: Option<f64>,

        /// Re-estimate dispersions ignoring supplied ones [default: true, false with --frozen]
        #[arg(long, value_name = "BOOL")]
        blind: Option<bool>,

        /// Dispersion trend fit [default: parametric]
        #[arg(long, default_value = "parametric",
            long_help = "Dispersion-mean trend fitting method.\n\
                parametric: asympt_disp + extra_pois / mean (default)\n\
                local:      Local regression\n\
                mean:       Mean dispersion")]
        fit_type: String,

        /// Upper tail matched by the prior variance estimator [default: 0.05]
        #[arg(long, default_value_t = 0.05)]
        upper_quantile: f64,

        /// Number of worker threads for the per-gene fits
        #[arg(long)]
        threads: Option<usize>,

        /// Output file path [default: rlog_transformed.tsv]
        #[arg(short, long, default_value = "rlog_transformed.tsv")]
        output: String,

        /// Write frozen parameters (JSON) for later runs
        #[arg(long, value_name = "FILE")]
        save_frozen: Option<String>,
    },

    /// Check whether counts are too concentrated in single samples for rlog
    #[command(
        after_long_help = "\
Examples:
  rust_rlog sparsity -c counts.csv
  rust_rlog sparsity -c counts.csv -s sf.csv -p 0.95 --t1 500"
    )]
    Sparsity {
        /// Path to count matrix CSV file
        #[arg(short, long)]
        counts: String,

        /// Size factors file (sample id, value)
        #[arg(short, long)]
        size_factors: Option<String>,

        /// Share of a gene's reads in one sample that flags the gene [default: 0.9]
        #[arg(short, long, default_value_t = 0.9)]
        p: f64,

        /// Minimum row sum for a gene to be considered [default: 100]
        #[arg(long, default_value_t = 100.0)]
        t1: f64,

        /// Flagged fraction above which a warning is given [default: 0.1]
        #[arg(long, default_value_t = 0.1)]
        t2: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rlog_args() {
        let cli = Cli::try_parse_from([
            "rust_rlog", "rlog", "-c", "counts.csv", "--blind", "false", "--threads", "4", "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Rlog { counts, blind, threads, fit_type, .. } => {
                assert_eq!(counts, "counts.csv");
                assert_eq!(blind, Some(false));
                assert_eq!(threads, Some(4));
                assert_eq!(fit_type, "parametric");
            }
            _ => panic!("expected the rlog subcommand"),
        }
    }

    #[test]
    fn test_parse_sparsity_defaults() {
        let cli = Cli::try_parse_from(["rust_rlog", "sparsity", "-c", "counts.csv"]).unwrap();
        match cli.command {
            Commands::Sparsity { p, t1, t2, .. } => {
                assert_eq!((p, t1, t2), (0.9, 100.0, 0.1));
            }
            _ => panic!("expected the sparsity subcommand"),
        }
    }
}
