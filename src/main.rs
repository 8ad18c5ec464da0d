use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use recsys_eval::{init_tracing, run, BackendKind, Loss, PipelineConfig, PipelineError, PipelineReport, SplitMode, Stage};
use tracing::info;

/// Fits a factorization model on a rating log and reports ranking metrics
/// on a held-out split.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Tab-separated log of user, item, rating and timestamp.
    dataset: Option<String>,

    /// Length of the ranked lists.
    k: Option<usize>,

    /// TOML, YAML or JSON file layered under the flags.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// als, warp or svd.
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// warp or bpr, for the warp backend.
    #[arg(long)]
    loss: Option<Loss>,

    #[arg(long)]
    separator: Option<String>,

    #[arg(long)]
    binarize: bool,

    #[arg(long)]
    min_rating: Option<f32>,

    #[arg(long, conflicts_with = "test_count")]
    test_fraction: Option<f64>,

    /// Hold out a fixed number of interactions per user.
    #[arg(long)]
    test_count: Option<usize>,

    #[arg(long)]
    min_interactions: Option<usize>,

    #[arg(short, long)]
    seed: Option<u64>,

    #[arg(long)]
    factors: Option<usize>,

    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    regularization: Option<f32>,

    #[arg(long)]
    learning_rate: Option<f32>,

    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Also print the top-k items for this user id.
    #[arg(long)]
    recommend_for: Option<String>,

    /// Show progress bars.
    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(path) = &self.dataset {
            config.dataset.path = path.clone();
        }
        if let Some(separator) = &self.separator {
            config.dataset.separator = separator.clone();
        }
        config.dataset.binarize |= self.binarize;
        if self.min_rating.is_some() {
            config.dataset.min_rating = self.min_rating;
        }

        if let Some(fraction) = self.test_fraction {
            config.split.mode = SplitMode::Fraction;
            config.split.fraction = fraction;
        }
        if let Some(count) = self.test_count {
            config.split.mode = SplitMode::Count;
            config.split.count = count;
        }
        if let Some(min) = self.min_interactions {
            config.split.min_interactions = min;
        }

        let params = &mut config.model.hyperparameters;
        if let Some(seed) = self.seed {
            config.split.seed = Some(seed);
            params.seed = Some(seed);
        }
        if let Some(backend) = self.backend {
            config.model.backend = backend;
        }
        if let Some(loss) = self.loss {
            params.loss = loss;
        }
        if let Some(factors) = self.factors {
            params.factors = factors;
        }
        if let Some(iterations) = self.iterations {
            params.iterations = iterations;
        }
        if let Some(regularization) = self.regularization {
            params.regularization = regularization;
        }
        if let Some(learning_rate) = self.learning_rate {
            params.learning_rate = learning_rate;
        }
        if let Some(threads) = self.threads {
            params.num_threads = threads;
        }
        params.verbose |= self.verbose;

        if let Some(k) = self.k {
            config.evaluation.k = k;
        }
        config.evaluation.verbose |= self.verbose;
    }
}

fn print_report<W: Write>(report: &PipelineReport, recommend_for: Option<&str>, out: &mut W) -> io::Result<()> {
    let ranking = &report.ranking;
    let k = ranking.k;
    match (ranking.precision(), ranking.recall(), ranking.ndcg()) {
        (Some(precision), Some(recall), Some(ndcg)) => {
            writeln!(out, "Precision@{}: {:.4}", k, precision)?;
            writeln!(out, "Recall@{}: {:.4}", k, recall)?;
            writeln!(out, "NDCG@{}: {:.4}", k, ndcg)?;
        }
        _ => writeln!(out, "Eligible users: 0")?,
    }
    if let Some(rmse) = report.rmse {
        writeln!(out, "RMSE: {:.4}", rmse)?;
    }
    if let (Some(user), Some(items)) = (recommend_for, &report.recommendations) {
        writeln!(out, "Top-{} for {}: {}", k, user, items.join(", "))?;
    }
    Ok(())
}

/// Config file and environment first, then the command-line overrides.
fn configure(args: &Args) -> Result<PipelineConfig, PipelineError> {
    let mut config = PipelineConfig::load(args.config.as_deref()).map_err(|e| e.at(Stage::Configure))?;
    args.apply(&mut config);
    Ok(config)
}

fn execute(args: &Args) -> Result<()> {
    let config = configure(args)?;
    info!(
        dataset = %config.dataset.path,
        backend = ?config.model.backend,
        k = config.evaluation.k,
        "starting evaluation"
    );
    let report = run(&config, args.recommend_for.as_deref())?;
    print_report(&report, args.recommend_for.as_deref(), &mut io::stdout().lock())?;
    Ok(())
}

/// Writes the failure, if any, as one `error:` line and returns the exit status.
fn outcome<W: Write>(result: Result<()>, err: &mut W) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            let message = format!("{:#}", e);
            let message: Vec<&str> = message.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
            let _ = writeln!(err, "error: {}", message.join(" "));
            1
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);
    ExitCode::from(outcome(execute(&args), &mut io::stderr()))
}
