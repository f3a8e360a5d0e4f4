//! ReDoS Sentinel CLI
//!
//! Entry point for the long-running services (detector, coordinator, probe
//! generator) and the offline train/eval utilities.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use redos_sentinel::corpus::collate;
use redos_sentinel::model::train::{test_step, train_step, Adam, StepStats};
use redos_sentinel::{
    adversary, coordinator, detector, AdversaryConfig, CoordinatorConfig, Corpus, DetectorConfig,
    ModelConfig, ScoringModel, SnapshotDir,
};

/// Version information
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "redos-sentinel")]
#[command(about = "Adaptive ReDoS detection with online retraining")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "SENTINEL_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Score request lines from the proxy and warn origin servers
    Detector(DetectorArgs),
    /// Collect labeled reports, retrain, and publish model snapshots
    Coordinator(CoordinatorArgs),
    /// Generate adversarial probes against the published model
    Adversary(AdversaryArgs),
    /// Train a model offline from a corpus directory
    Train(TrainArgs),
    /// Evaluate the published model on a corpus directory
    Eval(EvalArgs),
}

#[derive(clap::Args, Debug)]
struct DetectorArgs {
    /// Address for the frame-scoring listener
    #[arg(long, default_value = "0.0.0.0:9001", env = "SENTINEL_DETECTOR_ADDR")]
    listen_addr: String,

    /// Origin-server port that accepts warnings
    #[arg(long, default_value = "9002", env = "SENTINEL_WARNING_PORT")]
    warning_port: u16,

    /// Maximum request lines scored per forward pass
    #[arg(long, default_value = "32", env = "SENTINEL_BATCH_SIZE")]
    batch_size: usize,

    /// Directory watched for model snapshots
    #[arg(long, default_value = "build/model", env = "SENTINEL_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,
}

impl DetectorArgs {
    fn to_config(&self) -> DetectorConfig {
        DetectorConfig {
            listen_addr: self.listen_addr.clone(),
            warning_port: self.warning_port,
            batch_size: self.batch_size.max(1),
            snapshot_dir: self.snapshot_dir.clone(),
            ..Default::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct CoordinatorArgs {
    /// Address for the report listener
    #[arg(long, default_value = "0.0.0.0:9004", env = "SENTINEL_REPORT_ADDR")]
    report_listen_addr: String,

    /// Directory snapshots are published to
    #[arg(long, default_value = "build/model", env = "SENTINEL_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Probe generator to notify after each retraining round
    #[arg(long, env = "SENTINEL_ADVERSARY_ADDR")]
    adversary_addr: Option<String>,

    /// Spill accepted reports to this directory as corpus files
    #[arg(long, env = "SENTINEL_SPILL_DIR")]
    corpus_spill_dir: Option<PathBuf>,

    /// Payloads shorter than this many bytes are labeled benign
    #[arg(long, default_value = "1000", env = "SENTINEL_BENIGN_THRESHOLD")]
    benign_size_threshold: usize,

    /// Retraining stops once recent-window accuracy reaches this
    #[arg(long, default_value = "0.99", env = "SENTINEL_ACCURACY_THRESHOLD")]
    accuracy_threshold: f64,
}

impl CoordinatorArgs {
    fn to_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            report_listen_addr: self.report_listen_addr.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
            adversary_addr: self.adversary_addr.clone(),
            corpus_spill_dir: self.corpus_spill_dir.clone(),
            benign_size_threshold: self.benign_size_threshold,
            accuracy_threshold: self.accuracy_threshold,
            ..Default::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct AdversaryArgs {
    /// Address for model-ready notices from the coordinator
    #[arg(long, default_value = "0.0.0.0:9101", env = "SENTINEL_ADVERSARY_LISTEN")]
    listen_addr: String,

    /// Replay client notified with each new probe's index
    #[arg(long, default_value = "127.0.0.1:9100", env = "SENTINEL_REPLAY_ADDR")]
    replay_addr: String,

    /// Directory the current model snapshot is loaded from
    #[arg(long, default_value = "build/model", env = "SENTINEL_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Directory probe artifacts are written to
    #[arg(long, default_value = "build/adversary", env = "SENTINEL_ARTIFACT_DIR")]
    artifact_dir: PathBuf,

    /// Maximum gradient-descent iterations per search
    #[arg(long, default_value = "500", env = "SENTINEL_SEARCH_BUDGET")]
    budget: usize,
}

impl AdversaryArgs {
    fn to_config(&self) -> AdversaryConfig {
        AdversaryConfig {
            listen_addr: self.listen_addr.clone(),
            replay_addr: self.replay_addr.clone(),
            snapshot_dir: self.snapshot_dir.clone(),
            artifact_dir: self.artifact_dir.clone(),
            budget: self.budget.max(1),
            ..Default::default()
        }
    }
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Directory of `<seq>-<label>.txt` corpus files
    #[arg(long, env = "SENTINEL_CORPUS_DIR")]
    corpus_dir: PathBuf,

    /// Directory the trained snapshot is published to
    #[arg(long, default_value = "build/model", env = "SENTINEL_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Optimization steps
    #[arg(long, default_value = "200")]
    steps: usize,

    /// Samples per balanced batch
    #[arg(long, default_value = "16")]
    batch_size: usize,

    /// RNG seed for initialization and sampling
    #[arg(long, default_value = "0")]
    seed: u64,
}

#[derive(clap::Args, Debug)]
struct EvalArgs {
    /// Directory of `<seq>-<label>.txt` corpus files
    #[arg(long, env = "SENTINEL_CORPUS_DIR")]
    corpus_dir: PathBuf,

    /// Directory the snapshot is loaded from
    #[arg(long, default_value = "build/model", env = "SENTINEL_SNAPSHOT_DIR")]
    snapshot_dir: PathBuf,

    /// Samples per evaluation batch
    #[arg(long, default_value = "32")]
    batch_size: usize,
}

fn run_train(args: &TrainArgs) -> Result<()> {
    let corpus = Corpus::from_dir(&args.corpus_dir)?;
    if corpus.is_empty() {
        bail!("corpus directory {} is empty", args.corpus_dir.display());
    }
    info!(samples = corpus.len(), "loaded training corpus");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut model = ScoringModel::new(ModelConfig::default(), &mut rng);
    let mut optimizer = Adam::new(0.01, 5e-4);
    let kernel = model.config().kernel_size;

    for step in 1..=args.steps {
        let drawn = corpus.balanced_batch(args.batch_size, &mut rng);
        let stats = train_step(&mut model, &collate(&drawn, kernel), &mut optimizer);
        if step % 20 == 0 || step == args.steps {
            info!(step, loss = stats.loss, accuracy = stats.accuracy(), "training");
        }
    }

    SnapshotDir::new(&args.snapshot_dir).publish(&model)
}

fn run_eval(args: &EvalArgs) -> Result<()> {
    let corpus = Corpus::from_dir(&args.corpus_dir)?;
    if corpus.is_empty() {
        bail!("corpus directory {} is empty", args.corpus_dir.display());
    }
    let model = SnapshotDir::new(&args.snapshot_dir)
        .load()
        .context("loading published snapshot")?;
    let kernel = model.config().kernel_size;

    let mut total: Option<StepStats> = None;
    for chunk in corpus.chunked(args.batch_size.max(1)) {
        let stats = test_step(&model, &collate(&chunk, kernel));
        match &mut total {
            Some(existing) => existing.merge(&stats),
            None => total = Some(stats),
        }
    }

    if let Some(stats) = total {
        info!(
            samples = corpus.len(),
            accuracy = stats.accuracy(),
            benign = %format!("{}/{}", stats.benign_correct, stats.benign_total),
            malicious = %format!("{}/{}", stats.malicious_correct, stats.malicious_total),
            "evaluation complete"
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!(
                    "{}={}",
                    env!("CARGO_CRATE_NAME"),
                    log_level
                ))
            }),
        )
        .init();

    info!(version = VERSION, "starting");

    match &cli.command {
        Command::Detector(args) => detector::run_service(&args.to_config()),
        Command::Coordinator(args) => coordinator::run_service(&args.to_config()),
        Command::Adversary(args) => adversary::run_service(&args.to_config()),
        Command::Train(args) => run_train(args),
        Command::Eval(args) => run_eval(args),
    }
}
