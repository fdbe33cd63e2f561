use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use console::style;
use tracing::error;
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use rulewright::error::SynthError;
use rulewright::reward::RewardKind;
use rulewright::{Experiment, SynthConfig};

#[derive(Parser)]
#[command(name = "rulewright", version, about = "Synthesize per-site filter rules from recorded snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the synthesis loop against a snapshot directory.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Site the snapshots were recorded from.
    #[arg(long = "site-url")]
    site_url: String,

    /// Directory holding `*.graphml` snapshots and `*.json` traces.
    #[arg(long)]
    snapshots: Utf8PathBuf,

    #[arg(long = "output-dir", default_value = "out")]
    output_dir: Utf8PathBuf,

    /// Breakage tolerance in (0, 1); closer to 1 avoids breakage harder.
    #[arg(long, default_value_t = 0.9)]
    w: f64,

    /// UCB confidence weight.
    #[arg(long = "ucb-c", default_value_t = 1.4)]
    ucb_c: f64,

    /// Learning rate: a float, or `1/N` for the attempt-count schedule.
    #[arg(long)]
    gamma: Option<String>,

    /// Valid snapshots required for the run.
    #[arg(long = "init-iters", default_value_t = 10)]
    init_iters: usize,

    /// Pulls per round, as a multiple of the awake arm count.
    #[arg(long = "iter-multiplier", default_value_t = 100)]
    iter_multiplier: usize,

    /// Optimistic prior for unexplored arms.
    #[arg(long, default_value_t = 0.2)]
    q0: f64,

    #[arg(long = "reward-func", default_value = "by-cases")]
    reward_func: String,

    /// Seed for reproducible snapshot selection.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Worker-pool chunk size for expensive pulls.
    #[arg(long = "chunk-threshold", default_value_t = 2)]
    chunk_threshold: usize,

    #[arg(long = "max-rounds", default_value_t = 10)]
    max_rounds: usize,

    /// Per-pull timeout in seconds.
    #[arg(long = "pull-timeout", default_value_t = 30)]
    pull_timeout: u64,

    /// Prefer snapshots that contain the pulled arm.
    #[arg(long = "informed-snapshots", default_value_t = false)]
    informed_snapshots: bool,

    /// Persist the pull cache into the output directory.
    #[arg(long = "persist-cache", default_value_t = false)]
    persist_cache: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args),
    }
}

fn run(args: RunArgs) -> ExitCode {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("invalid arguments: {message}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.output_dir) {
        eprintln!("cannot create output directory {}: {e}", config.output_dir);
        return ExitCode::from(2);
    }
    if let Err(message) = init_logging(&config.output_dir, &args.log_level) {
        eprintln!("cannot set up logging: {message}");
        return ExitCode::from(5);
    }

    match Experiment::new(config).run() {
        Ok(summary) => {
            println!(
                "{} {} final rules after {} rounds and {} pulls ({} low-Q, {} tracking, {} unknown)",
                style("done:").green().bold(),
                summary.final_rules.len(),
                summary.rounds,
                summary.pulls,
                summary.low_q_rules,
                summary.tracking_rules,
                summary.unknown_rules,
            );
            for rule in &summary.final_rules {
                println!("  {}", style(rule).cyan());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("experiment failed: {e}");
            eprintln!("rulewright: {e}");
            ExitCode::from(match e {
                SynthError::InvalidSiteFeedback(_) | SynthError::NoValidSnapshots(_) => 3,
                SynthError::NoViableArms => 4,
                _ => 5,
            })
        }
    }
}

fn build_config(args: &RunArgs) -> Result<SynthConfig, String> {
    if args.w <= 0.0 || args.w > 1.0 {
        return Err(format!("--w must be within (0, 1], got {}", args.w));
    }
    if !(0.0..=1.0).contains(&args.q0) {
        return Err(format!("--q0 must be within [0, 1], got {}", args.q0));
    }

    let gamma = match args.gamma.as_deref() {
        None => None,
        Some(raw) if raw.eq_ignore_ascii_case("1/n") || raw.eq_ignore_ascii_case("1overn") => None,
        Some(raw) => Some(
            raw.parse::<f64>()
                .map_err(|_| format!("--gamma must be a float or `1/N`, got `{raw}`"))?,
        ),
    };

    let reward_kind = RewardKind::parse(&args.reward_func)
        .ok_or_else(|| format!("unknown reward function `{}`", args.reward_func))?;

    Ok(SynthConfig {
        site_url: args.site_url.clone(),
        snapshot_dir: args.snapshots.clone(),
        output_dir: args.output_dir.clone(),
        w: args.w,
        ucb_c: args.ucb_c,
        gamma,
        q0: args.q0,
        init_iterations: args.init_iters,
        iter_multiplier: args.iter_multiplier,
        seed: args.seed,
        reward_kind,
        chunk_threshold: args.chunk_threshold,
        max_rounds: args.max_rounds,
        pull_timeout: Duration::from_secs(args.pull_timeout),
        informed_snapshot_choice: args.informed_snapshots,
        persist_feedback_cache: args.persist_cache,
        ..SynthConfig::default()
    })
}

fn init_logging(output_dir: &Utf8PathBuf, level: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(level).map_err(|e| e.to_string())?;

    let log_path = output_dir.join("log.log");
    let file = std::fs::File::create(&log_path).map_err(|e| format!("{log_path}: {e}"))?;

    let indicatif_layer = IndicatifLayer::new();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| e.to_string())
}
