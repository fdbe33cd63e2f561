#![deny(
    unsafe_code,
    clippy::panic,
)]

//! Bandit-driven synthesis of per-site URL-blocking filter rules.
//!
//! Given a directory of recorded site snapshots (dependency graphs of a
//! page load, with ads, images and text nodes annotated) and the request
//! traces behind them, the crate builds a hierarchical action space of
//! candidate patterns, explores it with a UCB bandit against the snapshots,
//! and emits the patterns whose estimated value clears a noise threshold as
//! filter rules.
//!
//! The flow: [`arms::ActionSpace::build`] turns traces into the candidate
//! hierarchy, [`bandit::ControlledBandit`] scores rule sets by simulating
//! them on snapshots, and [`agent::Agent::run`] drives rounds of pulls,
//! refining coarse patterns into finer ones until nothing is left to
//! refine. [`Experiment`] wires the three together for the CLI.

pub mod agent;
pub mod arms;
pub mod bandit;
pub mod error;
pub mod grain;
pub mod graphml;
pub mod matcher;
pub mod policy;
pub mod reward;
pub mod rules;
pub mod snapshot;
pub mod trace;

use std::time::Duration;

use camino::Utf8PathBuf;
use tracing::info;

use crate::agent::Agent;
use crate::arms::ActionSpace;
use crate::bandit::ControlledBandit;
use crate::error::SynthError;
use crate::reward::RewardKind;

/// Every tunable of a synthesis run. There is no process-wide state: one
/// configuration object is threaded through the agent, bandit and policy.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub site_url: String,
    pub snapshot_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    /// Breakage tolerance: rewards drop to zero once `page_intact` falls
    /// below this.
    pub w: f64,
    pub ucb_c: f64,
    pub ucb_exponent: f64,
    /// Fixed learning rate; `None` means 1/n.
    pub gamma: Option<f64>,
    /// Optimistic prior for unexplored arms.
    pub q0: f64,
    /// Snapshots required before a run is considered viable.
    pub init_iterations: usize,
    /// Pulls per round are this multiple of the awake arm count.
    pub iter_multiplier: usize,
    pub noise_threshold: f64,
    pub tracking_threshold: f64,
    pub min_ad_threshold: u64,
    pub max_no_ad_streak: usize,
    pub chunk_threshold: usize,
    pub max_rounds: usize,
    pub seed: Option<u64>,
    pub reward_kind: RewardKind,
    pub informed_snapshot_choice: bool,
    pub matcher_cache_capacity: usize,
    pub pull_timeout: Duration,
    pub persist_feedback_cache: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            snapshot_dir: Utf8PathBuf::new(),
            output_dir: Utf8PathBuf::from("out"),
            w: 0.9,
            ucb_c: 1.4,
            ucb_exponent: 2.0,
            gamma: None,
            q0: 0.2,
            init_iterations: 10,
            iter_multiplier: 100,
            noise_threshold: 0.05,
            tracking_threshold: 0.05,
            min_ad_threshold: 2,
            max_no_ad_streak: 6,
            chunk_threshold: 2,
            max_rounds: 10,
            seed: None,
            reward_kind: RewardKind::ByCases,
            informed_snapshot_choice: false,
            matcher_cache_capacity: 256,
            pull_timeout: Duration::from_secs(30),
            persist_feedback_cache: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExperimentSummary {
    pub rounds: usize,
    pub pulls: u64,
    pub final_rules: Vec<String>,
    pub low_q_rules: usize,
    pub tracking_rules: usize,
    pub unknown_rules: usize,
}

/// A complete synthesis run over one snapshot directory.
pub struct Experiment {
    config: SynthConfig,
}

impl Experiment {
    pub fn new(config: SynthConfig) -> Experiment {
        Experiment { config }
    }

    /// Builds the action space from the traces next to the snapshots, runs
    /// the round loop, and saves all artifacts to the output directory.
    /// Nothing is written unless the round loop completed.
    pub fn run(&self) -> Result<ExperimentSummary, SynthError> {
        let config = &self.config;

        let traces = trace_files(&config.snapshot_dir);
        info!("found {} request traces in {}", traces.len(), config.snapshot_dir);

        let mut space = ActionSpace::new(config.q0);
        space.build(&config.site_url, &traces, 0)?;

        let mut bandit = ControlledBandit::prepare(config, &config.snapshot_dir)?;
        if bandit.snapshots().len() < config.init_iterations {
            return Err(SynthError::InvalidSiteFeedback(format!(
                "only {} valid snapshots, {} required",
                bandit.snapshots().len(),
                config.init_iterations
            )));
        }
        if config.persist_feedback_cache {
            bandit.load_cache(&config.output_dir);
        }

        let mut agent = Agent::new(config.clone(), bandit, space);
        let report = agent.run()?;
        agent.save(&config.output_dir)?;

        Ok(ExperimentSummary {
            rounds: report.rounds,
            pulls: report.pulls,
            final_rules: agent.final_rules().to_vec(),
            low_q_rules: agent.low_q_rules().len(),
            tracking_rules: agent.tracking_rules().len(),
            unknown_rules: agent.unknown_rules().len(),
        })
    }
}

fn trace_files(dir: &Utf8PathBuf) -> Vec<Utf8PathBuf> {
    let mut files: Vec<Utf8PathBuf> = ["*.json", "*.jsonl"]
        .iter()
        .flat_map(|pattern| {
            glob::glob(dir.join(pattern).as_str())
                .into_iter()
                .flatten()
                .filter_map(Result::ok)
                .filter_map(|p| Utf8PathBuf::from_path_buf(p).ok())
        })
        .collect();
    files.sort();
    files
}
