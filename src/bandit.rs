//! The controlled bandit.
//!
//! Instead of driving a live browser, a pull simulates the effect of a rule
//! set on one recorded snapshot: a breadth-first walk from the snapshot
//! root refuses to descend through blocked URLs, counts the surviving ads,
//! images and text nodes, and a second pass settles iframe subtrees and
//! content whose ancestors were cut away. Snapshot selection owns the
//! seeded RNG and therefore always runs on the owner thread; the expensive
//! graph walks are dispatched to a worker pool in bounded chunks, mirroring
//! the executor used for build tasks elsewhere in this codebase's lineage.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use crossbeam_channel::unbounded;
use petgraph::Direction;
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{Dfs, EdgeRef, Reversed};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::SynthConfig;
use crate::error::{PersistError, PullError, SynthError};
use crate::grain::Granularity;
use crate::matcher::{CompiledRules, MatcherCache};
use crate::reward::{FeedbackRange, RewardKind, RewardTerms, SiteFeedback};
use crate::rules::{block_rule, arm_patterns, canonical_rules, rules_for_arm};
use crate::snapshot::{SiteSnapshot, SnapshotEdge};

const FEEDBACK_CACHE_FILE: &str = "site_feedback_cache";

/// One rule hit observed during a simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule: String,
    pub url_blocked: String,
}

/// The part of a pull that only depends on `(snapshot, rule set)` and is
/// therefore cacheable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEval {
    pub site_feedback: SiteFeedback,
    pub matched: BTreeMap<String, Vec<RuleHit>>,
}

#[derive(Debug, Clone)]
pub struct PullResponse {
    pub action: String,
    pub snapshot: String,
    pub site_feedback: SiteFeedback,
    pub reward: RewardTerms,
    pub matched: BTreeMap<String, Vec<RuleHit>>,
    pub is_optimal: bool,
}

impl PullResponse {
    /// Whether any of the arm's own rules produced a hit. An arm whose
    /// rules never fire is unknown to this site.
    pub fn blocked_any(&self, arm: &str) -> bool {
        arm_patterns(arm)
            .any(|p| self.matched.get(&block_rule(p)).is_some_and(|hits| !hits.is_empty()))
    }
}

/// Loads every `*.graphml` snapshot under `dir` in bounded parallel
/// chunks, skipping invalid ones. Aborts once `max_no_ad_streak`
/// consecutive snapshots show no ads.
pub fn gather_snapshots(
    dir: &Utf8Path,
    config: &SynthConfig,
) -> Result<(Vec<SiteSnapshot>, FeedbackRange), SynthError> {
    let pattern = dir.join("*.graphml");
    let mut files: Vec<_> = glob::glob(pattern.as_str())
        .map_err(|e| SynthError::InvalidSiteFeedback(format!("bad snapshot dir: {e}")))?
        .filter_map(Result::ok)
        .filter_map(|p| camino::Utf8PathBuf::from_path_buf(p).ok())
        .collect();
    files.sort();

    let mut snapshots = Vec::new();
    let mut range = FeedbackRange::default();
    let mut no_ad_streak = 0usize;

    for chunk in files.chunks(config.chunk_threshold.max(1)) {
        let (sender, receiver) = unbounded();
        rayon::scope(|s| {
            for (offset, file) in chunk.iter().enumerate() {
                let sender = sender.clone();
                s.spawn(move |_| {
                    let loaded = SiteSnapshot::load(file);
                    sender.send((offset, loaded)).expect("receiver outlives the scope");
                });
            }
        });
        drop(sender);

        let mut loaded: Vec<_> = receiver.iter().collect();
        loaded.sort_by_key(|(offset, _)| *offset);

        for (offset, result) in loaded {
            let snapshot = match result {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("skipping snapshot {}: {e}", chunk[offset]);
                    continue;
                }
            };
            if snapshot.ad_count() == 0 {
                no_ad_streak += 1;
                warn!("snapshot {} shows no ads ({} in a row)", snapshot.name(), no_ad_streak);
                if no_ad_streak >= config.max_no_ad_streak {
                    return Err(SynthError::InvalidSiteFeedback(format!(
                        "{no_ad_streak} consecutive snapshots without ads"
                    )));
                }
                continue;
            }
            no_ad_streak = 0;
            if !snapshot.is_valid() {
                warn!("skipping snapshot {}: no page content", snapshot.name());
                continue;
            }
            range.push(SiteFeedback::of_snapshot(&snapshot));
            snapshots.push(snapshot);
        }
    }

    if snapshots.is_empty() {
        return Err(SynthError::NoValidSnapshots(dir.to_owned()));
    }
    snapshots.sort_by(|a, b| a.name().cmp(b.name()));
    info!("loaded {} valid snapshots", snapshots.len());
    Ok((snapshots, range))
}

pub struct ControlledBandit {
    snapshots: Vec<SiteSnapshot>,
    baseline: SiteFeedback,
    feedback_range: FeedbackRange,
    w: f64,
    reward_kind: RewardKind,
    chunk_threshold: usize,
    pull_timeout: Duration,
    informed_snapshot_choice: bool,
    rng: StdRng,
    matcher_cache: MatcherCache,
    eval_cache: BTreeMap<String, CachedEval>,
    choice_history: Vec<String>,
    optimal: Vec<String>,
}

impl ControlledBandit {
    /// Builds a bandit over an already-gathered snapshot set. The baseline
    /// is the ad-bearing average of the per-snapshot feedback.
    pub fn new(
        config: &SynthConfig,
        snapshots: Vec<SiteSnapshot>,
        feedback_range: FeedbackRange,
    ) -> Result<ControlledBandit, SynthError> {
        let baseline = feedback_range
            .average(true)
            .ok_or_else(|| SynthError::InvalidSiteFeedback("no ad-bearing feedback".into()))?;
        if baseline.ad_count < config.min_ad_threshold {
            return Err(SynthError::InvalidSiteFeedback(format!(
                "baseline has {} ads, need at least {}",
                baseline.ad_count, config.min_ad_threshold
            )));
        }

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!("baseline feedback: {baseline}");
        Ok(ControlledBandit {
            snapshots,
            baseline,
            feedback_range,
            w: config.w,
            reward_kind: config.reward_kind,
            chunk_threshold: config.chunk_threshold.max(1),
            pull_timeout: config.pull_timeout,
            informed_snapshot_choice: config.informed_snapshot_choice,
            rng,
            matcher_cache: MatcherCache::new(config.matcher_cache_capacity),
            eval_cache: BTreeMap::new(),
            choice_history: Vec::new(),
            optimal: Vec::new(),
        })
    }

    /// Gathers snapshots from `dir` and builds the bandit over them.
    pub fn prepare(config: &SynthConfig, dir: &Utf8Path) -> Result<ControlledBandit, SynthError> {
        let (snapshots, range) = gather_snapshots(dir, config)?;
        Self::new(config, snapshots, range)
    }

    pub fn baseline(&self) -> SiteFeedback {
        self.baseline
    }

    pub fn feedback_range(&self) -> &FeedbackRange {
        &self.feedback_range
    }

    pub fn snapshots(&self) -> &[SiteSnapshot] {
        &self.snapshots
    }

    pub fn choice_history(&self) -> &[String] {
        &self.choice_history
    }

    pub fn set_optimal_actions(&mut self, actions: Vec<String>) {
        self.optimal = actions;
    }

    pub fn reward(&self, feedback: SiteFeedback) -> RewardTerms {
        self.reward_kind.calculate(self.baseline, feedback, self.w)
    }

    pub fn reset(&mut self, seed: Option<u64>) {
        self.choice_history.clear();
        self.optimal.clear();
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
    }

    /// Selects the snapshot for a pull. Runs on the owner thread: the RNG
    /// must not be touched by workers. Informed mode restricts the draw to
    /// snapshots containing any of the arms at their own granularity and
    /// falls back to the full set when none qualifies.
    fn choose_snapshot(&mut self, arms: &[(&str, Granularity)]) -> usize {
        let index = if !self.informed_snapshot_choice {
            self.rng.gen_range(0..self.snapshots.len())
        } else {
            let candidates: Vec<usize> = self
                .snapshots
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    arms.iter().any(|(arm, g)| {
                        arm_patterns(arm).any(|p| s.has_url_variant(p, Some(*g)))
                    })
                })
                .map(|(i, _)| i)
                .collect();
            match candidates.is_empty() {
                true => self.rng.gen_range(0..self.snapshots.len()),
                false => candidates[self.rng.gen_range(0..candidates.len())],
            }
        };
        self.choice_history.push(self.snapshots[index].name().to_owned());
        index
    }

    fn response_from(&self, arm: &str, snapshot: &str, cached: &CachedEval) -> PullResponse {
        PullResponse {
            action: arm.to_owned(),
            snapshot: snapshot.to_owned(),
            site_feedback: cached.site_feedback,
            reward: self.reward(cached.site_feedback),
            matched: cached.matched.clone(),
            is_optimal: self.optimal.iter().any(|a| a == arm),
        }
    }

    /// Evaluates one arm against a freshly chosen snapshot on the owner
    /// thread. The chunked [`Self::pull_batch`] is preferred wherever more
    /// than one arm is pending.
    pub fn pull(&mut self, arm: &str, granularity: Granularity) -> Result<PullResponse, PullError> {
        let mut results = self.pull_batch(&[(arm.to_owned(), granularity)]);
        match results.pop() {
            Some((_, result)) => result,
            None => Err(PullError::Failed(arm.to_owned(), "empty batch".into())),
        }
    }

    /// Evaluates a batch of arms in chunks of `chunk_threshold`. Snapshot
    /// selection, rule compilation and cache lookups happen on the owner
    /// thread; simulations run on the worker pool and results are applied
    /// in completion order. A timed-out chunk sets a cancellation flag so
    /// unstarted simulations bail out immediately.
    pub fn pull_batch(
        &mut self,
        arms: &[(String, Granularity)],
    ) -> Vec<(String, Result<PullResponse, PullError>)> {
        struct Job {
            arm: String,
            snapshot_index: usize,
            cache_key: String,
            rules: Arc<CompiledRules>,
        }

        let mut results = Vec::with_capacity(arms.len());

        for chunk in arms.chunks(self.chunk_threshold) {
            let mut jobs: Vec<Job> = Vec::new();

            for (arm, granularity) in chunk {
                let rule_strings = rules_for_arm(arm);
                let snapshot_index = self.choose_snapshot(&[(arm.as_str(), *granularity)]);
                let snapshot_name = self.snapshots[snapshot_index].name().to_owned();
                let cache_key = format!("{snapshot_name}|{}", canonical_rules(&rule_strings));

                if let Some(cached) = self.eval_cache.get(&cache_key) {
                    info!("cache hit for {arm} on {snapshot_name}");
                    results.push((arm.clone(), Ok(self.response_from(arm, &snapshot_name, cached))));
                    continue;
                }

                match self.matcher_cache.get_or_compile(&rule_strings) {
                    Ok(rules) => jobs.push(Job {
                        arm: arm.clone(),
                        snapshot_index,
                        cache_key,
                        rules,
                    }),
                    Err(e) => {
                        // a rule set that fails to compile is a no-match pull
                        warn!("matcher failure for {arm}: {e}");
                        let cached = CachedEval {
                            site_feedback: self.baseline,
                            matched: BTreeMap::new(),
                        };
                        results.push((arm.clone(), Ok(self.response_from(arm, &snapshot_name, &cached))));
                    }
                }
            }

            if jobs.is_empty() {
                continue;
            }

            let cancel = AtomicBool::new(false);
            let deadline = Instant::now() + self.pull_timeout;
            let (sender, receiver) = unbounded::<(usize, Result<CachedEval, PullError>)>();
            let snapshots = &self.snapshots;
            let baseline = self.baseline;

            let mut completed: Vec<(usize, Result<CachedEval, PullError>)> =
                Vec::with_capacity(jobs.len());

            rayon::scope(|s| {
                for (index, job) in jobs.iter().enumerate() {
                    let sender = sender.clone();
                    let cancel = &cancel;
                    let rules = job.rules.clone();
                    let snapshot = &snapshots[job.snapshot_index];
                    let arm = job.arm.clone();
                    s.spawn(move |_| {
                        if cancel.load(Ordering::Relaxed) {
                            let _ = sender.send((
                                index,
                                Err(PullError::Failed(arm, "cancelled".into())),
                            ));
                            return;
                        }
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| simulate(snapshot, &rules, baseline)))
                                .map_err(|panic| {
                                    let message = panic
                                        .downcast_ref::<&str>()
                                        .map(|s| (*s).to_owned())
                                        .or_else(|| panic.downcast_ref::<String>().cloned())
                                        .unwrap_or_else(|| "unknown panic".to_owned());
                                    PullError::Panicked(arm, message)
                                });
                        let _ = sender.send((index, outcome));
                    });
                }
                drop(sender);

                let mut pending = jobs.len();
                while pending > 0 {
                    match receiver.recv_deadline(deadline) {
                        Ok(message) => {
                            completed.push(message);
                            pending -= 1;
                        }
                        Err(_) => {
                            // timed out: stop unstarted work, then drain
                            cancel.store(true, Ordering::Relaxed);
                            for message in receiver.iter() {
                                completed.push(message);
                                pending -= 1;
                                if pending == 0 {
                                    break;
                                }
                            }
                        }
                    }
                }
            });

            let timed_out = Instant::now() >= deadline;
            for (index, outcome) in completed {
                let job = &jobs[index];
                let snapshot_name = self.snapshots[job.snapshot_index].name().to_owned();
                match outcome {
                    Ok(eval) => {
                        let response = self.response_from(&job.arm, &snapshot_name, &eval);
                        self.eval_cache.insert(job.cache_key.clone(), eval);
                        results.push((job.arm.clone(), Ok(response)));
                    }
                    Err(PullError::Failed(arm, reason)) if timed_out && reason == "cancelled" => {
                        results.push((arm.clone(), Err(PullError::Timeout(arm))));
                    }
                    Err(e) => results.push((job.arm.clone(), Err(e))),
                }
            }
        }

        results
    }

    /// Persists the pull cache to `dir` (ciborium-encoded).
    pub fn save_cache(&self, dir: &Utf8Path) -> Result<(), PersistError> {
        let path = dir.join(FEEDBACK_CACHE_FILE);
        let mut buffer = Vec::new();
        ciborium::into_writer(&self.eval_cache, &mut buffer)
            .map_err(|e| PersistError::Encode(path.clone(), e.to_string()))?;
        std::fs::write(&path, buffer).map_err(|e| PersistError::FileWrite(path.clone(), e))
    }

    /// Loads a previously persisted pull cache, if present.
    pub fn load_cache(&mut self, dir: &Utf8Path) {
        let path = dir.join(FEEDBACK_CACHE_FILE);
        let Ok(bytes) = std::fs::read(&path) else { return };
        match ciborium::from_reader(bytes.as_slice()) {
            Ok(cache) => {
                self.eval_cache = cache;
                info!("loaded {} cached pulls", self.eval_cache.len());
            }
            Err(e) => warn!("could not read pull cache at {path}: {e}"),
        }
    }
}

/// Whether any node in `blocked` is an ancestor of `node`.
fn blocked_ancestor(snapshot: &SiteSnapshot, node: NodeIndex, blocked: &HashSet<NodeIndex>) -> bool {
    let graph = snapshot.graph();
    let mut dfs = Dfs::new(Reversed(graph), node);
    while let Some(n) = dfs.next(Reversed(graph)) {
        if n != node && blocked.contains(&n) {
            return true;
        }
    }
    false
}

/// Simulates applying `rules` to `snapshot`.
///
/// Breadth-first from the root: blocked URL nodes stop the walk, dom edges
/// into nodes with non-dom provenance are deferred to that provenance, and
/// iframes are settled in a second pass. Content counted during the walk is
/// subsequently discounted when a blocked ancestor turns up. Finally the
/// controlled-mode correction restores any content class the rule set
/// demonstrably did not touch.
pub fn simulate(
    snapshot: &SiteSnapshot,
    rules: &CompiledRules,
    baseline: SiteFeedback,
) -> CachedEval {
    let graph = snapshot.graph();
    let root = snapshot.root();

    let mut feedback = SiteFeedback::default();
    let mut matched: BTreeMap<String, Vec<RuleHit>> = BTreeMap::new();
    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut blocked: HashSet<NodeIndex> = HashSet::new();
    let mut iframe_nodes: Vec<NodeIndex> = Vec::new();
    let mut images_counted: Vec<NodeIndex> = Vec::new();
    let mut texts_counted: Vec<NodeIndex> = Vec::new();

    let mut queue: VecDeque<NodeIndex> = VecDeque::new();
    queue.push_back(root);

    while let Some(current) = queue.pop_front() {
        if visited.contains(&current) {
            continue;
        }
        let node = &graph[current];

        let mut is_blocked = false;
        if current != root
            && let Some(url) = node.url()
        {
            let outcome = rules.should_block(url);
            if outcome.blocked {
                for rule in outcome.matched {
                    let hit = RuleHit { rule: rule.clone(), url_blocked: url.to_owned() };
                    let hits = matched.entry(rule).or_default();
                    if !hits.contains(&hit) {
                        hits.push(hit);
                    }
                }
                blocked.insert(current);
                is_blocked = true;
            }
        }

        if !is_blocked {
            if current != root {
                if node.is_iframe() {
                    iframe_nodes.push(current);
                } else {
                    if node.flg_ad {
                        feedback.ad_count += 1;
                    }
                    if node.flg_image {
                        feedback.image_count += 1;
                        images_counted.push(current);
                    }
                    if node.flg_textnode {
                        feedback.textnode_count += 1;
                        texts_counted.push(current);
                    }
                }
            }

            for edge in graph.edges_directed(current, Direction::Outgoing) {
                let next = edge.target();
                if visited.contains(&next) {
                    continue;
                }
                // follow non-dom edges primarily: a dom edge only carries
                // the walk when the child has no other provenance
                if *edge.weight() == SnapshotEdge::Dom {
                    if !snapshot.has_non_dom_predecessor(next) {
                        queue.push_back(next);
                    }
                } else {
                    queue.push_back(next);
                }
            }
        }

        visited.insert(current);
    }

    // iframes were not counted during the walk; they either turn out
    // blocked through an ancestor or contribute now
    for node in dedup(iframe_nodes) {
        if blocked_ancestor(snapshot, node, &blocked) {
            blocked.insert(node);
        } else {
            let weight = &graph[node];
            if weight.flg_ad {
                feedback.ad_count += 1;
            }
            if weight.flg_image {
                feedback.image_count += 1;
            }
            if weight.flg_textnode {
                feedback.textnode_count += 1;
            }
        }
    }

    // content counted during the walk is discounted when cut off
    if !blocked.is_empty() {
        for node in dedup(images_counted) {
            if blocked_ancestor(snapshot, node, &blocked) {
                blocked.insert(node);
                feedback.image_count = feedback.image_count.saturating_sub(1);
            }
        }
        for node in dedup(texts_counted) {
            if blocked_ancestor(snapshot, node, &blocked) {
                blocked.insert(node);
                feedback.textnode_count = feedback.textnode_count.saturating_sub(1);
            }
        }
    }

    // partition everything blocked or unreached by content class
    let mut ads_gone = false;
    let mut images_gone = false;
    let mut texts_gone = false;
    for n in graph.node_indices() {
        if !blocked.contains(&n) && visited.contains(&n) {
            continue;
        }
        let node = &graph[n];
        if node.flg_ad {
            ads_gone = true;
        } else if node.flg_image {
            images_gone = true;
        } else if node.flg_textnode {
            texts_gone = true;
        }
    }

    // controlled-mode correction: a class the rules never touched must not
    // register a change against the baseline
    if !ads_gone {
        feedback.ad_count = baseline.ad_count;
    }
    if !images_gone {
        feedback.image_count = baseline.image_count;
    }
    if !texts_gone {
        feedback.textnode_count = baseline.textnode_count;
    }

    CachedEval { site_feedback: feedback, matched }
}

fn dedup(nodes: Vec<NodeIndex>) -> Vec<NodeIndex> {
    let mut seen = HashSet::new();
    nodes.into_iter().filter(|n| seen.insert(*n)).collect()
}
