//! The learning agent.
//!
//! The agent owns every piece of mutable learning state: the action space's
//! Q table, the set of currently awake arms, the rule partitions and the
//! per-arm observation history. It is strictly single-threaded; the only
//! blocking points are the bandit's worker submissions.
//!
//! A run proceeds in rounds. Each round pulls the awake arms `N·|A|` times
//! under the UCB policy, then partitions them: arms that only matched
//! tracking traffic are set aside, arms whose Q crossed `+noise` become
//! final rules, arms below `−noise` are pruned, and arms stuck inside the
//! noise band go to sleep while their finer-grained successors take their
//! place in the next round.

use std::collections::BTreeMap;

use camino::Utf8Path;
use indicatif::ProgressStyle;
use serde::Serialize;
use serde_json::json;
use tracing::{Level, info, span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::SynthConfig;
use crate::arms::ActionSpace;
use crate::bandit::{ControlledBandit, PullResponse};
use crate::error::{PersistError, SynthError};
use crate::grain::{Granularity, UrlVariants};
use crate::policy::UcbPolicy;
use crate::reward::{RewardTerms, SiteFeedback};
use crate::rules::{
    ArmValues, arm_patterns, subdocument_rule, write_filter_list, write_filter_list_with_values,
    write_raw_rules,
};

/// One recorded observation for an arm.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArmObservation {
    pub t: u64,
    pub q: f64,
    pub ucb: f64,
    pub reward: f64,
    pub ad_removed: f64,
    pub image_missing: f64,
    pub textnode_missing: f64,
    pub ad_count: u64,
    pub image_count: u64,
    pub textnode_count: u64,
}

/// The three observation tracks kept per arm.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArmHistory {
    pub observations: Vec<ArmObservation>,
    pub no_match: Vec<ArmObservation>,
    pub init: Vec<ArmObservation>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunReport {
    pub rounds: usize,
    pub pulls: u64,
}

pub struct Agent {
    config: SynthConfig,
    policy: UcbPolicy,
    bandit: ControlledBandit,
    space: ActionSpace,
    t: u64,
    current_arms: Vec<String>,
    final_rules: Vec<String>,
    low_q_rules: Vec<String>,
    unknown_rules: Vec<String>,
    tracking_rules: Vec<String>,
    history: BTreeMap<String, ArmHistory>,
    round_history: Vec<u64>,
    chosen_actions: Vec<String>,
}

impl Agent {
    pub fn new(config: SynthConfig, bandit: ControlledBandit, space: ActionSpace) -> Agent {
        let policy = UcbPolicy::new(config.ucb_c, config.ucb_exponent);
        Agent {
            config,
            policy,
            bandit,
            space,
            t: 1,
            current_arms: Vec::new(),
            final_rules: Vec::new(),
            low_q_rules: Vec::new(),
            unknown_rules: Vec::new(),
            tracking_rules: Vec::new(),
            history: BTreeMap::new(),
            round_history: Vec::new(),
            chosen_actions: Vec::new(),
        }
    }

    pub fn final_rules(&self) -> &[String] {
        &self.final_rules
    }

    pub fn low_q_rules(&self) -> &[String] {
        &self.low_q_rules
    }

    pub fn unknown_rules(&self) -> &[String] {
        &self.unknown_rules
    }

    pub fn tracking_rules(&self) -> &[String] {
        &self.tracking_rules
    }

    pub fn current_arms(&self) -> &[String] {
        &self.current_arms
    }

    pub fn action_space(&self) -> &ActionSpace {
        &self.space
    }

    pub fn bandit(&self) -> &ControlledBandit {
        &self.bandit
    }

    /// Clears all per-run state and restores the pristine action space.
    pub fn reset(&mut self) -> Result<(), SynthError> {
        self.t = 1;
        self.current_arms.clear();
        self.final_rules.clear();
        self.low_q_rules.clear();
        self.unknown_rules.clear();
        self.tracking_rules.clear();
        self.history.clear();
        self.round_history.clear();
        self.chosen_actions.clear();
        self.space.reset()?;
        self.bandit.reset(self.config.seed);
        Ok(())
    }

    /// Runs the full experiment: initialization, then rounds until nothing
    /// is left to refine or the round cap is hit.
    pub fn run(&mut self) -> Result<RunReport, SynthError> {
        self.current_arms = self.space.arms_to_initialize()?;
        self.remove_arms_absent_from_snapshots();
        if self.current_arms.is_empty() {
            return Err(SynthError::NoViableArms);
        }

        let mut report = RunReport::default();
        while !self.current_arms.is_empty() && report.rounds < self.config.max_rounds {
            self.initialize_new_arms()?;
            if self.current_arms.is_empty() {
                break;
            }

            report.rounds += 1;
            self.round_history.push(self.t);
            report.pulls += self.play_round(report.rounds)?;

            let tracked = self.classify_tracking();
            let (finals, pruned) = self.classify_final_and_pruned();
            let expanded = self.classify_low_q_and_expand();
            info!(
                "round {}: {} final, {} pruned, {} tracking, {} expanded successors",
                report.rounds, finals, pruned, tracked, expanded
            );
        }

        Ok(report)
    }

    /// One round of `iter_multiplier · |A|` pulls, issued to the worker
    /// pool in chunks of `chunk_threshold`. The same arm may be selected
    /// more than once within a chunk (Q only moves when results land);
    /// its updates are then serialized in completion order.
    fn play_round(&mut self, round: usize) -> Result<u64, SynthError> {
        let iterations = (self.config.iter_multiplier * self.current_arms.len()).max(1);

        let round_span = span!(Level::INFO, "round", round);
        round_span.pb_set_length(iterations as u64);
        round_span.pb_set_style(
            &ProgressStyle::default_bar()
                .template("{spinner:.green} round {span_fields} [{bar:40.cyan/blue}] {pos}/{len}")
                .expect("Error setting progress bar template")
                .progress_chars("=>-"),
        );
        let _enter = round_span.enter();

        let mut pulls = 0;
        let mut trial = 0usize;
        while trial < iterations && !self.current_arms.is_empty() {
            let take = self.config.chunk_threshold.max(1).min(iterations - trial);
            let mut batch = Vec::with_capacity(take);
            for _ in 0..take {
                trial += 1;
                let arm =
                    self.policy.choose(&mut self.space, &mut self.current_arms, trial as u64)?;
                self.chosen_actions.push(arm.clone());
                let granularity =
                    self.space.arm(&arm).map(|a| a.granularity).ok_or_else(|| {
                        SynthError::PolicyMissingQValue(format!("arm `{arm}` vanished"))
                    })?;
                batch.push((arm, granularity));
            }

            let optima = self.policy.optima(&self.space, &self.current_arms)?;
            self.bandit.set_optimal_actions(optima);

            for (arm, result) in self.bandit.pull_batch(&batch) {
                match result {
                    Ok(response) => {
                        self.observe(&arm, &response);
                        pulls += 1;
                    }
                    Err(e) => {
                        // dropped pull: no Q update, no attempt increment
                        warn!("pull for {arm} dropped: {e}");
                    }
                }
                round_span.pb_inc(1);
            }
        }
        Ok(pulls)
    }

    /// Applies one observation to the pulled arm. A pull whose rules never
    /// fired retires the arm as unknown with Q and attempts untouched;
    /// otherwise the reward moves Q.
    fn observe(&mut self, arm: &str, response: &PullResponse) {
        if !response.blocked_any(arm) {
            if let Some(state) = self.space.arm_mut(arm) {
                state.sleeping = true;
                state.unknown = true;
            }
            // a duplicate pull in the same chunk may land here twice
            if !self.unknown_rules.iter().any(|a| a == arm) {
                self.unknown_rules.push(arm.to_owned());
            }
            self.current_arms.retain(|a| a.as_str() != arm);
            self.record(arm, Track::NoMatch, response.reward, response.site_feedback);
            info!("arm {arm} produced no matches, retiring as unknown");
            return;
        }

        let Some(state) = self.space.arm_mut(arm) else { return };
        state.attempts += 1;
        // the synthetic init observation counts as the first estimate, so
        // the 1/n learning rate sees n = attempts + 1
        let gamma = self
            .config
            .gamma
            .unwrap_or(1.0 / (state.attempts + 1) as f64);
        state.q += gamma * (response.reward.reward - state.q);
        let q = state.q;
        self.record(arm, Track::Regular, response.reward, response.site_feedback);
        self.t += 1;
        info!("reward {:.3} moves q({arm}) to {q:.3}", response.reward.reward);
    }

    /// Gives every fresh arm its optimistic prior: assume the pattern
    /// blocks successfully and start the estimate at `Q0`. Does not count
    /// as an attempt and does not advance time.
    fn initialize_new_arms(&mut self) -> Result<(), SynthError> {
        let fresh: Vec<String> = self
            .current_arms
            .iter()
            .filter(|arm| {
                self.space
                    .arm(arm)
                    .is_some_and(|a| !a.q_from_prior && !a.sleeping)
            })
            .cloned()
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }

        self.space.set_explored(&fresh);
        for arm in &fresh {
            let state = self
                .space
                .arm_mut(arm)
                .ok_or_else(|| SynthError::PolicyMissingQValue(format!("arm `{arm}` missing")))?;
            state.q_from_prior = true;
            let gamma = self.config.gamma.unwrap_or(1.0 / (state.attempts + 1) as f64);
            let prior = RewardTerms {
                reward: self.config.q0,
                ad_removed: 1.0,
                page_intact: 1.0,
                ..RewardTerms::default()
            };
            state.q += gamma * (prior.reward - state.q);
            self.record(arm, Track::Init, prior, SiteFeedback::default());
        }
        info!("initialized {} fresh arms", fresh.len());
        Ok(())
    }

    /// Controlled-mode unknown detection: an arm that appears in no
    /// snapshot at its own granularity can never match and is retired
    /// before the first pull.
    fn remove_arms_absent_from_snapshots(&mut self) {
        let mut absent = Vec::new();
        for arm in &self.current_arms {
            let Some(granularity) = self.space.arm(arm).map(|a| a.granularity) else {
                continue;
            };
            let found = self.bandit.snapshots().iter().any(|s| {
                arm_patterns(arm).any(|p| s.has_url_variant(p, Some(granularity)))
            });
            if !found {
                absent.push(arm.clone());
            }
        }
        for arm in absent {
            if let Some(state) = self.space.arm_mut(&arm) {
                state.sleeping = true;
                state.unknown = true;
            }
            self.current_arms.retain(|a| a != &arm);
            info!("arm {arm} appears in no snapshot, retiring as unknown");
            self.unknown_rules.push(arm);
        }
    }

    /// Arms whose observed effect is pure tracking: the majority of pulls
    /// removed no ads and broke nothing. Checked before the Q partition so
    /// their steady `-1` rewards do not land them among the pruned.
    fn classify_tracking(&mut self) -> usize {
        let threshold = self.config.tracking_threshold;
        let matched: Vec<String> = self
            .current_arms
            .iter()
            .filter(|arm| {
                let Some(history) = self.history.get(arm.as_str()) else { return false };
                if history.observations.is_empty() {
                    return false;
                }
                majority(history.observations.iter().map(|o| o.ad_removed)) == 0.0
                    && majority(history.observations.iter().map(|o| o.image_missing)) <= threshold
                    && majority(history.observations.iter().map(|o| o.textnode_missing)) <= threshold
            })
            .cloned()
            .collect();

        for arm in &matched {
            if let Some(state) = self.space.arm_mut(arm) {
                state.sleeping = true;
            }
            self.current_arms.retain(|a| a != arm);
        }
        self.tracking_rules.extend(matched.iter().cloned());
        matched.len()
    }

    /// Positive arms become final rules; negative arms are pruned for the
    /// rest of the run. Both leave the awake set.
    fn classify_final_and_pruned(&mut self) -> (usize, usize) {
        let noise = self.config.noise_threshold;
        let mut finals = Vec::new();
        let mut pruned = Vec::new();
        for arm in &self.current_arms {
            let Some(state) = self.space.arm(arm) else { continue };
            if state.q > noise {
                finals.push(arm.clone());
            } else if state.q < -noise {
                pruned.push(arm.clone());
            }
        }

        for arm in finals.iter().chain(&pruned) {
            if let Some(state) = self.space.arm_mut(arm) {
                state.sleeping = true;
            }
            self.current_arms.retain(|a| a != arm);
        }
        self.final_rules.extend(finals.iter().cloned());
        (finals.len(), pruned.len())
    }

    /// Arms stuck inside the noise band go to sleep and hand their place
    /// to their awake successors, which form the next round's arm set.
    fn classify_low_q_and_expand(&mut self) -> usize {
        let noise = self.config.noise_threshold;
        let low: Vec<String> = self
            .current_arms
            .iter()
            .filter(|arm| {
                self.space
                    .arm(arm)
                    .is_some_and(|a| (-noise..=noise).contains(&a.q))
            })
            .cloned()
            .collect();

        let mut successors = Vec::new();
        for arm in &low {
            if let Some(state) = self.space.arm_mut(arm) {
                state.sleeping = true;
            }
            for succ in self.space.successors(arm, None) {
                let awake = self.space.arm(&succ).is_some_and(|a| !a.sleeping);
                if awake && !successors.contains(&succ) {
                    info!("expanding into successor arm {succ}");
                    successors.push(succ);
                }
            }
        }
        self.low_q_rules.extend(low.iter().cloned());

        // anything still in the awake set sleeps now; the successors are
        // the next round's arms
        for arm in &self.current_arms {
            if let Some(state) = self.space.arm_mut(arm) {
                state.sleeping = true;
            }
        }
        successors.sort();
        self.current_arms = successors;
        self.current_arms.len()
    }

    fn record(&mut self, arm: &str, track: Track, reward: RewardTerms, feedback: SiteFeedback) {
        let state = self.space.arm(arm);
        let observation = ArmObservation {
            t: self.t,
            q: state.map(|s| s.q).unwrap_or_default(),
            ucb: state.map(|s| s.last_ucb).unwrap_or_default(),
            reward: reward.reward,
            ad_removed: reward.ad_removed,
            image_missing: reward.image_missing,
            textnode_missing: reward.textnode_missing,
            ad_count: feedback.ad_count,
            image_count: feedback.image_count,
            textnode_count: feedback.textnode_count,
        };
        let history = self.history.entry(arm.to_owned()).or_default();
        match track {
            Track::Regular => history.observations.push(observation),
            Track::NoMatch => history.no_match.push(observation),
            Track::Init => history.init.push(observation),
        }
    }

    fn arm_values(&self, arm: &str) -> ArmValues {
        let average = |take: fn(&ArmObservation) -> f64| {
            let Some(history) = self.history.get(arm) else { return 0.0 };
            if history.observations.is_empty() {
                return 0.0;
            }
            history.observations.iter().map(take).sum::<f64>() / history.observations.len() as f64
        };
        ArmValues {
            q_value: self.space.arm(arm).map(|s| s.q).unwrap_or_default(),
            reward: average(|o| o.reward),
            ad_removed: average(|o| o.ad_removed),
            image_missing: average(|o| o.image_missing),
            textnode_missing: average(|o| o.textnode_missing),
            ad_count: average(|o| o.ad_count as f64),
            image_count: average(|o| o.image_count as f64),
            textnode_count: average(|o| o.textnode_count as f64),
        }
    }

    fn values_for(&self, arms: &[String]) -> BTreeMap<String, ArmValues> {
        arms.iter()
            .map(|arm| (arm.clone(), self.arm_values(arm)))
            .collect()
    }

    /// Writes the action space, the history JSON, the four rule lists and
    /// the iframe-scoped lists to `dir`.
    pub fn save(&self, dir: &Utf8Path) -> Result<(), SynthError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| PersistError::CreateDir(dir.to_owned(), e))?;

        self.space.save(dir)?;
        self.save_history(dir)?;

        let final_path = dir.join("final_rules.txt");
        write_filter_list_with_values(&final_path, &self.values_for(&self.final_rules), &[])?;
        let low_q_path = dir.join("low_q_rules.txt");
        write_filter_list_with_values(&low_q_path, &self.values_for(&self.low_q_rules), &[])?;
        let tracking_path = dir.join("tracking_rules.txt");
        write_filter_list_with_values(&tracking_path, &self.values_for(&self.tracking_rules), &[])?;

        let mut unknown: Vec<&String> = self.unknown_rules.iter().collect();
        unknown.sort();
        unknown.dedup();
        write_filter_list(&dir.join("unknown_rules.txt"), &unknown)?;

        self.save_iframe_rules(dir)?;

        if self.config.persist_feedback_cache {
            self.bandit.save_cache(dir)?;
        }
        Ok(())
    }

    fn save_history(&self, dir: &Utf8Path) -> Result<(), SynthError> {
        let gamma = match self.config.gamma {
            Some(g) => g.to_string(),
            None => "1overN".to_owned(),
        };
        let range = self.bandit.feedback_range();
        let history = json!({
            "arms": &self.history,
            "chosen_actions": &self.chosen_actions,
            "round_history": &self.round_history,
            "snapshot_choices": self.bandit.choice_history(),
            "agent_info": {
                "ucb_c": self.config.ucb_c,
                "gamma": gamma,
                "w": self.config.w,
                "q0": self.config.q0,
                "init_states": &range.feedbacks,
                "init_state_min": range.min(),
                "init_state_max": range.max(),
                "init_state_average": range.average(false),
            },
            "action_space": {
                "total_nodes": self.space.node_count(),
                "total_edges": self.space.edge_count(),
                "explored_nodes": self.space.explored_count(),
            },
        });

        let path = dir.join("history.json");
        let text = serde_json::to_string_pretty(&history)
            .map_err(|e| PersistError::Encode(path.clone(), e.to_string()))?;
        std::fs::write(&path, text)
            .map_err(|e| PersistError::FileWrite(path.clone(), e))?;
        Ok(())
    }

    /// Scripts living inside ad-flagged iframe subtrees yield
    /// `$subdocument` rules at every granularity.
    fn save_iframe_rules(&self, dir: &Utf8Path) -> Result<(), SynthError> {
        let mut urls = std::collections::BTreeSet::new();
        for snapshot in self.bandit.snapshots() {
            urls.extend(snapshot.ad_subtree_script_urls());
        }
        if urls.is_empty() {
            return Ok(());
        }

        let mut per_grain: BTreeMap<Granularity, std::collections::BTreeSet<String>> =
            BTreeMap::new();
        for url in &urls {
            let Some(variants) = UrlVariants::of(url) else { continue };
            for granularity in [Granularity::Esld, Granularity::Fqdn, Granularity::FqdnPath] {
                if let Some(value) = variants.at(granularity) {
                    per_grain
                        .entry(granularity)
                        .or_default()
                        .insert(subdocument_rule(value));
                }
            }
        }

        for (granularity, rules) in per_grain {
            let path = dir.join(format!("iframe_rules_{granularity}.txt"));
            let rules: Vec<&String> = rules.iter().collect();
            write_raw_rules(&path, &rules)?;
        }
        Ok(())
    }
}

enum Track {
    Regular,
    NoMatch,
    Init,
}

/// The most frequent value, rounded to two decimals; ties resolve to the
/// largest tied value. Empty input yields 0.
fn majority(values: impl Iterator<Item = f64>) -> f64 {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for value in values {
        *counts.entry((value * 100.0).round() as i64).or_default() += 1;
    }
    let Some(top) = counts.values().copied().max() else { return 0.0 };
    counts
        .iter()
        .filter(|(_, c)| **c == top)
        .map(|(v, _)| *v as f64 / 100.0)
        .fold(f64::MIN, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::RuleHit;
    use crate::grain::UrlVariants;
    use crate::reward::FeedbackRange;
    use crate::rules::block_rule;
    use crate::snapshot::{SiteSnapshot, SnapshotBuilder, SnapshotEdge, SnapshotNode, SnapshotNodeKind};
    use crate::trace::{ChainEdge, ChainGraph};

    fn url_node(id: &str, url: &str, ad: bool, image: bool, text: bool) -> SnapshotNode {
        SnapshotNode {
            id: id.to_owned(),
            kind: SnapshotNodeKind::Url,
            info: url.to_owned(),
            requested_url: None,
            flg_ad: ad,
            flg_image: image,
            flg_textnode: text,
            is_root: false,
        }
    }

    fn config() -> SynthConfig {
        SynthConfig {
            seed: Some(40),
            min_ad_threshold: 1,
            iter_multiplier: 4,
            ..SynthConfig::default()
        }
    }

    fn space_over(esld_arms: &[&str]) -> ActionSpace {
        let mut chain = ChainGraph::new("site.com");
        for arm in esld_arms {
            let n = chain.ensure(arm, UrlVariants::of(arm).unwrap());
            chain.add_edge_once(chain.root, n, ChainEdge::Initiator);
        }
        let mut space = ActionSpace::new(0.2);
        space.build_from_chains("https://site.com", &[chain], 0).unwrap();
        space
    }

    fn agent_over(snapshots: Vec<SiteSnapshot>, space: ActionSpace) -> Agent {
        let mut range = FeedbackRange::default();
        for s in &snapshots {
            range.push(SiteFeedback::of_snapshot(s));
        }
        let bandit = ControlledBandit::new(&config(), snapshots, range).unwrap();
        Agent::new(config(), bandit, space)
    }

    /// One ad, one hop, one arm. One round suffices and the
    /// arm graduates to the final rules.
    #[test]
    fn single_ad_single_hop_ends_in_final_rules() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        let mut agent = agent_over(vec![b.finish()], space_over(&["adserver.com"]));

        let report = agent.run().unwrap();

        assert_eq!(agent.final_rules(), ["adserver.com".to_owned()]);
        assert!(agent.low_q_rules().is_empty());
        assert!(agent.tracking_rules().is_empty());
        assert!(report.rounds >= 1);
        assert!(agent.action_space().arm("adserver.com").unwrap().q > 0.05);
    }

    /// A rule that kills ads and images alike never earns a
    /// positive Q; its refinements are explored and end up low-Q too.
    #[test]
    fn breakage_arm_descends_the_hierarchy_as_low_q() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("cdn", "https://cdn.example.com/a.js", false, false, false));
        b.node(url_node("ad", "", true, false, false));
        b.node(url_node("img", "", false, true, false));
        b.edge("cdn", "ad", SnapshotEdge::Actor);
        b.edge("cdn", "img", SnapshotEdge::Actor);
        let snapshot = b.finish();

        // the action space carries the full refinement chain
        let events_chain = {
            let mut chain = ChainGraph::new("site.com");
            let n = chain.ensure(
                "https://cdn.example.com/a.js",
                UrlVariants::of("https://cdn.example.com/a.js").unwrap(),
            );
            chain.add_edge_once(chain.root, n, ChainEdge::Initiator);
            chain
        };
        let mut space = ActionSpace::new(0.2);
        space.build_from_chains("https://site.com", &[events_chain], 0).unwrap();

        let mut agent = agent_over(vec![snapshot], space);
        agent.run().unwrap();

        assert!(agent.final_rules().is_empty());
        assert!(agent.low_q_rules().contains(&"example.com".to_owned()));
        assert!(agent.low_q_rules().contains(&"cdn.example.com".to_owned()));
        assert!(agent.low_q_rules().contains(&"cdn.example.com/a.js".to_owned()));
    }

    /// An arm matching nothing in any snapshot is retired
    /// as unknown with Q and attempts untouched.
    #[test]
    fn unmatched_arm_is_retired_as_unknown() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        let mut agent =
            agent_over(vec![b.finish()], space_over(&["adserver.com", "unused.com"]));

        agent.run().unwrap();

        assert!(agent.unknown_rules().contains(&"unused.com".to_owned()));
        let state = agent.action_space().arm("unused.com").unwrap();
        assert!(state.sleeping && state.unknown);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.q, 0.2);
    }

    /// A tracker matches requests but removes no content;
    /// the majority classifier sets it aside as tracking, not pruned.
    #[test]
    fn tracker_arm_is_classified_as_tracking() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        b.node(url_node("beacon", "https://tracker.com/beacon/p.js", false, false, false));
        let mut agent =
            agent_over(vec![b.finish()], space_over(&["adserver.com", "tracker.com"]));

        agent.run().unwrap();

        assert!(agent.tracking_rules().contains(&"tracker.com".to_owned()));
        assert!(agent.final_rules().contains(&"adserver.com".to_owned()));
        assert!(!agent.low_q_rules().contains(&"tracker.com".to_owned()));
    }

    /// Every arm ends up in exactly one partition.
    #[test]
    fn partitions_are_mutually_exclusive() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        b.node(url_node("beacon", "https://tracker.com/beacon/p.js", false, false, false));
        let mut agent = agent_over(
            vec![b.finish()],
            space_over(&["adserver.com", "tracker.com", "unused.com"]),
        );
        agent.run().unwrap();

        let buckets = [
            agent.current_arms(),
            agent.final_rules(),
            agent.low_q_rules(),
            agent.tracking_rules(),
            agent.unknown_rules(),
        ];
        for arm in ["adserver.com", "tracker.com", "unused.com"] {
            let memberships = buckets
                .iter()
                .filter(|b| b.contains(&arm.to_owned()))
                .count();
            assert!(memberships <= 1, "{arm} appears in {memberships} partitions");
        }
    }

    /// Q-value recurrence: with γ = 1/n and rewards pinned at 1, Q after k
    /// real observations is 1 − (1 − Q0)/(k + 1), the init prior counting
    /// as the first observation.
    #[test]
    fn q_converges_monotonically_under_unit_rewards() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        let mut agent = agent_over(vec![b.finish()], space_over(&["adserver.com"]));

        agent.current_arms = vec!["adserver.com".to_owned()];
        agent.initialize_new_arms().unwrap();
        assert_eq!(agent.action_space().arm("adserver.com").unwrap().q, 0.2);

        let response = |reward: RewardTerms| PullResponse {
            action: "adserver.com".to_owned(),
            snapshot: "s1".to_owned(),
            site_feedback: SiteFeedback { ad_count: 0, image_count: 1, textnode_count: 0 },
            reward,
            matched: BTreeMap::from([(
                block_rule("adserver.com"),
                vec![RuleHit {
                    rule: block_rule("adserver.com"),
                    url_blocked: "https://adserver.com/ads.js".to_owned(),
                }],
            )]),
            is_optimal: true,
        };

        let unit = RewardTerms { reward: 1.0, ad_removed: 1.0, page_intact: 1.0, ..Default::default() };
        let mut previous = 0.2;
        for k in 1..=6u32 {
            agent.observe("adserver.com", &response(unit));
            let q = agent.action_space().arm("adserver.com").unwrap().q;
            let expected = 1.0 - (1.0 - 0.2) / (k + 1) as f64;
            assert!((q - expected).abs() < 1e-9, "k={k}: q={q}, expected {expected}");
            assert!(q > previous);
            previous = q;
        }
    }

    #[test]
    fn majority_prefers_most_frequent_then_largest() {
        assert_eq!(majority([0.0, 0.0, 1.0].into_iter()), 0.0);
        assert_eq!(majority([0.0, 1.0].into_iter()), 1.0);
        assert_eq!(majority(std::iter::empty()), 0.0);
        assert_eq!(majority([0.049, 0.051].into_iter()), 0.05);
    }

    #[test]
    fn save_writes_all_artifacts() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        let mut agent = agent_over(vec![b.finish()], space_over(&["adserver.com"]));
        agent.run().unwrap();

        let dir = std::env::temp_dir().join("rulewright-agent-save");
        let _ = std::fs::remove_dir_all(&dir);
        let dir = camino::Utf8PathBuf::from_path_buf(dir).unwrap();
        agent.save(&dir).unwrap();

        for file in [
            "action_space.graphml",
            "action_values.csv",
            "history.json",
            "final_rules.txt",
            "low_q_rules.txt",
            "tracking_rules.txt",
            "unknown_rules.txt",
        ] {
            assert!(dir.join(file).exists(), "missing {file}");
        }

        let final_list = std::fs::read_to_string(dir.join("final_rules.txt")).unwrap();
        assert!(final_list.contains("||adserver.com^"));

        let history: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("history.json")).unwrap())
                .unwrap();
        assert!(history["arms"]["adserver.com"]["observations"].is_array());
        assert_eq!(history["agent_info"]["gamma"], "1overN");
    }

    #[test]
    fn reset_clears_per_run_state() {
        let mut b = SnapshotBuilder::new("s1");
        b.node(url_node("ad", "https://adserver.com/ads.js", true, false, false));
        b.node(url_node("img", "https://site.com/img.png", false, true, false));
        let mut agent = agent_over(vec![b.finish()], space_over(&["adserver.com"]));
        agent.run().unwrap();
        assert!(!agent.final_rules().is_empty());

        agent.reset().unwrap();
        assert!(agent.final_rules().is_empty());
        assert!(agent.current_arms().is_empty());
        let state = agent.action_space().arm("adserver.com").unwrap();
        assert_eq!(state.q, 0.2);
        assert!(!state.sleeping);
    }
}
