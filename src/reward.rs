//! Feedback observations and the reward function.

use serde::{Deserialize, Serialize};

use crate::snapshot::SiteSnapshot;

/// What a page showed: how many ads, images and text nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteFeedback {
    pub ad_count: u64,
    pub image_count: u64,
    pub textnode_count: u64,
}

impl SiteFeedback {
    pub fn of_snapshot(snapshot: &SiteSnapshot) -> SiteFeedback {
        SiteFeedback {
            ad_count: snapshot.ad_count(),
            image_count: snapshot.image_count(),
            textnode_count: snapshot.textnode_count(),
        }
    }
}

impl std::fmt::Display for SiteFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ads {}, images {}, textnodes {}",
            self.ad_count, self.image_count, self.textnode_count
        )
    }
}

/// Baseline observations across the initial snapshot set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackRange {
    pub feedbacks: Vec<SiteFeedback>,
}

impl FeedbackRange {
    pub fn push(&mut self, feedback: SiteFeedback) {
        self.feedbacks.push(feedback);
    }

    pub fn len(&self) -> usize {
        self.feedbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feedbacks.is_empty()
    }

    fn fold(&self, pick: impl Fn(u64, u64) -> u64) -> Option<SiteFeedback> {
        self.feedbacks.iter().copied().reduce(|acc, f| SiteFeedback {
            ad_count: pick(acc.ad_count, f.ad_count),
            image_count: pick(acc.image_count, f.image_count),
            textnode_count: pick(acc.textnode_count, f.textnode_count),
        })
    }

    pub fn min(&self) -> Option<SiteFeedback> {
        self.fold(u64::min)
    }

    pub fn max(&self) -> Option<SiteFeedback> {
        self.fold(u64::max)
    }

    /// Per-counter rounded average; with `ignore_no_ads` the average is
    /// restricted to observations that saw at least one ad.
    pub fn average(&self, ignore_no_ads: bool) -> Option<SiteFeedback> {
        let picked: Vec<&SiteFeedback> = self
            .feedbacks
            .iter()
            .filter(|f| !ignore_no_ads || f.ad_count > 0)
            .collect();
        if picked.is_empty() {
            return None;
        }
        let n = picked.len() as f64;
        let avg = |take: fn(&SiteFeedback) -> u64| {
            (picked.iter().map(|f| take(f) as f64).sum::<f64>() / n).round() as u64
        };
        Some(SiteFeedback {
            ad_count: avg(|f| f.ad_count),
            image_count: avg(|f| f.image_count),
            textnode_count: avg(|f| f.textnode_count),
        })
    }
}

/// The scalar reward plus its diagnostic terms, all in `[0, 1]` except
/// `reward` itself which spans `[-1, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardTerms {
    pub reward: f64,
    pub ad_removed: f64,
    pub image_missing: f64,
    pub textnode_missing: f64,
    pub breakage: f64,
    pub page_intact: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RewardKind {
    /// Case split: no ads removed is always -1, breakage beyond the
    /// tolerance is 0, otherwise the reward is the removal ratio.
    #[default]
    ByCases,
}

impl RewardKind {
    pub fn parse(name: &str) -> Option<RewardKind> {
        match name {
            "by-cases" => Some(RewardKind::ByCases),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RewardKind::ByCases => "by-cases",
        }
    }

    pub fn calculate(self, baseline: SiteFeedback, observed: SiteFeedback, w: f64) -> RewardTerms {
        let mut terms = calculate_terms(baseline, observed);
        terms.breakage = (terms.image_missing + terms.textnode_missing) / 2.0;
        terms.page_intact = 1.0 - terms.breakage;

        terms.reward = match self {
            RewardKind::ByCases => {
                if terms.ad_removed <= 0.0 {
                    -1.0
                } else if terms.page_intact < w {
                    0.0
                } else {
                    terms.ad_removed
                }
            }
        };
        terms
    }
}

fn calculate_terms(baseline: SiteFeedback, observed: SiteFeedback) -> RewardTerms {
    // more content than the baseline never counts against a rule
    let missing = |base: u64, seen: u64| {
        if base > 0 {
            (base.saturating_sub(seen) as f64 / base as f64).clamp(0.0, 1.0)
        } else {
            0.0
        }
    };

    RewardTerms {
        ad_removed: missing(baseline.ad_count, observed.ad_count),
        image_missing: missing(baseline.image_count, observed.image_count),
        textnode_missing: missing(baseline.textnode_count, observed.textnode_count),
        ..RewardTerms::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(ads: u64, images: u64, texts: u64) -> SiteFeedback {
        SiteFeedback { ad_count: ads, image_count: images, textnode_count: texts }
    }

    #[test]
    fn full_removal_without_breakage_scores_the_ratio() {
        let terms = RewardKind::ByCases.calculate(feedback(4, 10, 10), feedback(0, 10, 10), 0.9);
        assert_eq!(terms.ad_removed, 1.0);
        assert_eq!(terms.breakage, 0.0);
        assert_eq!(terms.page_intact, 1.0);
        assert_eq!(terms.reward, 1.0);
    }

    #[test]
    fn breakage_beyond_tolerance_zeroes_the_reward() {
        // all ads gone, but all images gone too: intact 0.5 < 0.9
        let terms = RewardKind::ByCases.calculate(feedback(2, 6, 0), feedback(0, 0, 0), 0.9);
        assert_eq!(terms.ad_removed, 1.0);
        assert_eq!(terms.image_missing, 1.0);
        assert_eq!(terms.page_intact, 0.5);
        assert_eq!(terms.reward, 0.0);
    }

    #[test]
    fn no_ads_in_baseline_means_negative_reward() {
        let terms = RewardKind::ByCases.calculate(feedback(0, 5, 5), feedback(0, 5, 5), 0.9);
        assert_eq!(terms.ad_removed, 0.0);
        assert_eq!(terms.reward, -1.0);
    }

    #[test]
    fn surplus_content_does_not_count_as_missing() {
        let terms = RewardKind::ByCases.calculate(feedback(3, 4, 4), feedback(1, 9, 6), 0.9);
        assert_eq!(terms.image_missing, 0.0);
        assert_eq!(terms.textnode_missing, 0.0);
        assert!(terms.reward > 0.0);
    }

    #[test]
    fn reward_stays_in_range() {
        for (b, o) in [
            (feedback(0, 0, 0), feedback(0, 0, 0)),
            (feedback(9, 9, 9), feedback(0, 0, 0)),
            (feedback(1, 1, 1), feedback(5, 5, 5)),
        ] {
            let terms = RewardKind::ByCases.calculate(b, o, 0.9);
            assert!((-1.0..=1.0).contains(&terms.reward));
            assert_eq!(terms.page_intact, 1.0 - terms.breakage);
        }
    }

    #[test]
    fn range_statistics() {
        let mut range = FeedbackRange::default();
        range.push(feedback(0, 4, 6));
        range.push(feedback(4, 8, 10));
        range.push(feedback(2, 6, 8));

        assert_eq!(range.min().unwrap(), feedback(0, 4, 6));
        assert_eq!(range.max().unwrap(), feedback(4, 8, 10));
        assert_eq!(range.average(false).unwrap(), feedback(2, 6, 8));
        // restricted to observations with ads
        assert_eq!(range.average(true).unwrap(), feedback(3, 7, 9));
    }
}
