//! UCB arm selection.

use tracing::debug;

use crate::arms::ActionSpace;
use crate::error::SynthError;

/// Upper-confidence-bound policy over the currently awake arms. Stateless
/// apart from its parameters; the per-arm bookkeeping lives in the action
/// space.
#[derive(Debug, Clone, Copy)]
pub struct UcbPolicy {
    /// Confidence weight on the exploration term.
    pub c: f64,
    /// Root applied to the exploration ratio.
    pub exponent: f64,
}

impl Default for UcbPolicy {
    fn default() -> Self {
        Self { c: 1.0, exponent: 2.0 }
    }
}

impl UcbPolicy {
    pub fn new(c: f64, exponent: f64) -> Self {
        Self { c, exponent }
    }

    fn exploration(&self, trial: u64, attempts: u64) -> f64 {
        let ratio = ((trial + 1) as f64).ln() / (attempts + 1) as f64;
        self.c * ratio.powf(1.0 / self.exponent)
    }

    /// Scores every arm in `arms` and returns the one with the highest UCB
    /// value. Arms are sorted first so ties break on the lexicographically
    /// smallest pattern, which keeps runs reproducible.
    pub fn choose(
        &self,
        space: &mut ActionSpace,
        arms: &mut [String],
        trial: u64,
    ) -> Result<String, SynthError> {
        if arms.is_empty() {
            return Err(SynthError::PolicyMissingQValue("no arms to choose from".into()));
        }
        arms.sort();

        let mut best: Option<(usize, f64)> = None;
        for (i, arm) in arms.iter().enumerate() {
            let state = space.arm_mut(arm).ok_or_else(|| {
                SynthError::PolicyMissingQValue(format!("arm `{arm}` has no Q value"))
            })?;
            let ucb = state.q + self.exploration(trial, state.attempts);
            state.last_ucb = ucb;
            debug!("ucb({arm}) = {ucb:.4} at trial {trial}");

            if best.is_none_or(|(_, top)| ucb > top) {
                best = Some((i, ucb));
            }
        }

        let (index, _) = best.expect("non-empty arm list always yields a best arm");
        Ok(arms[index].clone())
    }

    /// All arms whose Q value equals the current maximum.
    pub fn optima(&self, space: &ActionSpace, arms: &[String]) -> Result<Vec<String>, SynthError> {
        let mut qs = Vec::with_capacity(arms.len());
        for arm in arms {
            let state = space.arm(arm).ok_or_else(|| {
                SynthError::PolicyMissingQValue(format!("arm `{arm}` has no Q value"))
            })?;
            qs.push(state.q);
        }
        let Some(top) = qs.iter().copied().reduce(f64::max) else {
            return Ok(Vec::new());
        };
        Ok(arms
            .iter()
            .zip(qs)
            .filter(|(_, q)| *q == top)
            .map(|(arm, _)| arm.clone())
            .collect())
    }
}
