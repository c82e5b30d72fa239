use crate::collector::{ResultStatus, TaskResult};
use crate::config::{AggregationPolicy, ScoringConfig};
use crate::registry::MinerUid;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A cycle spans `slots_per_cycle` consecutive slots:
/// `cycle_id = slot / slots_per_cycle`, identical on every validator.
pub type CycleId = u64;

#[derive(Error, Debug)]
pub enum ScoreError {
    /// Write attempted after finalization. A programming-contract
    /// violation in the caller, not a runtime condition to retry.
    #[error("Cycle {0} is finalized and read-only")]
    CycleFinalized(CycleId),

    #[error("Unknown cycle {0}")]
    UnknownCycle(CycleId),
}

/// Pluggable per-task quality function. The engine only fixes how scores
/// fold, not what a single task is worth.
pub trait TaskScorer: Send + Sync {
    fn score(&self, result: &TaskResult) -> f64;
}

/// Default scorer: a success earns the configured success value scaled by
/// the miner-reported quality when present; timeouts and malformed
/// responses earn the configured penalty.
pub struct PayloadQualityScorer {
    scoring: ScoringConfig,
}

impl PayloadQualityScorer {
    pub fn new(scoring: ScoringConfig) -> Self {
        Self { scoring }
    }
}

impl TaskScorer for PayloadQualityScorer {
    fn score(&self, result: &TaskResult) -> f64 {
        match result.status {
            ResultStatus::Success => {
                self.scoring.success_value * result.quality.unwrap_or(1.0)
            }
            ResultStatus::Timeout | ResultStatus::Malformed => self.scoring.timeout_penalty,
        }
    }
}

/// Folds a closed slot's results into one contribution per miner.
/// Deterministic: same results and policy always produce identical output,
/// which multi-validator agreement depends on.
pub struct ScoreAggregator {
    policy: AggregationPolicy,
    scorer: Arc<dyn TaskScorer>,
}

impl ScoreAggregator {
    pub fn new(policy: AggregationPolicy, scorer: Arc<dyn TaskScorer>) -> Self {
        Self { policy, scorer }
    }

    /// Precondition: the slot's result window is closed (the coordinator's
    /// sequencing guarantees it; not re-checked here).
    pub fn aggregate(&self, results: &[TaskResult]) -> BTreeMap<MinerUid, f64> {
        let mut per_miner: BTreeMap<MinerUid, Vec<f64>> = BTreeMap::new();
        for result in results {
            per_miner
                .entry(result.miner_uid)
                .or_default()
                .push(self.scorer.score(result));
        }

        per_miner
            .into_iter()
            .map(|(uid, scores)| {
                let folded = match self.policy {
                    AggregationPolicy::Average => {
                        scores.iter().sum::<f64>() / scores.len() as f64
                    }
                    AggregationPolicy::Sum => scores.iter().sum(),
                    AggregationPolicy::Max => {
                        scores.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                    }
                };
                debug!("Miner {} slot contribution: {}", uid, folded);
                (uid, folded)
            })
            .collect()
    }
}

/// Finalized view of one cycle's scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleScores {
    pub cycle_id: CycleId,
    pub scores: BTreeMap<MinerUid, f64>,
    pub slots_aggregated: u64,
}

#[derive(Default)]
struct CycleState {
    scores: BTreeMap<MinerUid, f64>,
    slots_aggregated: u64,
    finalized: bool,
}

/// Cycle-level score accumulator. Accepts per-slot contributions until the
/// cycle is finalized, after which every write fails.
pub struct CycleScoreStore {
    cycles: RwLock<HashMap<CycleId, CycleState>>,
}

impl CycleScoreStore {
    pub fn new() -> Self {
        Self {
            cycles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn accumulate(
        &self,
        cycle_id: CycleId,
        contributions: &BTreeMap<MinerUid, f64>,
    ) -> Result<(), ScoreError> {
        let mut cycles = self.cycles.write().await;
        let state = cycles.entry(cycle_id).or_default();
        if state.finalized {
            return Err(ScoreError::CycleFinalized(cycle_id));
        }
        for (&uid, &score) in contributions {
            *state.scores.entry(uid).or_insert(0.0) += score;
        }
        state.slots_aggregated += 1;
        Ok(())
    }

    /// Seals the cycle and returns its scores. Further accumulation (or a
    /// second finalize) fails with `CycleFinalized`.
    pub async fn finalize(&self, cycle_id: CycleId) -> Result<CycleScores, ScoreError> {
        let mut cycles = self.cycles.write().await;
        let state = cycles
            .get_mut(&cycle_id)
            .ok_or(ScoreError::UnknownCycle(cycle_id))?;
        if state.finalized {
            return Err(ScoreError::CycleFinalized(cycle_id));
        }
        state.finalized = true;
        info!(
            "Finalized cycle {} covering {} slot(s), {} miner(s)",
            cycle_id,
            state.slots_aggregated,
            state.scores.len()
        );
        Ok(CycleScores {
            cycle_id,
            scores: state.scores.clone(),
            slots_aggregated: state.slots_aggregated,
        })
    }

    pub async fn get(&self, cycle_id: CycleId) -> Option<CycleScores> {
        let cycles = self.cycles.read().await;
        cycles.get(&cycle_id).map(|state| CycleScores {
            cycle_id,
            scores: state.scores.clone(),
            slots_aggregated: state.slots_aggregated,
        })
    }

    pub async fn is_finalized(&self, cycle_id: CycleId) -> bool {
        let cycles = self.cycles.read().await;
        cycles.get(&cycle_id).map(|s| s.finalized).unwrap_or(false)
    }

    /// Finalized cycles available to the consensus/reward layer.
    pub async fn finalized_cycles(&self) -> Vec<CycleId> {
        let cycles = self.cycles.read().await;
        let mut ids: Vec<_> = cycles
            .iter()
            .filter(|(_, s)| s.finalized)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl Default for CycleScoreStore {
    fn default() -> Self {
        Self::new()
    }
}
