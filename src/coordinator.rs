use crate::aggregator::{CycleId, CycleScoreStore, CycleScores, ScoreAggregator};
use crate::collector::ResultCollector;
use crate::config::ValidatorConfig;
use crate::dispatcher::{AssignmentLedger, TaskDispatcher};
use crate::oracle::{Slot, SlotOracle};
use crate::registry::MinerRegistry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slot-cycle state machine. One instance per validator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    AwaitingSlot,
    Dispatching,
    Collecting,
    Aggregating,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    pub last_slot: Option<Slot>,
    pub slots_processed: u64,
    pub degraded_slots: u64,
}

/// Drives the slot lifecycle: poll the oracle for a new slot, dispatch,
/// hold the result window open on a timer, close it, aggregate, and fold
/// the contributions into the cycle store. Owns references to every other
/// component; none of them reach back into the coordinator.
pub struct CycleCoordinator {
    config: ValidatorConfig,
    oracle: Arc<dyn SlotOracle>,
    registry: Arc<MinerRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    collector: Arc<ResultCollector>,
    aggregator: Arc<ScoreAggregator>,
    ledger: Arc<AssignmentLedger>,
    store: Arc<CycleScoreStore>,
    phase: RwLock<Phase>,
    last_slot: RwLock<Option<Slot>>,
    slots_processed: RwLock<u64>,
    degraded_slots: RwLock<u64>,
    cycle_subscribers: RwLock<Vec<mpsc::Sender<CycleScores>>>,
}

impl CycleCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ValidatorConfig,
        oracle: Arc<dyn SlotOracle>,
        registry: Arc<MinerRegistry>,
        dispatcher: Arc<TaskDispatcher>,
        collector: Arc<ResultCollector>,
        aggregator: Arc<ScoreAggregator>,
        ledger: Arc<AssignmentLedger>,
        store: Arc<CycleScoreStore>,
    ) -> Self {
        Self {
            config,
            oracle,
            registry,
            dispatcher,
            collector,
            aggregator,
            ledger,
            store,
            phase: RwLock::new(Phase::Idle),
            last_slot: RwLock::new(None),
            slots_processed: RwLock::new(0),
            degraded_slots: RwLock::new(0),
            cycle_subscribers: RwLock::new(Vec::new()),
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            phase: *self.phase.read().await,
            last_slot: *self.last_slot.read().await,
            slots_processed: *self.slots_processed.read().await,
            degraded_slots: *self.degraded_slots.read().await,
        }
    }

    /// Finalized cycles are broadcast to every subscriber; the
    /// consensus/reward layer consumes them from here.
    pub async fn subscribe_cycles(&self) -> mpsc::Receiver<CycleScores> {
        let (tx, rx) = mpsc::channel(16);
        self.cycle_subscribers.write().await.push(tx);
        rx
    }

    pub fn cycle_id_for(&self, slot: Slot) -> CycleId {
        slot / self.config.slots_per_cycle
    }

    /// Runs the slot loop until the token is cancelled. Cancellation lets
    /// an in-flight slot finish its current phase; no phase partially
    /// commits.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Coordinator started: batch_size={} window={:?} slots_per_cycle={} policy={}",
            self.config.batch_size,
            self.config.result_window(),
            self.config.slots_per_cycle,
            self.config.aggregation_policy
        );

        loop {
            self.set_phase(Phase::AwaitingSlot).await;
            let slot = match self.await_next_slot(&cancel).await {
                Some(slot) => slot,
                None => break,
            };

            self.process_slot_with_cancel(slot, &cancel).await;
            self.set_phase(Phase::Idle).await;

            if cancel.is_cancelled() {
                break;
            }
        }

        self.set_phase(Phase::Idle).await;
        info!("Coordinator stopped");
    }

    /// Polls the oracle until it reports a slot newer than the last one
    /// processed. Oracle unavailability backs off exponentially up to the
    /// configured cap and never advances state. Returns None on shutdown.
    async fn await_next_slot(&self, cancel: &CancellationToken) -> Option<Slot> {
        let mut backoff = self.config.oracle_backoff_base();
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let wait = match self.oracle.current_slot().await {
                Ok(slot) => {
                    let last = *self.last_slot.read().await;
                    if last.map_or(true, |l| slot > l) {
                        return Some(slot);
                    }
                    debug!("Still in slot {}, polling", slot);
                    backoff = self.config.oracle_backoff_base();
                    self.config.slot_poll_interval()
                }
                Err(e) => {
                    warn!("Slot oracle unavailable, retrying in {:?}: {}", backoff, e);
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.oracle_backoff_max());
                    wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = sleep(wait) => {}
            }
        }
    }

    /// One full pass for a slot: Dispatching -> Collecting -> Aggregating.
    /// Any in-slot failure degrades the slot instead of aborting the loop.
    pub async fn process_slot(&self, slot: Slot) {
        self.process_slot_with_cancel(slot, &CancellationToken::new())
            .await;
    }

    async fn process_slot_with_cancel(&self, slot: Slot, cancel: &CancellationToken) {
        let cycle_id = self.cycle_id_for(slot);

        if let Some(last) = *self.last_slot.read().await {
            // A slot's scores fold into the cycle store exactly once;
            // replays of an already-aggregated slot are dropped here.
            if slot <= last {
                warn!("Slot {} already processed (last {}), ignoring", slot, last);
                return;
            }
            // Crossing into a new cycle seals any unfinished previous cycle
            // even if its tail slots were skipped on-chain.
            let last_cycle = self.cycle_id_for(last);
            if last_cycle < cycle_id {
                self.finalize_cycle(last_cycle).await;
            }
        }
        *self.last_slot.write().await = Some(slot);

        self.set_phase(Phase::Dispatching).await;
        let assignments = self
            .dispatcher
            .dispatch(slot, serde_json::json!({ "slot": slot }))
            .await;
        if assignments.is_empty() {
            warn!("Slot {} degraded: no tasks dispatched", slot);
            *self.degraded_slots.write().await += 1;
        }

        self.set_phase(Phase::Collecting).await;
        // The window closes on the timer, never on all-results-received:
        // an unresponsive miner must not stall the slot. Shutdown closes
        // it early so the slot still finishes deterministically.
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Shutdown during slot {} window, closing early", slot);
            }
            _ = sleep(self.config.result_window()) => {}
        }
        let timed_out = self.collector.close_window(slot).await;
        if !timed_out.is_empty() {
            warn!(
                "Slot {} degraded: miners {:?} contributed timeouts",
                slot, timed_out
            );
            *self.degraded_slots.write().await += 1;
        }

        self.set_phase(Phase::Aggregating).await;
        let results = self.collector.results_for(slot).await;
        let contributions = self.aggregator.aggregate(&results);

        match self.store.accumulate(cycle_id, &contributions).await {
            Ok(()) => {
                for (&uid, &score) in &contributions {
                    if let Err(e) = self.registry.update_reputation(uid, score).await {
                        warn!("Reputation update for miner {} failed: {}", uid, e);
                    }
                }
            }
            Err(e) => {
                // Contract violation, not a transient condition; the slot
                // contributes nothing rather than halting the validator.
                error!("Slot {} scores not recorded: {}", slot, e);
                *self.degraded_slots.write().await += 1;
            }
        }

        if (slot + 1) % self.config.slots_per_cycle == 0 {
            self.finalize_cycle(cycle_id).await;
        }

        *self.slots_processed.write().await += 1;
        self.retire_old_slots(slot).await;
        info!(
            "Slot {} complete: {} assignment(s), {} result(s)",
            slot,
            assignments.len(),
            results.len()
        );
    }

    async fn finalize_cycle(&self, cycle_id: CycleId) {
        if self.store.is_finalized(cycle_id).await {
            return;
        }
        match self.store.finalize(cycle_id).await {
            Ok(scores) => {
                let subscribers = self.cycle_subscribers.read().await;
                for subscriber in subscribers.iter() {
                    let _ = subscriber.send(scores.clone()).await;
                }
            }
            Err(e) => warn!("Cycle {} finalization skipped: {}", cycle_id, e),
        }
    }

    /// Retired slots keep one cycle of history; finalized scores live on
    /// in the cycle store.
    async fn retire_old_slots(&self, slot: Slot) {
        let keep = self.config.slots_per_cycle;
        if slot + 1 > keep {
            let before = slot + 1 - keep;
            self.ledger.retire_before(before).await;
            self.collector.retire_before(before).await;
        }
    }

    async fn set_phase(&self, phase: Phase) {
        *self.phase.write().await = phase;
    }
}
