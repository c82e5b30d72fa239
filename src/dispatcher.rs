use crate::config::EligibilityCriteria;
use crate::oracle::Slot;
use crate::registry::{Miner, MinerRegistry, MinerUid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type TaskId = u64;

#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error("Miner unreachable: {0}")]
    Unreachable(String),

    #[error("Send timed out")]
    Timeout,

    #[error("Miner rejected task with status {0}")]
    RejectedStatus(u16),
}

/// Wire envelope pushed to a miner: the slot, the task key within that
/// slot, a correlation id, and the opaque work payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub slot: Slot,
    pub task_id: TaskId,
    pub request_id: Uuid,
    pub payload: serde_json::Value,
}

/// Record mapping `(slot, task_id)` to the miner responsible for it.
/// Written before the task goes out; a failed send retracts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub slot: Slot,
    pub task_id: TaskId,
    pub miner_uid: MinerUid,
    pub dispatched_at: u64,
}

#[derive(Default)]
struct SlotLedger {
    dispatched: bool,
    assignments: Vec<TaskAssignment>,
}

/// Ledger of task assignments, shared between the dispatcher (writer),
/// the result collector (lookup + timeout sweep) and the score aggregator
/// (per-miner responsibility).
pub struct AssignmentLedger {
    slots: RwLock<HashMap<Slot, SlotLedger>>,
}

impl AssignmentLedger {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Claims the per-slot dispatched flag. Returns false if dispatch for
    /// this slot already ran, making a second dispatch a no-op.
    async fn try_begin_dispatch(&self, slot: Slot) -> bool {
        let mut slots = self.slots.write().await;
        let ledger = slots.entry(slot).or_default();
        if ledger.dispatched {
            false
        } else {
            ledger.dispatched = true;
            true
        }
    }

    async fn record(&self, assignment: TaskAssignment) {
        let mut slots = self.slots.write().await;
        slots
            .entry(assignment.slot)
            .or_default()
            .assignments
            .push(assignment);
    }

    /// Retracts an assignment whose send never reached the miner.
    async fn retract(&self, slot: Slot, task_id: TaskId, miner_uid: MinerUid) {
        let mut slots = self.slots.write().await;
        if let Some(ledger) = slots.get_mut(&slot) {
            ledger
                .assignments
                .retain(|a| !(a.task_id == task_id && a.miner_uid == miner_uid));
        }
    }

    pub async fn is_dispatched(&self, slot: Slot) -> bool {
        self.slots
            .read()
            .await
            .get(&slot)
            .map(|l| l.dispatched)
            .unwrap_or(false)
    }

    pub async fn assignments_for(&self, slot: Slot) -> Vec<TaskAssignment> {
        self.slots
            .read()
            .await
            .get(&slot)
            .map(|l| l.assignments.clone())
            .unwrap_or_default()
    }

    pub async fn assigned_miner(&self, slot: Slot, task_id: TaskId) -> Option<MinerUid> {
        self.slots.read().await.get(&slot).and_then(|l| {
            l.assignments
                .iter()
                .find(|a| a.task_id == task_id)
                .map(|a| a.miner_uid)
        })
    }

    /// Drops ledger entries for slots older than `before`. Finalized slots
    /// are archived by the caller before retirement.
    pub async fn retire_before(&self, before: Slot) {
        let mut slots = self.slots.write().await;
        slots.retain(|slot, _| *slot >= before);
    }
}

impl Default for AssignmentLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound network boundary: best-effort, unordered, duplicate-tolerant.
#[async_trait]
pub trait MinerClient: Send + Sync {
    async fn send_task(&self, miner: &Miner, task: &TaskEnvelope) -> Result<(), SendError>;
}

pub struct TaskDispatcher {
    registry: Arc<MinerRegistry>,
    client: Arc<dyn MinerClient>,
    ledger: Arc<AssignmentLedger>,
    batch_size: usize,
    eligibility: EligibilityCriteria,
    send_limit: Arc<Semaphore>,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<MinerRegistry>,
        client: Arc<dyn MinerClient>,
        ledger: Arc<AssignmentLedger>,
        batch_size: usize,
        eligibility: EligibilityCriteria,
    ) -> Self {
        // Per-miner sends run concurrently, bounded by the batch size.
        let send_limit = Arc::new(Semaphore::new(batch_size.max(1)));
        Self {
            registry,
            client,
            ledger,
            batch_size,
            eligibility,
            send_limit,
        }
    }

    /// Selects up to `batch_size` eligible miners (ascending uid), marks
    /// each busy, and pushes the slot payload to them concurrently. A send
    /// failure frees that miner and drops it from the batch; it never
    /// aborts the dispatch. Idempotent per slot.
    pub async fn dispatch(
        &self,
        slot: Slot,
        payload: serde_json::Value,
    ) -> Vec<TaskAssignment> {
        if !self.ledger.try_begin_dispatch(slot).await {
            debug!("Dispatch for slot {} already ran, skipping", slot);
            return self.ledger.assignments_for(slot).await;
        }

        let candidates = self.registry.list_eligible(&self.eligibility).await;
        let mut batch = Vec::new();
        for miner in candidates {
            if batch.len() >= self.batch_size {
                break;
            }
            // A concurrent claim elsewhere loses this miner the seat, not
            // the whole batch.
            match self.registry.try_mark_busy(miner.uid).await {
                Ok(true) => batch.push(miner),
                Ok(false) => debug!("Miner {} raced busy, skipping", miner.uid),
                Err(e) => warn!("Skipping miner {}: {}", miner.uid, e),
            }
        }

        let mut handles = Vec::new();
        for (index, miner) in batch.into_iter().enumerate() {
            let task = TaskEnvelope {
                slot,
                task_id: index as TaskId,
                request_id: Uuid::new_v4(),
                payload: payload.clone(),
            };
            let assignment = TaskAssignment {
                slot,
                task_id: task.task_id,
                miner_uid: miner.uid,
                dispatched_at: unix_now(),
            };
            let client = self.client.clone();
            let registry = self.registry.clone();
            let ledger = self.ledger.clone();
            let permit = match self.send_limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            // The assignment must be visible before the task leaves, or a
            // miner answering mid-send races the ledger and gets rejected.
            self.ledger.record(assignment.clone()).await;

            handles.push(tokio::spawn(async move {
                let outcome = client.send_task(&miner, &task).await;
                drop(permit);
                match outcome {
                    Ok(()) => Some(assignment),
                    Err(e) => {
                        warn!("Send to miner {} failed: {}", miner.uid, e);
                        ledger
                            .retract(assignment.slot, assignment.task_id, assignment.miner_uid)
                            .await;
                        if let Err(e) = registry.mark_free(miner.uid).await {
                            warn!("Failed to free miner {}: {}", miner.uid, e);
                        }
                        None
                    }
                }
            }));
        }

        let mut assignments = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(assignment)) => assignments.push(assignment),
                Ok(None) => {}
                Err(e) => warn!("Dispatch send task panicked: {}", e),
            }
        }

        info!(
            "Dispatched {} task(s) for slot {} (batch size {})",
            assignments.len(),
            slot,
            self.batch_size
        );
        assignments
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
