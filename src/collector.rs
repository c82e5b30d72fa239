use crate::dispatcher::{AssignmentLedger, TaskId};
use crate::oracle::Slot;
use crate::registry::{MinerRegistry, MinerUid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Timeout,
    Malformed,
}

/// One outcome per `(slot, task_id, miner_uid)` key. At most one is ever
/// stored; synthetic timeout results carry no payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub slot: Slot,
    pub task_id: TaskId,
    pub miner_uid: MinerUid,
    pub status: ResultStatus,
    pub payload: Option<serde_json::Value>,
    /// Response-quality metric reported by the miner, clamped to [0, 1].
    pub quality: Option<f64>,
    pub received_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Result stored with the given status; the miner has been freed.
    Stored(ResultStatus),
    /// A result already exists for this key; the response was discarded.
    Duplicate,
    /// The slot's window already closed; the response was dropped.
    LateDropped,
}

#[derive(Error, Debug)]
pub enum CollectError {
    /// No TaskAssignment matches this response. Either a spoofed miner or
    /// a protocol violation; rejected and logged.
    #[error("No assignment for slot {slot} task {task_id} miner {miner_uid}")]
    UnknownAssignment {
        slot: Slot,
        task_id: TaskId,
        miner_uid: MinerUid,
    },
}

#[derive(Default)]
struct SlotBucket {
    closed: bool,
    results: HashMap<(TaskId, MinerUid), TaskResult>,
}

/// Buffers miner responses per slot and closes each slot's result window
/// deterministically. The per-slot bucket mutex is the gate: a window
/// close and a concurrent accept for the same slot are mutually exclusive,
/// and nothing is admitted once the close transition has run.
pub struct ResultCollector {
    ledger: Arc<AssignmentLedger>,
    registry: Arc<MinerRegistry>,
    slots: RwLock<HashMap<Slot, Arc<Mutex<SlotBucket>>>>,
}

impl ResultCollector {
    pub fn new(ledger: Arc<AssignmentLedger>, registry: Arc<MinerRegistry>) -> Self {
        Self {
            ledger,
            registry,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn bucket(&self, slot: Slot) -> Arc<Mutex<SlotBucket>> {
        {
            let slots = self.slots.read().await;
            if let Some(bucket) = slots.get(&slot) {
                return bucket.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots.entry(slot).or_default().clone()
    }

    /// Accepts a miner response. Duplicate responses are discarded and
    /// logged (idempotent insert); responses arriving after the window
    /// closed are dropped; responses with no matching assignment are
    /// rejected as protocol violations.
    pub async fn accept(
        &self,
        slot: Slot,
        task_id: TaskId,
        miner_uid: MinerUid,
        payload: serde_json::Value,
    ) -> Result<AcceptOutcome, CollectError> {
        match self.ledger.assigned_miner(slot, task_id).await {
            Some(assigned) if assigned == miner_uid => {}
            _ => {
                warn!(
                    "Rejecting response for slot {} task {} from unassigned miner {}",
                    slot, task_id, miner_uid
                );
                return Err(CollectError::UnknownAssignment {
                    slot,
                    task_id,
                    miner_uid,
                });
            }
        }

        let bucket = self.bucket(slot).await;
        let outcome = {
            let mut bucket = bucket.lock().await;
            if bucket.closed {
                debug!(
                    "Dropping late response for slot {} task {} miner {}",
                    slot, task_id, miner_uid
                );
                return Ok(AcceptOutcome::LateDropped);
            }
            if bucket.results.contains_key(&(task_id, miner_uid)) {
                debug!(
                    "Discarding duplicate response for slot {} task {} miner {}",
                    slot, task_id, miner_uid
                );
                return Ok(AcceptOutcome::Duplicate);
            }

            let (status, quality) = classify_payload(&payload);
            bucket.results.insert(
                (task_id, miner_uid),
                TaskResult {
                    slot,
                    task_id,
                    miner_uid,
                    status,
                    payload: Some(payload),
                    quality,
                    received_at: unix_now(),
                },
            );
            AcceptOutcome::Stored(status)
        };

        if let Err(e) = self.registry.mark_free(miner_uid).await {
            warn!("Failed to free miner {} after result: {}", miner_uid, e);
        }
        Ok(outcome)
    }

    /// Closes the slot's result window: every assignment without a stored
    /// result gets exactly one synthetic timeout result and its miner is
    /// freed. Idempotent; returns the timed-out assignments' miner uids.
    pub async fn close_window(&self, slot: Slot) -> Vec<MinerUid> {
        let bucket = self.bucket(slot).await;
        let timed_out = {
            let mut bucket = bucket.lock().await;
            if bucket.closed {
                return Vec::new();
            }
            bucket.closed = true;

            let mut timed_out = Vec::new();
            for assignment in self.ledger.assignments_for(slot).await {
                let key = (assignment.task_id, assignment.miner_uid);
                if bucket.results.contains_key(&key) {
                    continue;
                }
                bucket.results.insert(
                    key,
                    TaskResult {
                        slot,
                        task_id: assignment.task_id,
                        miner_uid: assignment.miner_uid,
                        status: ResultStatus::Timeout,
                        payload: None,
                        quality: None,
                        received_at: unix_now(),
                    },
                );
                timed_out.push(assignment.miner_uid);
            }
            timed_out
        };

        for &uid in &timed_out {
            if let Err(e) = self.registry.mark_free(uid).await {
                warn!("Failed to free timed-out miner {}: {}", uid, e);
            }
        }

        if timed_out.is_empty() {
            info!("Closed result window for slot {}", slot);
        } else {
            warn!(
                "Closed result window for slot {} with {} timeout(s): miners {:?}",
                slot,
                timed_out.len(),
                timed_out
            );
        }
        timed_out
    }

    pub async fn is_closed(&self, slot: Slot) -> bool {
        let slots = self.slots.read().await;
        match slots.get(&slot) {
            Some(bucket) => bucket.lock().await.closed,
            None => false,
        }
    }

    /// All results for a slot in `(task_id, miner_uid)` order, so every
    /// consumer iterates them identically.
    pub async fn results_for(&self, slot: Slot) -> Vec<TaskResult> {
        let bucket = self.bucket(slot).await;
        let bucket = bucket.lock().await;
        let mut results: Vec<_> = bucket.results.values().cloned().collect();
        results.sort_by_key(|r| (r.task_id, r.miner_uid));
        results
    }

    /// Drops buffers for slots older than `before` once their scores have
    /// been folded into the cycle store.
    pub async fn retire_before(&self, before: Slot) {
        let mut slots = self.slots.write().await;
        slots.retain(|slot, _| *slot >= before);
    }
}

/// A well-formed response is a JSON object; if it reports a `quality`
/// field, that must be a finite number, clamped here to [0, 1]. Anything
/// else is stored as malformed and scored accordingly.
fn classify_payload(payload: &serde_json::Value) -> (ResultStatus, Option<f64>) {
    let object = match payload.as_object() {
        Some(object) => object,
        None => return (ResultStatus::Malformed, None),
    };
    match object.get("quality") {
        None => (ResultStatus::Success, None),
        Some(value) => match value.as_f64() {
            Some(q) if q.is_finite() => (ResultStatus::Success, Some(q.clamp(0.0, 1.0))),
            _ => (ResultStatus::Malformed, None),
        },
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
