use crate::config::EligibilityCriteria;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub type MinerUid = u64;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Unknown miner uid {0}")]
    UnknownMiner(MinerUid),

    #[error("Miner uid {0} already registered")]
    DuplicateUid(MinerUid),
}

/// Snapshot of a miner as seen by callers. The live busy flag and
/// reputation are owned by the registry; this copy does not track them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Miner {
    pub uid: MinerUid,
    pub endpoint: String,
    pub stake: u64,
    pub reputation: f64,
}

struct MinerEntry {
    uid: MinerUid,
    endpoint: String,
    stake: u64,
    reputation: RwLock<f64>,
    // Compare-exchange on this flag is what serializes concurrent
    // mark_busy calls per miner without a registry-wide write lock.
    busy: AtomicBool,
}

/// Owned store of known miners. The busy flag is set by the dispatcher at
/// send time and cleared by the result collector on completion or timeout;
/// nothing else touches it.
pub struct MinerRegistry {
    miners: RwLock<HashMap<MinerUid, Arc<MinerEntry>>>,
}

impl MinerRegistry {
    pub fn new() -> Self {
        Self {
            miners: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, miner: Miner) -> Result<(), RegistryError> {
        let mut miners = self.miners.write().await;
        if miners.contains_key(&miner.uid) {
            return Err(RegistryError::DuplicateUid(miner.uid));
        }
        miners.insert(
            miner.uid,
            Arc::new(MinerEntry {
                uid: miner.uid,
                endpoint: miner.endpoint,
                stake: miner.stake,
                reputation: RwLock::new(miner.reputation),
                busy: AtomicBool::new(false),
            }),
        );
        Ok(())
    }

    pub async fn deregister(&self, uid: MinerUid) -> Result<(), RegistryError> {
        let mut miners = self.miners.write().await;
        miners
            .remove(&uid)
            .map(|_| ())
            .ok_or(RegistryError::UnknownMiner(uid))
    }

    pub async fn get(&self, uid: MinerUid) -> Option<Miner> {
        let miners = self.miners.read().await;
        match miners.get(&uid) {
            Some(entry) => Some(self.snapshot(entry).await),
            None => None,
        }
    }

    pub async fn count(&self) -> usize {
        self.miners.read().await.len()
    }

    /// Miners meeting the stake/reputation thresholds whose busy flag is
    /// clear, sorted ascending by uid so every validator sees the same
    /// candidate order.
    pub async fn list_eligible(&self, criteria: &EligibilityCriteria) -> Vec<Miner> {
        let miners = self.miners.read().await;
        let mut eligible = Vec::new();
        for entry in miners.values() {
            if entry.busy.load(Ordering::SeqCst) {
                continue;
            }
            if entry.stake < criteria.min_stake {
                continue;
            }
            let reputation = *entry.reputation.read().await;
            if reputation < criteria.min_reputation {
                continue;
            }
            eligible.push(Miner {
                uid: entry.uid,
                endpoint: entry.endpoint.clone(),
                stake: entry.stake,
                reputation,
            });
        }
        eligible.sort_by_key(|m| m.uid);
        eligible
    }

    /// Claims the miner for dispatch. Returns `Ok(true)` if this call won
    /// the flag, `Ok(false)` if the miner was already busy (an eligibility
    /// failure for the caller, not an error).
    pub async fn try_mark_busy(&self, uid: MinerUid) -> Result<bool, RegistryError> {
        let miners = self.miners.read().await;
        let entry = miners.get(&uid).ok_or(RegistryError::UnknownMiner(uid))?;
        let claimed = entry
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if !claimed {
            debug!("Miner {} already busy", uid);
        }
        Ok(claimed)
    }

    /// Clears the busy flag. Idempotent.
    pub async fn mark_free(&self, uid: MinerUid) -> Result<(), RegistryError> {
        let miners = self.miners.read().await;
        let entry = miners.get(&uid).ok_or(RegistryError::UnknownMiner(uid))?;
        entry.busy.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn is_busy(&self, uid: MinerUid) -> Result<bool, RegistryError> {
        let miners = self.miners.read().await;
        let entry = miners.get(&uid).ok_or(RegistryError::UnknownMiner(uid))?;
        Ok(entry.busy.load(Ordering::SeqCst))
    }

    /// Applies a reputation delta, floored at zero.
    pub async fn update_reputation(&self, uid: MinerUid, delta: f64) -> Result<f64, RegistryError> {
        let miners = self.miners.read().await;
        let entry = miners.get(&uid).ok_or(RegistryError::UnknownMiner(uid))?;
        let mut reputation = entry.reputation.write().await;
        *reputation = (*reputation + delta).max(0.0);
        Ok(*reputation)
    }

    async fn snapshot(&self, entry: &MinerEntry) -> Miner {
        Miner {
            uid: entry.uid,
            endpoint: entry.endpoint.clone(),
            stake: entry.stake,
            reputation: *entry.reputation.read().await,
        }
    }
}

impl Default for MinerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
