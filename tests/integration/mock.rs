// Shared mocks and wiring helpers for the validator core tests.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use subnet_validator::{
    AggregationPolicy, AssignmentLedger, CycleCoordinator, CycleScoreStore, Miner, MinerClient,
    MinerRegistry, MinerUid, OracleError, PayloadQualityScorer, ResultCollector, ScoreAggregator,
    SendError, Slot, SlotOracle, TaskDispatcher, TaskEnvelope, ValidatorConfig,
};
use tokio::sync::Mutex;

/// Slot oracle whose slot value and availability the test controls.
pub struct MockSlotOracle {
    slot: AtomicU64,
    available: AtomicBool,
}

impl MockSlotOracle {
    pub fn at(slot: Slot) -> Self {
        Self {
            slot: AtomicU64::new(slot),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_slot(&self, slot: Slot) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl SlotOracle for MockSlotOracle {
    async fn current_slot(&self) -> Result<Slot, OracleError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(OracleError::Unavailable("mock outage".to_string()));
        }
        Ok(self.slot.load(Ordering::SeqCst))
    }
}

/// Miner client that records every envelope and optionally refuses sends
/// to specific miners.
pub struct RecordingClient {
    pub sent: Arc<Mutex<Vec<(MinerUid, TaskEnvelope)>>>,
    failing_uids: HashSet<MinerUid>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failing_uids: HashSet::new(),
        }
    }

    pub fn failing(uids: &[MinerUid]) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            failing_uids: uids.iter().copied().collect(),
        }
    }

    pub async fn envelope_for(&self, uid: MinerUid) -> Option<TaskEnvelope> {
        self.sent
            .lock()
            .await
            .iter()
            .find(|(m, _)| *m == uid)
            .map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl MinerClient for RecordingClient {
    async fn send_task(&self, miner: &Miner, task: &TaskEnvelope) -> Result<(), SendError> {
        if self.failing_uids.contains(&miner.uid) {
            return Err(SendError::Unreachable("mock refused".to_string()));
        }
        self.sent.lock().await.push((miner.uid, task.clone()));
        Ok(())
    }
}

/// Fully wired validator core over mocks, with handles to every component
/// a test needs to poke.
pub struct TestValidator {
    pub registry: Arc<MinerRegistry>,
    pub ledger: Arc<AssignmentLedger>,
    pub collector: Arc<ResultCollector>,
    pub store: Arc<CycleScoreStore>,
    pub oracle: Arc<MockSlotOracle>,
    pub client: Arc<RecordingClient>,
    pub coordinator: Arc<CycleCoordinator>,
}

pub fn test_config(batch_size: usize, slots_per_cycle: u64) -> ValidatorConfig {
    ValidatorConfig {
        batch_size,
        result_window_secs: 2.0,
        slots_per_cycle,
        aggregation_policy: AggregationPolicy::Average,
        slot_poll_interval_ms: 100,
        ..Default::default()
    }
}

pub async fn build_validator(
    config: ValidatorConfig,
    client: Arc<RecordingClient>,
    miner_uids: &[MinerUid],
) -> TestValidator {
    let registry = Arc::new(MinerRegistry::new());
    for &uid in miner_uids {
        registry
            .register(Miner {
                uid,
                endpoint: format!("http://127.0.0.1:{}", 9000 + uid),
                stake: 1_000,
                reputation: 1.0,
            })
            .await
            .unwrap();
    }

    let oracle = Arc::new(MockSlotOracle::at(0));
    let ledger = Arc::new(AssignmentLedger::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        registry.clone(),
        client.clone(),
        ledger.clone(),
        config.batch_size,
        config.eligibility.clone(),
    ));
    let collector = Arc::new(ResultCollector::new(ledger.clone(), registry.clone()));
    let aggregator = Arc::new(ScoreAggregator::new(
        config.aggregation_policy,
        Arc::new(PayloadQualityScorer::new(config.scoring.clone())),
    ));
    let store = Arc::new(CycleScoreStore::new());

    let coordinator = Arc::new(CycleCoordinator::new(
        config,
        oracle.clone(),
        registry.clone(),
        dispatcher,
        collector.clone(),
        aggregator,
        ledger.clone(),
        store.clone(),
    ));

    TestValidator {
        registry,
        ledger,
        collector,
        store,
        oracle,
        client,
        coordinator,
    }
}
