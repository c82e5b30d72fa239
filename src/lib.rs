pub mod aggregator;
pub mod api;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod miner_client;
pub mod oracle;
pub mod registry;

// Re-export the main types
pub use aggregator::{
    CycleId, CycleScoreStore, CycleScores, PayloadQualityScorer, ScoreAggregator, ScoreError,
    TaskScorer,
};
pub use api::ResultSubmission;
pub use collector::{AcceptOutcome, CollectError, ResultCollector, ResultStatus, TaskResult};
pub use config::{
    AggregationPolicy, ConfigError, EligibilityCriteria, ScoringConfig, ValidatorConfig,
};
pub use coordinator::{CoordinatorStatus, CycleCoordinator, Phase};
pub use dispatcher::{
    AssignmentLedger, MinerClient, SendError, TaskAssignment, TaskDispatcher, TaskEnvelope, TaskId,
};
pub use miner_client::HttpMinerClient;
pub use oracle::{CachingSlotOracle, ChainSlotOracle, OracleError, Slot, SlotOracle};
pub use registry::{Miner, MinerRegistry, MinerUid, RegistryError};
