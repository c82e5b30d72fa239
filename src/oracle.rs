use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Discrete externally-clocked scheduling unit. Monotonically
/// non-decreasing; the chain block number serves as the slot.
pub type Slot = u64;

#[derive(Error, Debug)]
pub enum OracleError {
    /// The external ledger could not be reached. Retryable with backoff,
    /// never fatal to the coordinator.
    #[error("Slot oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid RPC endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

/// Read-only query boundary to the chain clock.
#[async_trait]
pub trait SlotOracle: Send + Sync {
    async fn current_slot(&self) -> Result<Slot, OracleError>;
}

/// Slot oracle backed by an ethers JSON-RPC provider. Each query is
/// bounded by a request timeout so a hung endpoint surfaces as
/// `Unavailable` rather than stalling the slot loop.
pub struct ChainSlotOracle {
    provider: Arc<Provider<Http>>,
    request_timeout: Duration,
}

impl ChainSlotOracle {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self, OracleError> {
        let provider =
            Provider::<Http>::try_from(rpc_url).map_err(|e| OracleError::InvalidEndpoint {
                url: rpc_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            provider: Arc::new(provider),
            request_timeout,
        })
    }

    pub fn from_provider(provider: Arc<Provider<Http>>, request_timeout: Duration) -> Self {
        Self {
            provider,
            request_timeout,
        }
    }
}

#[async_trait]
impl SlotOracle for ChainSlotOracle {
    async fn current_slot(&self) -> Result<Slot, OracleError> {
        match tokio::time::timeout(self.request_timeout, self.provider.get_block_number()).await {
            Ok(Ok(block_number)) => Ok(block_number.as_u64()),
            Ok(Err(e)) => {
                warn!("Slot query failed: {}", e);
                Err(OracleError::Unavailable(e.to_string()))
            }
            Err(_) => {
                warn!("Slot query timed out after {:?}", self.request_timeout);
                Err(OracleError::Unavailable("request timeout".to_string()))
            }
        }
    }
}

struct CachedSlot {
    slot: Slot,
    fetched_at: Instant,
}

/// Caching layer over any slot oracle. Serves the last successful slot
/// while it is younger than the configured TTL (derived from the slot
/// duration estimate) so repeated polls within one slot do not hammer
/// the RPC endpoint.
pub struct CachingSlotOracle<O> {
    inner: O,
    ttl: Duration,
    cache: RwLock<Option<CachedSlot>>,
}

impl<O: SlotOracle> CachingSlotOracle<O> {
    pub fn new(inner: O, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(None),
        }
    }
}

#[async_trait]
impl<O: SlotOracle> SlotOracle for CachingSlotOracle<O> {
    async fn current_slot(&self) -> Result<Slot, OracleError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!("Serving cached slot {}", cached.slot);
                    return Ok(cached.slot);
                }
            }
        }

        let slot = self.inner.current_slot().await?;
        let mut cache = self.cache.write().await;
        // Slots never move backwards; keep the high-water mark if a lagging
        // endpoint reports an older block.
        let slot = match cache.as_ref() {
            Some(cached) if cached.slot > slot => cached.slot,
            _ => slot,
        };
        *cache = Some(CachedSlot {
            slot,
            fetched_at: Instant::now(),
        });
        Ok(slot)
    }
}
