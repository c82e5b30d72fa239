use crate::dispatcher::{MinerClient, SendError, TaskEnvelope};
use crate::registry::Miner;
use anyhow::Context;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Production miner client: POSTs the task envelope as JSON to the miner's
/// task endpoint. Any non-success status counts as a send failure for that
/// miner only.
pub struct HttpMinerClient {
    http: reqwest::Client,
}

impl HttpMinerClient {
    pub fn new(send_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(send_timeout)
            .build()
            .context("Building miner HTTP client")?;
        Ok(Self { http })
    }

    fn task_url(miner: &Miner) -> String {
        format!("{}/v1/task", miner.endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl MinerClient for HttpMinerClient {
    async fn send_task(&self, miner: &Miner, task: &TaskEnvelope) -> Result<(), SendError> {
        let url = Self::task_url(miner);
        debug!(
            "Sending task {}/{} to miner {} at {}",
            task.slot, task.task_id, miner.uid, url
        );

        let response = self.http.post(&url).json(task).send().await.map_err(|e| {
            if e.is_timeout() {
                SendError::Timeout
            } else {
                SendError::Unreachable(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(SendError::RejectedStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
