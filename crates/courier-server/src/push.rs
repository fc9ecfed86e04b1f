//! Offline wake-up push dispatch.
//!
//! Fan-out hands [`PushBatch`]es to a [`PushDispatcher`]; a single
//! [`PushWorker`] drains the queue and talks to the [`PushGateway`]. Tokens
//! are split into chunks no larger than the gateway's per-call limit. Failed
//! tokens are logged and never retried here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use courier_shared::protocol::PushTier;
use courier_shared::types::DeviceKind;

/// Tokens of one platform that should be woken with one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushBatch {
    pub platform: DeviceKind,
    pub tokens: Vec<String>,
    /// Base64 envelope delivered under the `msg` data key.
    pub payload: String,
    pub tier: PushTier,
}

/// Per-call result reported by the gateway.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub success_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("Push gateway transport error: {0}")]
    Transport(String),

    #[error("Push gateway rejected request: {status}")]
    Rejected { status: u16 },
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_single(
        &self,
        platform: DeviceKind,
        token: &str,
        payload: &str,
        tier: PushTier,
    ) -> Result<(), PushError>;

    async fn send_multicast(
        &self,
        platform: DeviceKind,
        tokens: &[String],
        payload: &str,
        tier: PushTier,
    ) -> Result<PushOutcome, PushError>;
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct GatewayRequest<'a> {
    platform: &'static str,
    tokens: &'a [String],
    priority: &'static str,
    data: GatewayData<'a>,
}

#[derive(Serialize)]
struct GatewayData<'a> {
    msg: &'a str,
}

/// Posts push requests as JSON to a gateway endpoint.
pub struct HttpPushGateway {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpPushGateway {
    pub fn new(endpoint: String, api_key: Option<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| PushError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }

    async fn post(
        &self,
        platform: DeviceKind,
        tokens: &[String],
        payload: &str,
        tier: PushTier,
    ) -> Result<PushOutcome, PushError> {
        let body = GatewayRequest {
            platform: platform.as_str(),
            tokens,
            priority: tier.as_str(),
            data: GatewayData { msg: payload },
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PushError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PushError::Rejected {
                status: status.as_u16(),
            });
        }

        // Gateways that do not report counts are treated as all-success.
        Ok(response.json::<PushOutcome>().await.unwrap_or(PushOutcome {
            success_count: tokens.len(),
            failure_count: 0,
        }))
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_single(
        &self,
        platform: DeviceKind,
        token: &str,
        payload: &str,
        tier: PushTier,
    ) -> Result<(), PushError> {
        let outcome = self
            .post(platform, &[token.to_string()], payload, tier)
            .await?;
        if outcome.failure_count > 0 {
            return Err(PushError::Rejected { status: 200 });
        }
        Ok(())
    }

    async fn send_multicast(
        &self,
        platform: DeviceKind,
        tokens: &[String],
        payload: &str,
        tier: PushTier,
    ) -> Result<PushOutcome, PushError> {
        self.post(platform, tokens, payload, tier).await
    }
}

/// Gateway used when no endpoint is configured: logs and reports success.
pub struct LogOnlyGateway;

#[async_trait]
impl PushGateway for LogOnlyGateway {
    async fn send_single(
        &self,
        platform: DeviceKind,
        _token: &str,
        _payload: &str,
        tier: PushTier,
    ) -> Result<(), PushError> {
        info!(platform = platform.as_str(), tier = tier.as_str(), "Push (log only) to 1 token");
        Ok(())
    }

    async fn send_multicast(
        &self,
        platform: DeviceKind,
        tokens: &[String],
        _payload: &str,
        tier: PushTier,
    ) -> Result<PushOutcome, PushError> {
        info!(
            platform = platform.as_str(),
            tier = tier.as_str(),
            tokens = tokens.len(),
            "Push (log only)"
        );
        Ok(PushOutcome {
            success_count: tokens.len(),
            failure_count: 0,
        })
    }
}

// ---------------------------------------------------------------------------
// Queue and worker
// ---------------------------------------------------------------------------

/// Split `tokens` into chunks of at most `limit`.
pub fn split_tokens(tokens: &[String], limit: usize) -> Vec<Vec<String>> {
    tokens
        .chunks(limit.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[derive(Clone)]
pub struct PushDispatcher {
    tx: mpsc::Sender<PushBatch>,
}

impl PushDispatcher {
    pub fn new(
        gateway: Arc<dyn PushGateway>,
        capacity: usize,
        batch_limit: usize,
    ) -> (Self, PushWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self { tx },
            PushWorker {
                rx,
                gateway,
                batch_limit: batch_limit.max(1),
            },
        )
    }

    /// Queue a batch without waiting. A full queue drops the batch.
    pub fn submit(&self, batch: PushBatch) -> bool {
        if batch.tokens.is_empty() {
            return false;
        }
        match self.tx.try_send(batch) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(batch)) => {
                warn!(
                    platform = batch.platform.as_str(),
                    tokens = batch.tokens.len(),
                    "Push queue full, dropping batch"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!("Push queue closed");
                false
            }
        }
    }
}

pub struct PushWorker {
    rx: mpsc::Receiver<PushBatch>,
    gateway: Arc<dyn PushGateway>,
    batch_limit: usize,
}

impl PushWorker {
    pub async fn run(mut self) {
        while let Some(batch) = self.rx.recv().await {
            self.dispatch(batch).await;
        }
        debug!("Push queue closed, worker exiting");
    }

    async fn dispatch(&self, batch: PushBatch) {
        let platform = batch.platform.as_str();

        if let [token] = batch.tokens.as_slice() {
            match self
                .gateway
                .send_single(batch.platform, token, &batch.payload, batch.tier)
                .await
            {
                Ok(()) => debug!(platform, tier = batch.tier.as_str(), "Push sent"),
                Err(e) => warn!(platform, error = %e, "Push failed"),
            }
            return;
        }

        for chunk in split_tokens(&batch.tokens, self.batch_limit) {
            match self
                .gateway
                .send_multicast(batch.platform, &chunk, &batch.payload, batch.tier)
                .await
            {
                Ok(outcome) => info!(
                    platform,
                    tier = batch.tier.as_str(),
                    success = outcome.success_count,
                    failure = outcome.failure_count,
                    "Push batch sent"
                ),
                Err(e) => warn!(platform, tokens = chunk.len(), error = %e, "Push batch failed"),
            }
        }
    }
}
