use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Instant};

use crate::aggregator::{normalize_base_url, read_json};
use crate::error::ArbError;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What became of a submitted bundle within the wait window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleDisposition {
    /// Landed on chain (possibly with the landed slot).
    Landed(Option<u64>),
    /// The engine reported a terminal rejection.
    Rejected(String),
    /// The engine dropped the bundle without landing it.
    Dropped,
    /// A result arrived but carried no recognizable status.
    Unknown,
    /// No result within the wait deadline.
    TimedOut,
}

/// Block-engine client: submit a bundle over JSON-RPC and poll its status.
pub struct JitoClient {
    http: reqwest::Client,
    base_url: String,
    request_id: AtomicU64,
}

impl JitoClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ArbError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ArbError::ConfigError(format!("http client: {e}")))?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit base64-encoded transactions as one bundle. Returns the bundle
    /// id assigned by the engine.
    pub async fn send_bundle(&self, transactions_base64: &[String]) -> Result<String, ArbError> {
        let url = format!("{}/api/v1/bundles", self.base_url);
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "sendBundle",
            "params": [transactions_base64, {"encoding": "base64"}],
        });
        let response: RpcResponse<String> =
            read_json(self.http.post(&url).json(&body).send().await?).await?;
        if let Some(error) = response.error {
            return Err(ArbError::ExecutionError(format!(
                "sendBundle: {} (code {})",
                error.message, error.code
            )));
        }
        let bundle_id = response
            .result
            .ok_or_else(|| ArbError::ExecutionError("sendBundle returned no id".to_string()))?;
        info!("bundle submitted: {bundle_id}");
        Ok(bundle_id)
    }

    /// Poll bundle status until it lands, fails, or the deadline passes.
    pub async fn wait_for_result(
        &self,
        bundle_id: &str,
        wait: Duration,
    ) -> Result<BundleDisposition, ArbError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.bundle_status(bundle_id).await {
                Ok(Some(disposition)) => return Ok(disposition),
                Ok(None) => {}
                Err(e) => debug!("bundle status poll failed: {e}"),
            }
            if Instant::now() >= deadline {
                return Ok(BundleDisposition::TimedOut);
            }
            sleep(STATUS_POLL_INTERVAL.min(wait)).await;
        }
    }

    async fn bundle_status(&self, bundle_id: &str) -> Result<Option<BundleDisposition>, ArbError> {
        let url = format!("{}/api/v1/bundles", self.base_url);
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "getBundleStatuses",
            "params": [[bundle_id]],
        });
        let response: RpcResponse<StatusesResult> =
            read_json(self.http.post(&url).json(&body).send().await?).await?;
        let Some(result) = response.result else {
            return Ok(None);
        };
        let Some(Some(status)) = result.value.first().map(|v| v.as_ref()) else {
            return Ok(None);
        };
        Ok(classify_status(status))
    }
}

fn classify_status(status: &BundleStatus) -> Option<BundleDisposition> {
    match status.confirmation_status.as_deref() {
        Some("processed") | Some("confirmed") | Some("finalized") => {
            if status.err.is_some() && status.err != Some(serde_json::json!({"Ok": null})) {
                Some(BundleDisposition::Rejected(
                    status.err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                ))
            } else {
                Some(BundleDisposition::Landed(status.slot))
            }
        }
        Some("rejected") => Some(BundleDisposition::Rejected(
            status.err.as_ref().map(|e| e.to_string()).unwrap_or_default(),
        )),
        Some("dropped") => Some(BundleDisposition::Dropped),
        Some(_) => Some(BundleDisposition::Unknown),
        None => None,
    }
}

/// The RPC fallback is warranted only when we were going to wait for the
/// bundle anyway and the engine reported a terminal failure (or errored).
/// A plain timeout is not a failure: the bundle may still land.
pub fn should_fallback_to_rpc(
    result: &Result<BundleDisposition, ArbError>,
    wait_ms: u64,
    fallback_enabled: bool,
) -> bool {
    if !fallback_enabled || wait_ms == 0 {
        return false;
    }
    match result {
        Err(_) => true,
        Ok(BundleDisposition::Rejected(_))
        | Ok(BundleDisposition::Dropped)
        | Ok(BundleDisposition::Unknown) => true,
        Ok(BundleDisposition::Landed(_)) | Ok(BundleDisposition::TimedOut) => false,
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusesResult {
    #[serde(default)]
    value: Vec<Option<BundleStatus>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BundleStatus {
    #[serde(default)]
    slot: Option<u64>,
    #[serde(default)]
    confirmation_status: Option<String>,
    #[serde(default)]
    err: Option<serde_json::Value>,
}
