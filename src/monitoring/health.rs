use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use serde::Serialize;

use crate::rate::{AdaptiveRateLimiter, LimiterSnapshot};

/// Identity and limiter snapshots exposed on /metrics. Never secrets.
#[derive(Clone)]
pub struct HealthState {
    pub mode: String,
    pub execution_strategy: String,
    pub trigger_strategy: String,
    pub pair_count: usize,
    pub limiters: Vec<Arc<AdaptiveRateLimiter>>,
}

#[derive(Serialize)]
struct MetricsResponse {
    mode: String,
    execution_strategy: String,
    trigger_strategy: String,
    pair_count: usize,
    limiters: Vec<LimiterSnapshot>,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<Arc<HealthState>>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        mode: state.mode.clone(),
        execution_strategy: state.execution_strategy.clone(),
        trigger_strategy: state.trigger_strategy.clone(),
        pair_count: state.pair_count,
        limiters: state.limiters.iter().map(|l| l.snapshot()).collect(),
    })
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve the health endpoint in the background; failures are logged, never
/// fatal.
pub fn spawn(port: u16, state: Arc<HealthState>) {
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{port}");
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("health endpoint bind {addr} failed: {e}");
                return;
            }
        };
        info!("health endpoint listening on {addr}");
        if let Err(e) = axum::serve(listener, router(state)).await {
            warn!("health endpoint stopped: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate::LimiterConfig;
    use std::time::Duration;

    fn state() -> Arc<HealthState> {
        Arc::new(HealthState {
            mode: "dry-run".to_string(),
            execution_strategy: "atomic".to_string(),
            trigger_strategy: "immediate".to_string(),
            pair_count: 2,
            limiters: vec![Arc::new(AdaptiveRateLimiter::new(LimiterConfig {
                name: "jupiter".to_string(),
                base_rps: 1.0,
                min_rps: 0.25,
                burst: 2.0,
                penalty: Duration::from_secs(10),
                recovery_every: Duration::from_secs(5),
                recovery_step_rps: 0.1,
            }))],
        })
    }

    #[tokio::test]
    async fn metrics_reports_limiters_without_secrets() {
        let response = metrics(State(state())).await;
        let body = serde_json::to_string(&response.0).unwrap();
        assert!(body.contains("\"jupiter\""));
        assert!(body.contains("\"pair_count\":2"));
        assert!(!body.to_lowercase().contains("secret"));
        assert!(!body.to_lowercase().contains("key"));
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        assert_eq!(healthz().await, "ok");
    }
}
