use std::process::Stdio;

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::arbitrage::Decision;
use crate::error::ArbError;

/// Inputs for one profitability decision. Leg-1 figures ride along for the
/// external decider protocol; only the final leg enters the arithmetic.
#[derive(Debug, Clone, Copy)]
pub struct DecideRequest {
    pub amount_in: u128,
    pub leg1_out: u128,
    pub leg1_min_out: u128,
    pub final_out: u128,
    pub final_min_out: u128,
    pub fee_in_a: u128,
    pub min_profit_in_a: u128,
}

fn to_i128(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

/// The decision arithmetic: exact integers, no rounding, no floats.
pub fn decide_local(request: &DecideRequest) -> Decision {
    let amount_in = to_i128(request.amount_in);
    let fee = to_i128(request.fee_in_a);
    let profit = to_i128(request.final_out) - amount_in - fee;
    let conservative_profit = to_i128(request.final_min_out) - amount_in - fee;
    Decision {
        profit,
        conservative_profit,
        profitable: conservative_profit >= to_i128(request.min_profit_in_a),
    }
}

#[async_trait]
pub trait Decide: Send + Sync {
    async fn decide(&self, request: &DecideRequest) -> Decision;
}

pub struct LocalDecider;

#[async_trait]
impl Decide for LocalDecider {
    async fn decide(&self, request: &DecideRequest) -> Decision {
        decide_local(request)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    amount_in: String,
    quote1_out: String,
    quote1_min_out: String,
    quote2_out: String,
    quote2_min_out: String,
    min_profit: String,
    fee_estimate_in_input_units: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    profitable: bool,
    profit: String,
    conservative_profit: String,
}

struct DeciderChild {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Offloaded decider: a persistent child process speaking one JSON line per
/// request over stdio. Any failure falls back to the in-process computation,
/// which is semantically identical.
pub struct ExternalDecider {
    command: String,
    child: Mutex<Option<DeciderChild>>,
}

impl ExternalDecider {
    pub fn new(command: String) -> Self {
        Self {
            command,
            child: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<DeciderChild, ArbError> {
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ArbError::DeciderError("empty DECIDER_CMD".to_string()))?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArbError::DeciderError(format!("spawn '{}': {e}", self.command)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ArbError::DeciderError("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArbError::DeciderError("no stdout pipe".to_string()))?;
        Ok(DeciderChild {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn roundtrip(&self, request: &DecideRequest) -> Result<Decision, ArbError> {
        let wire = WireRequest {
            amount_in: request.amount_in.to_string(),
            quote1_out: request.leg1_out.to_string(),
            quote1_min_out: request.leg1_min_out.to_string(),
            quote2_out: request.final_out.to_string(),
            quote2_min_out: request.final_min_out.to_string(),
            min_profit: request.min_profit_in_a.to_string(),
            fee_estimate_in_input_units: request.fee_in_a.to_string(),
        };
        let mut line = serde_json::to_string(&wire)
            .map_err(|e| ArbError::DeciderError(format!("encode: {e}")))?;
        line.push('\n');

        let mut guard = self.child.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let child = guard.as_mut().expect("just spawned");

        let result: Result<Decision, ArbError> = async {
            child
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ArbError::DeciderError(format!("write: {e}")))?;
            child
                .stdin
                .flush()
                .await
                .map_err(|e| ArbError::DeciderError(format!("flush: {e}")))?;
            let response = child
                .stdout
                .next_line()
                .await
                .map_err(|e| ArbError::DeciderError(format!("read: {e}")))?
                .ok_or_else(|| ArbError::DeciderError("decider closed stdout".to_string()))?;
            let wire: WireResponse = serde_json::from_str(&response)
                .map_err(|e| ArbError::DeciderError(format!("decode '{response}': {e}")))?;
            Ok(Decision {
                profit: wire
                    .profit
                    .parse()
                    .map_err(|_| ArbError::DeciderError("non-numeric profit".to_string()))?,
                conservative_profit: wire.conservative_profit.parse().map_err(|_| {
                    ArbError::DeciderError("non-numeric conservativeProfit".to_string())
                })?,
                profitable: wire.profitable,
            })
        }
        .await;

        if result.is_err() {
            // Drop the broken child; the next request respawns.
            *guard = None;
        }
        result
    }
}

#[async_trait]
impl Decide for ExternalDecider {
    async fn decide(&self, request: &DecideRequest) -> Decision {
        match self.roundtrip(request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("external decider failed ({e}), falling back to local");
                decide_local(request)
            }
        }
    }
}
