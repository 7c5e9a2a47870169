use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use solana_sdk::commitment_config::CommitmentConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    DryRun,
    Live,
}

impl Mode {
    pub fn is_live(&self) -> bool {
        matches!(self, Mode::Live)
    }
}

impl FromStr for Mode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dry-run" => Ok(Mode::DryRun),
            "live" => Ok(Mode::Live),
            other => Err(format!("invalid MODE '{other}', expected dry-run|live")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Default,
    Hft,
}

impl FromStr for Profile {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Profile::Default),
            "hft" => Ok(Profile::Hft),
            other => Err(format!("invalid PROFILE '{other}', expected default|hft")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStrategy {
    Atomic,
    Sequential,
}

impl FromStr for ExecutionStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(ExecutionStrategy::Atomic),
            "sequential" => Ok(ExecutionStrategy::Sequential),
            other => Err(format!(
                "invalid EXECUTION_STRATEGY '{other}', expected atomic|sequential"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionProvider {
    Swap,
    Ultra,
}

impl FromStr for ExecutionProvider {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swap" => Ok(ExecutionProvider::Swap),
            "ultra" => Ok(ExecutionProvider::Ultra),
            other => Err(format!(
                "invalid EXECUTION_PROVIDER '{other}', expected swap|ultra"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerStrategyKind {
    Immediate,
    AvgWindow,
    Vwap,
    Bollinger,
}

impl FromStr for TriggerStrategyKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(TriggerStrategyKind::Immediate),
            "avg-window" => Ok(TriggerStrategyKind::AvgWindow),
            "vwap" => Ok(TriggerStrategyKind::Vwap),
            "bollinger" => Ok(TriggerStrategyKind::Bollinger),
            other => Err(format!(
                "invalid TRIGGER_STRATEGY '{other}', expected immediate|avg-window|vwap|bollinger"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmountMode {
    All,
    Fixed,
    Rotate,
}

impl FromStr for AmountMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(AmountMode::All),
            "fixed" => Ok(AmountMode::Fixed),
            "rotate" => Ok(AmountMode::Rotate),
            other => Err(format!(
                "invalid AMOUNT_MODE '{other}', expected all|fixed|rotate"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityFeeStrategy {
    Off,
    RpcRecent,
    Helius,
}

impl FromStr for PriorityFeeStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(PriorityFeeStrategy::Off),
            "rpc-recent" => Ok(PriorityFeeStrategy::RpcRecent),
            "helius" => Ok(PriorityFeeStrategy::Helius),
            other => Err(format!(
                "invalid PRIORITY_FEE_STRATEGY '{other}', expected off|rpc-recent|helius"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TipMode {
    Fixed,
    Dynamic,
}

impl FromStr for TipMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(TipMode::Fixed),
            "dynamic" => Ok(TipMode::Dynamic),
            other => Err(format!(
                "invalid JITO_TIP_MODE '{other}', expected fixed|dynamic"
            )),
        }
    }
}

/// Rate-limit knobs for one upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamRateSettings {
    pub rps: f64,
    pub burst: f64,
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub penalty_ms: u64,
    pub recovery_every_ms: u64,
    pub recovery_step_rps: f64,
    pub cooldown_429_ms: u64,
}

impl UpstreamRateSettings {
    /// Requested rps, further capped by the minimum spacing between calls.
    pub fn effective_rps(&self) -> f64 {
        if self.min_interval_ms == 0 {
            self.rps
        } else {
            self.rps.min(1000.0 / self.min_interval_ms as f64)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Solana endpoint
    pub rpc_url: String,
    pub ws_url: Option<String>,
    pub commitment: String,
    pub wallet_secret: String,

    // Run shape
    pub mode: Mode,
    pub profile: Profile,
    pub execution_strategy: ExecutionStrategy,
    pub execution_provider: ExecutionProvider,
    pub pairs_config_path: String,
    pub poll_interval_ms: u64,
    pub pair_concurrency: usize,
    pub max_errors_before_exit: u64,
    pub max_consecutive_errors_before_exit: u64,
    pub min_balance_lamports: u64,
    pub balance_refresh_ms: u64,

    // Dry-run / preflight
    pub dry_run_simulate: bool,
    pub live_preflight_simulate: bool,

    // Trigger
    pub trigger_strategy: TriggerStrategyKind,
    pub observe_ms: u64,
    pub observe_interval_ms: u64,
    pub execute_ms: u64,
    pub execute_interval_ms: u64,
    pub trigger_alpha: f64,
    pub bollinger_k: f64,
    pub min_samples: u32,
    pub target_ppm: f64,
    pub trail_drop_ppm: f64,
    pub trail_lookback: u32,
    pub emergency_sigma: f64,
    pub amount_mode: AmountMode,
    pub max_amounts_per_tick: usize,

    // Fees & compute budget
    pub base_fee_lamports: u64,
    pub rent_buffer_lamports: u64,
    pub cu_limit: u32,
    pub cu_price_micro_lamports: u64,
    pub priority_fee_strategy: PriorityFeeStrategy,
    pub priority_fee_level: String,
    pub helius_api_url: Option<String>,

    // Jito
    pub jito_enabled: bool,
    pub jito_block_engine_url: String,
    pub jito_tip_account: Option<String>,
    pub jito_tip_mode: TipMode,
    pub jito_tip_lamports: u64,
    pub jito_tip_bps: u64,
    pub jito_min_tip_lamports: u64,
    pub jito_max_tip_lamports: u64,
    pub jito_wait_ms: u64,
    pub jito_fallback_rpc: bool,

    // Jupiter
    pub jupiter_base_url: String,
    pub jupiter_ultra_base_url: String,
    pub jupiter_api_key: Option<String>,
    pub jupiter_timeout_ms: u64,
    pub jupiter_rate: UpstreamRateSettings,

    // OpenOcean
    pub openocean_enabled: bool,
    pub openocean_base_url: String,
    pub openocean_timeout_ms: u64,
    pub openocean_rate: UpstreamRateSettings,
    pub openocean_jupiter_gate_bps: i64,
    pub openocean_jupiter_near_gate_bps: i64,
    pub openocean_every_n_ticks: u32,
    pub openocean_observe: bool,
    pub openocean_execute: bool,
    pub openocean_sigs_estimate: u64,
    pub openocean_referrer: Option<String>,
    pub openocean_referrer_fee: Option<f64>,
    pub openocean_enabled_dex_ids: Option<String>,
    pub openocean_disabled_dex_ids: Option<String>,

    // External decider
    pub decider_cmd: Option<String>,

    // Event log
    pub event_log_path: Option<String>,
    pub event_log_rotate: bool,
    pub event_log_max_bytes: u64,
    pub event_log_max_files: u32,
    pub log_verbose: bool,

    // Health endpoint
    pub health_port: Option<u16>,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|s| matches!(s.as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn upstream_rate(prefix: &str, default_rps: f64) -> UpstreamRateSettings {
    UpstreamRateSettings {
        rps: env_parse(&format!("{prefix}_RPS"), default_rps),
        burst: env_parse(&format!("{prefix}_BURST"), 2.0_f64).max(1.0),
        min_interval_ms: env_parse(&format!("{prefix}_MIN_INTERVAL_MS"), 0u64),
        max_attempts: env_parse(&format!("{prefix}_MAX_ATTEMPTS"), 4u32),
        backoff_base_ms: env_parse(&format!("{prefix}_BACKOFF_BASE_MS"), 250u64),
        backoff_max_ms: env_parse(&format!("{prefix}_BACKOFF_MAX_MS"), 4_000u64),
        penalty_ms: env_parse(&format!("{prefix}_PENALTY_MS"), 10_000u64).max(1_000),
        recovery_every_ms: env_parse(&format!("{prefix}_RECOVERY_EVERY_MS"), 5_000u64).max(1_000),
        recovery_step_rps: env_parse(&format!("{prefix}_RECOVERY_STEP_RPS"), 0.1_f64),
        cooldown_429_ms: env_parse(&format!("{prefix}_429_COOLDOWN_MS"), 30_000u64),
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, String> {
        let rpc_url =
            env::var("SOLANA_RPC_URL").map_err(|_| "SOLANA_RPC_URL must be set".to_string())?;
        let wallet_secret =
            env::var("WALLET_SECRET_KEY").map_err(|_| "WALLET_SECRET_KEY must be set".to_string())?;

        let commitment = env_or("SOLANA_COMMITMENT", "confirmed");
        if !matches!(commitment.as_str(), "processed" | "confirmed" | "finalized") {
            return Err(format!(
                "invalid SOLANA_COMMITMENT '{commitment}', expected processed|confirmed|finalized"
            ));
        }

        let profile: Profile = env_or("PROFILE", "default").parse()?;

        let mut settings = Settings {
            rpc_url,
            ws_url: env::var("SOLANA_WS_URL").ok(),
            commitment,
            wallet_secret,

            mode: env_or("MODE", "dry-run").parse()?,
            profile,
            execution_strategy: env_or("EXECUTION_STRATEGY", "atomic").parse()?,
            execution_provider: env_or("EXECUTION_PROVIDER", "swap").parse()?,
            pairs_config_path: env_or("PAIRS_CONFIG", "pairs.json"),
            poll_interval_ms: env_parse("POLL_INTERVAL_MS", 5_000u64),
            pair_concurrency: env_parse("PAIR_CONCURRENCY", 2usize).max(1),
            max_errors_before_exit: env_parse("MAX_ERRORS_BEFORE_EXIT", 0u64),
            max_consecutive_errors_before_exit: env_parse(
                "MAX_CONSECUTIVE_ERRORS_BEFORE_EXIT",
                0u64,
            ),
            min_balance_lamports: env_parse("MIN_BALANCE_LAMPORTS", 0u64),
            balance_refresh_ms: env_parse("BALANCE_REFRESH_MS", 30_000u64),

            dry_run_simulate: env_bool("DRY_RUN_SIMULATE", false),
            live_preflight_simulate: env_bool("LIVE_PREFLIGHT_SIMULATE", true),

            trigger_strategy: env_or("TRIGGER_STRATEGY", "immediate").parse()?,
            observe_ms: env_parse("TRIGGER_OBSERVE_MS", 30_000u64),
            observe_interval_ms: env_parse("TRIGGER_OBSERVE_INTERVAL_MS", 1_000u64).max(1),
            execute_ms: env_parse("TRIGGER_EXECUTE_MS", 10_000u64),
            execute_interval_ms: env_parse("TRIGGER_EXECUTE_INTERVAL_MS", 500u64).max(1),
            trigger_alpha: env_parse("TRIGGER_ALPHA", 0.0_f64),
            bollinger_k: env_parse("TRIGGER_BOLLINGER_K", 1.5_f64),
            min_samples: env_parse("TRIGGER_MIN_SAMPLES", 10u32),
            target_ppm: env_parse("TRIGGER_TARGET_PPM", 0.0_f64),
            trail_drop_ppm: env_parse("TRIGGER_TRAIL_DROP_PPM", 100.0_f64),
            trail_lookback: env_parse("TRIGGER_LOOKBACK", 2u32).max(1),
            emergency_sigma: env_parse("TRIGGER_EMERGENCY_SIGMA", 0.0_f64),
            amount_mode: env_or("AMOUNT_MODE", "all").parse()?,
            max_amounts_per_tick: env_parse("MAX_AMOUNTS_PER_TICK", 1usize).max(1),

            base_fee_lamports: env_parse("BASE_FEE_LAMPORTS", 5_000u64),
            rent_buffer_lamports: env_parse("RENT_BUFFER_LAMPORTS", 0u64),
            cu_limit: env_parse("CU_LIMIT", 600_000u32),
            cu_price_micro_lamports: env_parse("CU_PRICE_MICRO_LAMPORTS", 0u64),
            priority_fee_strategy: env_or("PRIORITY_FEE_STRATEGY", "off").parse()?,
            priority_fee_level: env_or("PRIORITY_FEE_LEVEL", "medium"),
            helius_api_url: env::var("HELIUS_API_URL").ok(),

            jito_enabled: env_bool("JITO_ENABLED", false),
            jito_block_engine_url: env_or(
                "JITO_BLOCK_ENGINE_URL",
                "https://mainnet.block-engine.jito.wtf",
            ),
            jito_tip_account: env::var("JITO_TIP_ACCOUNT").ok(),
            jito_tip_mode: env_or("JITO_TIP_MODE", "fixed").parse()?,
            jito_tip_lamports: env_parse("JITO_TIP_LAMPORTS", 10_000u64),
            jito_tip_bps: env_parse("JITO_TIP_BPS", 0u64),
            jito_min_tip_lamports: env_parse("JITO_MIN_TIP_LAMPORTS", 1_000u64),
            jito_max_tip_lamports: env_parse("JITO_MAX_TIP_LAMPORTS", 1_000_000u64),
            jito_wait_ms: env_parse("JITO_WAIT_MS", 0u64),
            jito_fallback_rpc: env_bool("JITO_FALLBACK_RPC", false),

            jupiter_base_url: env_or("JUPITER_BASE_URL", "https://lite-api.jup.ag/swap/v1"),
            jupiter_ultra_base_url: env_or("JUPITER_ULTRA_BASE_URL", "https://lite-api.jup.ag/ultra"),
            jupiter_api_key: env::var("JUPITER_API_KEY").ok(),
            jupiter_timeout_ms: env_parse("JUPITER_TIMEOUT_MS", 10_000u64),
            jupiter_rate: upstream_rate("JUPITER", 1.0),

            openocean_enabled: env_bool("OPENOCEAN_ENABLED", false),
            openocean_base_url: env_or(
                "OPENOCEAN_BASE_URL",
                "https://open-api.openocean.finance/v4/solana",
            ),
            openocean_timeout_ms: env_parse("OPENOCEAN_TIMEOUT_MS", 20_000u64),
            openocean_rate: upstream_rate("OPENOCEAN", 0.5),
            openocean_jupiter_gate_bps: env_parse("OPENOCEAN_JUPITER_GATE_BPS", -50i64),
            openocean_jupiter_near_gate_bps: env_parse("OPENOCEAN_JUPITER_NEAR_GATE_BPS", 0i64),
            openocean_every_n_ticks: env_parse("OPENOCEAN_EVERY_N_TICKS", 1u32).max(1),
            openocean_observe: env_bool("OPENOCEAN_OBSERVE", true),
            openocean_execute: env_bool("OPENOCEAN_EXECUTE", true),
            openocean_sigs_estimate: env_parse("OPENOCEAN_SIGS_ESTIMATE", 3u64),
            openocean_referrer: env::var("OPENOCEAN_REFERRER").ok(),
            openocean_referrer_fee: env::var("OPENOCEAN_REFERRER_FEE")
                .ok()
                .and_then(|s| s.parse().ok()),
            openocean_enabled_dex_ids: env::var("OPENOCEAN_ENABLED_DEX_IDS").ok(),
            openocean_disabled_dex_ids: env::var("OPENOCEAN_DISABLED_DEX_IDS").ok(),

            decider_cmd: env::var("DECIDER_CMD").ok(),

            event_log_path: env::var("EVENT_LOG_PATH").ok(),
            event_log_rotate: env_bool("EVENT_LOG_ROTATE", false),
            event_log_max_bytes: env_parse("EVENT_LOG_MAX_BYTES", 50 * 1024 * 1024u64),
            event_log_max_files: env_parse("EVENT_LOG_MAX_FILES", 5u32),
            log_verbose: env_bool("LOG_VERBOSE", profile != Profile::Hft),

            health_port: env::var("HEALTH_PORT").ok().and_then(|s| s.parse().ok()),
        };

        if settings.profile == Profile::Hft {
            // hft trades second opinions for quote budget
            settings.openocean_observe = false;
            settings.openocean_every_n_ticks = settings.openocean_every_n_ticks.max(2);
        }

        Ok(settings)
    }

    pub fn commitment_config(&self) -> CommitmentConfig {
        match self.commitment.as_str() {
            "processed" => CommitmentConfig::processed(),
            "finalized" => CommitmentConfig::finalized(),
            _ => CommitmentConfig::confirmed(),
        }
    }

    /// Defaults suitable for unit tests; no env access.
    pub fn test_default() -> Self {
        let rate = UpstreamRateSettings {
            rps: 1.0,
            burst: 2.0,
            min_interval_ms: 0,
            max_attempts: 4,
            backoff_base_ms: 250,
            backoff_max_ms: 4_000,
            penalty_ms: 10_000,
            recovery_every_ms: 5_000,
            recovery_step_rps: 0.1,
            cooldown_429_ms: 30_000,
        };
        Settings {
            rpc_url: "http://localhost:8899".to_string(),
            ws_url: None,
            commitment: "confirmed".to_string(),
            wallet_secret: String::new(),
            mode: Mode::DryRun,
            profile: Profile::Default,
            execution_strategy: ExecutionStrategy::Atomic,
            execution_provider: ExecutionProvider::Swap,
            pairs_config_path: "pairs.json".to_string(),
            poll_interval_ms: 5_000,
            pair_concurrency: 2,
            max_errors_before_exit: 0,
            max_consecutive_errors_before_exit: 0,
            min_balance_lamports: 0,
            balance_refresh_ms: 30_000,
            dry_run_simulate: false,
            live_preflight_simulate: true,
            trigger_strategy: TriggerStrategyKind::Immediate,
            observe_ms: 30_000,
            observe_interval_ms: 1_000,
            execute_ms: 10_000,
            execute_interval_ms: 500,
            trigger_alpha: 0.0,
            bollinger_k: 1.5,
            min_samples: 10,
            target_ppm: 0.0,
            trail_drop_ppm: 100.0,
            trail_lookback: 2,
            emergency_sigma: 0.0,
            amount_mode: AmountMode::All,
            max_amounts_per_tick: 1,
            base_fee_lamports: 5_000,
            rent_buffer_lamports: 0,
            cu_limit: 600_000,
            cu_price_micro_lamports: 0,
            priority_fee_strategy: PriorityFeeStrategy::Off,
            priority_fee_level: "medium".to_string(),
            helius_api_url: None,
            jito_enabled: false,
            jito_block_engine_url: "https://mainnet.block-engine.jito.wtf".to_string(),
            jito_tip_account: None,
            jito_tip_mode: TipMode::Fixed,
            jito_tip_lamports: 10_000,
            jito_tip_bps: 0,
            jito_min_tip_lamports: 1_000,
            jito_max_tip_lamports: 1_000_000,
            jito_wait_ms: 0,
            jito_fallback_rpc: false,
            jupiter_base_url: "https://lite-api.jup.ag/swap/v1".to_string(),
            jupiter_ultra_base_url: "https://lite-api.jup.ag/ultra".to_string(),
            jupiter_api_key: None,
            jupiter_timeout_ms: 10_000,
            jupiter_rate: rate.clone(),
            openocean_enabled: false,
            openocean_base_url: "https://open-api.openocean.finance/v4/solana".to_string(),
            openocean_timeout_ms: 20_000,
            openocean_rate: rate,
            openocean_jupiter_gate_bps: -50,
            openocean_jupiter_near_gate_bps: 0,
            openocean_every_n_ticks: 1,
            openocean_observe: true,
            openocean_execute: true,
            openocean_sigs_estimate: 3,
            openocean_referrer: None,
            openocean_referrer_fee: None,
            openocean_enabled_dex_ids: None,
            openocean_disabled_dex_ids: None,
            decider_cmd: None,
            event_log_path: None,
            event_log_rotate: false,
            event_log_max_bytes: 50 * 1024 * 1024,
            event_log_max_files: 5,
            log_verbose: true,
            health_port: None,
        }
    }
}
