use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;
use solana_sdk::signature::Signer;
use tokio::sync::watch;

use solana_agg_arb::aggregator::lut::{LookupTableCache, LOOKUP_TABLE_TTL};
use solana_agg_arb::aggregator::{
    JupiterQuoteClient, OpenOceanClient, PrimaryQuoter, SecondaryQuoter, UltraClient,
};
use solana_agg_arb::arbitrage::decider::{Decide, ExternalDecider, LocalDecider};
use solana_agg_arb::arbitrage::executor::Executor;
use solana_agg_arb::arbitrage::fees::FeeConverter;
use solana_agg_arb::arbitrage::jito_client::JitoClient;
use solana_agg_arb::arbitrage::scanner::ScanContext;
use solana_agg_arb::arbitrage::scheduler::Scheduler;
use solana_agg_arb::config::{
    load_pairs, ExecutionProvider, ExecutionStrategy, Mode, Settings,
};
use solana_agg_arb::events::{EventLog, EventType};
use solana_agg_arb::monitoring::health::{self, HealthState};
use solana_agg_arb::rate::{AdaptiveRateLimiter, LimiterConfig, PairBreakers, RetryPolicy};
use solana_agg_arb::solana::{load_keypair, setup_wallet, PriorityFeeEstimator, SolanaRpcClient};

fn setup_logging() -> anyhow::Result<()> {
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}] {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("hyper", log::LevelFilter::Warn)
        .level_for("reqwest", log::LevelFilter::Warn)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    if let Err(e) = setup_logging() {
        eprintln!("logging init failed: {e}");
        return 1;
    }

    let args: Vec<String> = std::env::args().collect();
    let once = args.iter().any(|a| a == "--once");
    let do_setup_wallet = args.iter().any(|a| a == "--setup-wallet");

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("configuration error: {e}");
            return 1;
        }
    };
    let pairs = match load_pairs(Path::new(&settings.pairs_config_path)) {
        Ok(pairs) => pairs,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    let wallet = match load_keypair(&settings.wallet_secret) {
        Ok(keypair) => Arc::new(keypair),
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };
    info!(
        "wallet {} loaded, {} pair(s) configured",
        wallet.pubkey(),
        pairs.len()
    );

    let rpc = Arc::new(SolanaRpcClient::new(
        &settings.rpc_url,
        settings.commitment_config(),
        Duration::from_millis(settings.balance_refresh_ms),
    ));

    if do_setup_wallet {
        return match setup_wallet(&rpc, &wallet, &pairs).await {
            Ok(created) => {
                info!("setup-wallet done, {created} account(s) created");
                0
            }
            Err(e) => {
                error!("setup-wallet failed: {e}");
                1
            }
        };
    }

    let events = Arc::new(EventLog::new(
        settings.event_log_path.clone().map(PathBuf::from),
        settings.event_log_rotate,
        settings.event_log_max_bytes,
        settings.event_log_max_files,
        settings.log_verbose,
    ));

    if settings.execution_provider == ExecutionProvider::Ultra
        && settings.execution_strategy == ExecutionStrategy::Atomic
    {
        warn!("ultra execution requires sequential strategy; ultra candidates will be skipped");
        events
            .emit(
                EventType::Warning,
                json!({"message": "ultra execution requires sequential strategy"}),
            )
            .await;
    }

    let jupiter_limiter = Arc::new(AdaptiveRateLimiter::new(LimiterConfig::from_settings(
        "jupiter",
        &settings.jupiter_rate,
    )));
    let openocean_limiter = Arc::new(AdaptiveRateLimiter::new(LimiterConfig::from_settings(
        "openocean",
        &settings.openocean_rate,
    )));
    let jupiter_retry = RetryPolicy::from_settings(&settings.jupiter_rate);
    let openocean_retry = RetryPolicy::from_settings(&settings.openocean_rate);

    let jupiter = match JupiterQuoteClient::new(
        &settings.jupiter_base_url,
        settings.jupiter_api_key.clone(),
        Duration::from_millis(settings.jupiter_timeout_ms),
        jupiter_limiter.clone(),
        jupiter_retry.clone(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    // Ultra shares the primary quote budget.
    let ultra = if settings.execution_provider == ExecutionProvider::Ultra {
        match UltraClient::new(
            &settings.jupiter_ultra_base_url,
            settings.jupiter_api_key.clone(),
            Duration::from_millis(settings.jupiter_timeout_ms),
            jupiter_limiter.clone(),
            jupiter_retry.clone(),
        ) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("{e}");
                return 1;
            }
        }
    } else {
        None
    };

    let openocean = if settings.openocean_enabled {
        match OpenOceanClient::new(
            &settings.openocean_base_url,
            Duration::from_millis(settings.openocean_timeout_ms),
            openocean_limiter.clone(),
            openocean_retry,
            settings.openocean_referrer.clone(),
            settings.openocean_referrer_fee,
            settings.openocean_enabled_dex_ids.clone(),
            settings.openocean_disabled_dex_ids.clone(),
        ) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("{e}");
                return 1;
            }
        }
    } else {
        None
    };

    let jito = if settings.jito_enabled {
        match JitoClient::new(&settings.jito_block_engine_url, Duration::from_secs(10)) {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                error!("{e}");
                return 1;
            }
        }
    } else {
        None
    };

    let decider: Arc<dyn Decide> = match &settings.decider_cmd {
        Some(cmd) => Arc::new(ExternalDecider::new(cmd.clone())),
        None => Arc::new(LocalDecider),
    };

    let quoter: Arc<dyn PrimaryQuoter> = jupiter.clone();
    let ctx = Arc::new(ScanContext {
        settings: settings.clone(),
        jupiter: quoter.clone(),
        ultra: ultra.clone(),
        openocean: openocean
            .clone()
            .map(|c| c as Arc<dyn SecondaryQuoter>),
        breakers: Arc::new(PairBreakers::new()),
        fee_converter: Arc::new(FeeConverter::new(quoter)),
        decider,
        events: events.clone(),
        wallet: wallet.pubkey(),
    });

    let executor = Arc::new(Executor {
        settings: settings.clone(),
        rpc: rpc.clone(),
        wallet: wallet.clone(),
        jupiter: jupiter.clone(),
        ultra,
        openocean,
        jito,
        lut_cache: Arc::new(LookupTableCache::new(LOOKUP_TABLE_TTL)),
        priority: Arc::new(PriorityFeeEstimator::new(&settings, rpc.clone())),
        events: events.clone(),
    });

    if let Some(port) = settings.health_port {
        health::spawn(
            port,
            Arc::new(HealthState {
                mode: format!("{:?}", settings.mode),
                execution_strategy: format!("{:?}", settings.execution_strategy),
                trigger_strategy: format!("{:?}", settings.trigger_strategy),
                pair_count: pairs.len(),
                limiters: vec![jupiter_limiter.clone(), openocean_limiter.clone()],
            }),
        );
    }

    events
        .emit(
            EventType::Startup,
            json!({
                "pairs": pairs.len(),
                "mode": if settings.mode == Mode::Live { "live" } else { "dry-run" },
                "executionStrategy": format!("{:?}", settings.execution_strategy),
                "executionProvider": format!("{:?}", settings.execution_provider),
                "triggerStrategy": format!("{:?}", settings.trigger_strategy),
                "jito": settings.jito_enabled,
                "openocean": settings.openocean_enabled,
            }),
        )
        .await;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown requested, stopping between scans");
        let _ = stop_tx.send(true);
    });

    let scheduler = Scheduler::new(ctx, executor, pairs);
    let code = match scheduler.run(once, stop_rx).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    events.emit(EventType::Shutdown, json!({"code": code})).await;
    code
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("SIGTERM handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
