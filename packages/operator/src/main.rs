use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_core::{Chain, DirectionalEffect, QuorumEngine};
use futures::FutureExt;
use operator::api::{self, AppState};
use operator::config::Config;
use operator::db;
use operator::ledger::ckb::CkbIndexerClient;
use operator::queue::{PgRelayQueue, RelayQueue};
use operator::relay::{
    EffectResumer, LockCollectHandler, LockRelay, PayoutHandler, QueueConsumer, QuorumHandoff,
    UnlockCollector,
};
use operator::watchers::{
    ckb::CkbEventSource, evm::EvmEventSource, PgWatermarkStore, PollLoop, SubscriberRegistry,
    WatcherManager, WatermarkStore,
};
use operator::writers::retry::with_retry;
use operator::writers::{
    EvmReleaseEffect, PayoutStore, PgPayoutStore, PgReleaseJournal, RetryConfig,
    UnlockRelayEffect, ValidatorSigner,
};

/// Idle delay between queue receives when a queue is empty
const QUEUE_IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between sweeps for quorum effects left pending by a failure
const EFFECT_RESUME_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge operator");

    let config = Config::load()?;
    tracing::info!(
        evm_chain_id = config.evm.chain_id,
        evm_bridge = %config.evm.bridge_address,
        ckb_bridge_type_hash = %config.ckb.bridge_type_hash,
        validators = config.quorum.validators.len(),
        policy = %config.quorum.policy,
        "Configuration loaded"
    );

    let retry = RetryConfig::new(
        config.relayer.retry_attempts,
        Duration::from_millis(config.relayer.retry_delay_ms),
    );

    // The database may come up after the operator
    let pool = with_retry(&retry, |_| db::create_pool(&config.database.url)).await?;
    tracing::info!("Database connected");
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Relay queues
    let queue: Arc<dyn RelayQueue> = Arc::new(PgRelayQueue::with_visibility_timeout(
        pool.clone(),
        config.relayer.visibility_timeout(),
    ));
    let evm_queue = config.relayer.evm_queue_name.clone();
    let ckb_queue = config.relayer.ckb_queue_name.clone();
    queue.ensure_queue(&evm_queue).await?;
    queue.ensure_queue(&ckb_queue).await?;

    // Quorum engine
    let signer = ValidatorSigner::from_private_key(&config.evm.private_key)?;
    let validators = config.quorum.validator_set()?;
    if !validators.contains(&signer.address()) {
        tracing::warn!(
            operator = %signer.address(),
            "Operator key is not in the validator set, its signatures will be rejected"
        );
    }
    let effect = DirectionalEffect {
        lock: Arc::new(EvmReleaseEffect::new(
            &config.evm,
            signer.clone(),
            Arc::new(PgReleaseJournal::new(pool.clone())),
        )?),
        unlock: Arc::new(UnlockRelayEffect::new(queue.clone(), ckb_queue.clone())),
    };
    let policy = config.quorum.policy()?;
    let engine = Arc::new(QuorumEngine::new(
        validators.clone(),
        policy,
        Arc::new(db::PgQuorumStore::new(pool.clone())),
        Arc::new(effect),
    ));

    let watermarks: Arc<dyn WatermarkStore> =
        Arc::new(PgWatermarkStore::new(pool.clone(), signer.address()));
    let payouts: Arc<dyn PayoutStore> = Arc::new(PgPayoutStore::new(pool.clone()));

    // Account-ledger watcher
    let evm_subscribers = Arc::new(SubscriberRegistry::new());
    evm_subscribers
        .subscribe(Arc::new(UnlockCollector::new(engine.clone(), signer.clone())))
        .await;
    evm_subscribers
        .subscribe(Arc::new(QuorumHandoff::new(
            engine.clone(),
            queue.clone(),
            ckb_queue.clone(),
        )))
        .await;
    let evm_loop = PollLoop::new(
        Arc::new(EvmEventSource::new(&config.evm)?),
        evm_subscribers,
        watermarks.clone(),
        config.evm.start_block,
        config.relayer.poll_interval(),
    )
    .with_max_blocks_per_batch(config.relayer.max_blocks_per_batch)
    .with_retry(retry.clone());

    // Cell-ledger watcher
    let ckb_subscribers = Arc::new(SubscriberRegistry::new());
    ckb_subscribers
        .subscribe(Arc::new(LockRelay::new(queue.clone(), evm_queue.clone())))
        .await;
    let ckb_source = CkbEventSource::new(
        Arc::new(CkbIndexerClient::new(&config.ckb.indexer_url)?),
        config.ckb.bridge_identity()?,
        config.ckb.deposit_search_script()?,
        config.ckb.finality_blocks,
    );
    let ckb_loop = PollLoop::new(
        Arc::new(ckb_source),
        ckb_subscribers,
        watermarks.clone(),
        config.ckb.start_block,
        config.relayer.poll_interval(),
    )
    .with_max_blocks_per_batch(config.relayer.max_blocks_per_batch)
    .with_retry(retry.clone());

    // Queue consumers
    let lock_consumer = QueueConsumer::new(
        queue.clone(),
        evm_queue.clone(),
        Arc::new(LockCollectHandler::new(engine.clone(), signer.clone())),
        QUEUE_IDLE_INTERVAL,
    )
    .with_retry(retry.clone());
    let payout_consumer = QueueConsumer::new(
        queue.clone(),
        ckb_queue.clone(),
        Arc::new(PayoutHandler::new(payouts.clone(), validators, policy)),
        QUEUE_IDLE_INTERVAL,
    )
    .with_retry(retry);

    let resumer = EffectResumer::new(engine.clone(), EFFECT_RESUME_INTERVAL);

    let state = AppState {
        engine,
        operator: signer.address(),
        watermarks,
        queue,
        queue_names: vec![evm_queue.clone(), ckb_queue.clone()],
        payouts,
        started_at: Instant::now(),
    };
    let api_addr = config.api.bind_addr;

    let mut manager = WatcherManager::new();
    manager.add_poll_loop(evm_loop);
    manager.add_poll_loop(ckb_loop);
    manager.add_task(
        format!("{}-consumer", Chain::Evm),
        Box::new(|stop| lock_consumer.run(stop).boxed()),
    );
    manager.add_task(
        format!("{}-consumer", Chain::Ckb),
        Box::new(|stop| payout_consumer.run(stop).boxed()),
    );
    manager.add_task(
        "effect-resumer".to_string(),
        Box::new(|stop| resumer.run(stop).boxed()),
    );
    manager.add_task(
        "api".to_string(),
        Box::new(move |stop| api::start_api_server(api_addr, state, stop).boxed()),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(()).await;
    });

    tracing::info!(
        operator = %signer.address(),
        evm_queue = %evm_queue,
        ckb_queue = %ckb_queue,
        tasks = manager.len(),
        "Operator initialized, starting processing"
    );

    let result = manager.run(shutdown_rx).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{:#}", e), "Operator stopped with error");
    }

    tracing::info!("Bridge operator stopped");
    result
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,operator=debug,bridge_core=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
