//! weft-worker – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing.
//! 3. Connect the container runtime, storage and ledger clients.
//! 4. Wire the broker (NSQ or in-process) into the dispatcher.
//! 5. Start the ingestion relay, then consume until a shutdown signal.

mod config;

use std::sync::Arc;

use tracing::{info, warn};

use weft_broker::{BrokerKind, MemBroker, NsqConsumer, NsqProducer, Producer, Topic};
use weft_clients::{Ledger, LedgerHttp, Storage, StorageHttp};
use weft_compute::{Dispatcher, Relay, Subscription, TaskHandler, TopicConfig, Worker};
use weft_runtime::{ContainerRuntime, DockerRuntime};

use crate::config::Config;

/// NSQ channel shared by every worker of the platform: tasks are load
/// balanced across workers rather than broadcast.
const COMPUTE_CHANNEL: &str = "compute";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ─────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ───────────────────────────────────────────────────────────
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| cfg.log_level.parse::<tracing_subscriber::EnvFilter>())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "weft-worker starting");

    // ── 3. Service clients ───────────────────────────────────────────────────
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(cfg.docker_timeout)?);
    let storage: Arc<dyn Storage> = Arc::new(StorageHttp::new(
        &cfg.storage_host,
        cfg.storage_port,
        &cfg.storage_user,
        &cfg.storage_password,
    ));
    let ledger: Arc<dyn Ledger> = Arc::new(LedgerHttp::new(
        &cfg.ledger_host,
        cfg.ledger_port,
        &cfg.ledger_user,
        &cfg.ledger_password,
    ));

    let worker = Arc::new(Worker::new(
        cfg.data_root.clone(),
        runtime,
        storage,
        Arc::clone(&ledger),
    ));
    info!(worker_id = %worker.id(), data_root = %cfg.data_root, "worker ready");

    // ── 4. Broker wiring ─────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(worker as Arc<dyn TaskHandler>, cfg.drain_deadline);
    let shutdown = dispatcher.shutdown_token();

    let learn_config = TopicConfig {
        parallelism: cfg.learn_parallelism,
        timeout: cfg.learn_timeout,
    };
    let predict_config = TopicConfig {
        parallelism: cfg.predict_parallelism,
        timeout: cfg.predict_timeout,
    };

    let (subscriptions, relay_producer): (Vec<Subscription>, Arc<dyn Producer>) = match cfg.broker {
        BrokerKind::Nsq => {
            let train = NsqConsumer::connect(
                Topic::Train,
                COMPUTE_CHANNEL,
                &cfg.nsqlookupd_urls,
                cfg.learn_parallelism as u32,
            )?;
            let predict = NsqConsumer::connect(
                Topic::Predict,
                COMPUTE_CHANNEL,
                &cfg.nsqlookupd_urls,
                cfg.predict_parallelism as u32,
            )?;
            let producer = Arc::new(NsqProducer::connect(&cfg.broker_host, cfg.broker_port)?);
            info!(
                host = %cfg.broker_host,
                port = cfg.broker_port,
                lookupd = ?cfg.nsqlookupd_urls,
                "connected to NSQ"
            );
            (
                vec![
                    Subscription {
                        topic: Topic::Train,
                        consumer: Box::new(train),
                        config: learn_config,
                    },
                    Subscription {
                        topic: Topic::Predict,
                        consumer: Box::new(predict),
                        config: predict_config,
                    },
                ],
                producer,
            )
        }
        BrokerKind::Mem => {
            // In-process loop: the relay publishes straight into the
            // dispatcher's queues.  Useful for development and testing.
            warn!("using in-process broker; tasks are only visible inside this process");
            let broker = MemBroker::new();
            (
                vec![
                    Subscription {
                        topic: Topic::Train,
                        consumer: Box::new(broker.consumer(Topic::Train)),
                        config: learn_config,
                    },
                    Subscription {
                        topic: Topic::Predict,
                        consumer: Box::new(broker.consumer(Topic::Predict)),
                        config: predict_config,
                    },
                ],
                broker,
            )
        }
    };

    // ── 5. Relay ─────────────────────────────────────────────────────────────
    if cfg.relay_enabled {
        let relay = Relay::new(Arc::clone(&ledger), relay_producer, cfg.relay_period);
        tokio::spawn(relay.run(shutdown.clone()));
    }

    // ── 6. Consume until killed ──────────────────────────────────────────────
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_shutdown.cancel();
    });

    dispatcher.run(subscriptions).await;
    info!("weft-worker stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; draining in-flight tasks");
}
