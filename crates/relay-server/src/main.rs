//! # Relay Server
//!
//! WebSocket gateway and server-side WebRTC signaling relay.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-process broker)
//! relay
//!
//! # Run with custom config
//! relay --config /path/to/relay.toml
//!
//! # Run against Kafka (build with `--features kafka`, set `[broker] kind = "kafka"`)
//! relay --config kafka.toml
//!
//! # Run with environment variables
//! RELAY_PORT=8080 RELAY_BROKER__BROKERS=kafka:9092 relay
//! ```

mod config;
mod gateway;
mod metrics;
mod relay;

use anyhow::{Context, Result};
use relay_broker::{ConsumerGroup, ConsumerLoop, Producer, RetryingProducer};
use relay_core::{
    spawn_snapshot_ticker, BroadcastRouter, NegotiationEngine, SessionRegistry, SignalDispatcher,
    WebRtcConnector,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{BrokerConfig, BrokerKind, Config};
use crate::gateway::{AppState, Gateway};
use crate::relay::{Instrumented, ResponseRelay};

/// Broker handles for one process.
struct Broker {
    producer: Arc<dyn Producer>,
    signal_group: Arc<dyn ConsumerGroup>,
    gateway_group: Arc<dyn ConsumerGroup>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "relay=debug,relay_core=debug,relay_broker=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = load_config()?;

    info!("Starting relay server on {}:{}", config.host, config.port);

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!(error = %e, "Failed to start metrics server");
        }
    }

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let broker = connect_broker(&config.broker)?;

    let producer = Arc::new(
        RetryingProducer::new(broker.producer.clone(), config.producer_config())
            .with_cancellation(shutdown.clone()),
    );

    let connector = WebRtcConnector::new(&config.rtc_config())
        .context("Failed to configure WebRTC")?;
    let registry = Arc::new(SessionRegistry::new());
    let engine = NegotiationEngine::new(
        Arc::new(connector),
        registry.clone(),
        producer.clone(),
        config.engine_config(),
        shutdown.clone(),
    );

    let gateway = Arc::new(Gateway::new(
        producer.clone(),
        config.gateway_config(),
        shutdown.clone(),
    ));

    let signal_consumer = Arc::new(ConsumerLoop::new(
        broker.signal_group.clone(),
        Arc::new(Instrumented::new(SignalDispatcher::new(engine.clone()))),
        config.signal_consumer(),
    ));
    let gateway_consumer = Arc::new(ConsumerLoop::new(
        broker.gateway_group.clone(),
        Arc::new(Instrumented::new(ResponseRelay::new(gateway.clone()))),
        config.gateway_consumer(),
    ));

    let mut tasks = JoinSet::new();
    for (name, consumer) in [
        ("signal", signal_consumer.clone()),
        ("gateway", gateway_consumer.clone()),
    ] {
        let cancel = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = consumer.run(cancel.clone()).await {
                error!(consumer = name, error = %e, "Consumer stopped");
                cancel.cancel();
            }
        });
    }

    let ticker = config.broadcast.enabled.then(|| {
        spawn_snapshot_ticker(
            Arc::new(BroadcastRouter::new(registry.clone())),
            Duration::from_millis(config.broadcast.interval_ms),
            shutdown.clone(),
        )
    });
    let sampler = config.metrics.enabled.then(|| {
        metrics::spawn_session_sampler(registry.clone(), Duration::from_secs(1), shutdown.clone())
    });

    let state = Arc::new(AppState {
        gateway: gateway.clone(),
        registry: registry.clone(),
    });
    let app = gateway::router(state, &config.transport.websocket_path);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Server listening on {}", addr);

    tokio::spawn(watch_signals(shutdown.clone()));

    let served = gateway::serve(listener, app, shutdown.clone()).await;
    shutdown.cancel();

    info!("Shutting down");
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Consumer task failed");
        }
    }
    for handle in [ticker, sampler].into_iter().flatten() {
        let _ = handle.await;
    }

    engine.shutdown().await;
    signal_consumer.close().await;
    gateway_consumer.close().await;
    producer.close().await;

    info!("Shutdown complete");
    served
}

/// `--config <path>` reads that file only; otherwise the usual search and
/// `RELAY_*` overrides apply.
fn load_config() -> Result<Config> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            return Config::from_file(path);
        }
    }
    Config::load()
}

fn connect_broker(config: &BrokerConfig) -> Result<Broker> {
    match config.kind {
        BrokerKind::Memory => {
            let broker = relay_broker::MemoryBroker::new(config.partitions.max(1));
            let initial = config.initial_offset.into();
            info!(partitions = config.partitions, "Using in-process broker");
            Ok(Broker {
                producer: Arc::new(broker.clone()),
                signal_group: Arc::new(broker.consumer_group(&config.group_id, initial)),
                gateway_group: Arc::new(broker.consumer_group(&config.gateway_group_id, initial)),
            })
        }
        BrokerKind::Kafka => connect_kafka(config),
    }
}

#[cfg(feature = "kafka")]
fn connect_kafka(config: &BrokerConfig) -> Result<Broker> {
    use relay_broker::{KafkaConfig, KafkaConsumerGroup, KafkaProducer};

    let settings = |group_id: &str| KafkaConfig {
        initial_offset: config.initial_offset.into(),
        ..KafkaConfig::new(config.brokers.as_str(), group_id)
    };

    info!(brokers = %config.brokers, "Using Kafka broker");
    Ok(Broker {
        producer: Arc::new(KafkaProducer::new(&settings(&config.group_id))?),
        signal_group: Arc::new(KafkaConsumerGroup::new(&settings(&config.group_id))?),
        gateway_group: Arc::new(KafkaConsumerGroup::new(&settings(&config.gateway_group_id))?),
    })
}

#[cfg(not(feature = "kafka"))]
fn connect_kafka(_config: &BrokerConfig) -> Result<Broker> {
    anyhow::bail!("Kafka broker requested but the server was built without the `kafka` feature")
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
