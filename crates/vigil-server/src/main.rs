mod config;
mod telemetry;

use config::ServiceConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry::init_telemetry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vigil_api::{AppState, RateLimiter};
use vigil_bus::EventBus;
use vigil_detect::{DetectorRegistry, RegistryConfig};
use vigil_mqtt::{MqttBridge, MqttBridgeConfig};
use vigil_pipeline::{IngestionPipeline, PipelineConfig};
use vigil_postgres::{
    PostgresAnomalyRepository, PostgresClient, PostgresConfig, PostgresDeviceRepository,
    PostgresPointRepository,
};
use vigil_runner::Runner;

#[tokio::main]
async fn main() {
    let config = match ServiceConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config.log_level) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!(
        engine = %config.anomaly_engine,
        mqtt_enabled = config.mqtt_enable,
        "starting vigil server"
    );
    if config.ingest_api_key.is_none() {
        warn!("INGEST_API_KEY is not set, the ingest endpoint is open");
    }

    // Persistence: startup is fatal when the store stays unreachable.
    let store = match initialize_store(&config).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to initialize store: {:#}", e);
            std::process::exit(1);
        }
    };

    let engine = match config.engine() {
        Ok(engine) => engine,
        Err(e) => {
            error!("Invalid anomaly engine configuration: {}", e);
            std::process::exit(1);
        }
    };
    let registry = match DetectorRegistry::new(RegistryConfig {
        engine,
        window_size: config.anomaly_window_size,
        zscore_threshold: config.zscore_threshold,
        threshold_percentile: config.anomaly_threshold_percentile,
        external_url: config.external_ml_url.clone(),
        external_timeout: config.external_ml_timeout(),
        external_batch_size: config.external_ml_batch_size,
    }) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to initialize detector registry: {:#}", e);
            std::process::exit(1);
        }
    };

    let addr: SocketAddr = match format!("{}:{}", config.http_host, config.http_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid HTTP bind address: {}", e);
            std::process::exit(1);
        }
    };

    let devices = Arc::new(PostgresDeviceRepository::new(store.clone()));
    let points = Arc::new(PostgresPointRepository::new(store.clone()));
    let anomalies = Arc::new(PostgresAnomalyRepository::new(store.clone()));
    let bus = Arc::new(EventBus::new(config.event_queue_capacity));

    // The pipeline owns its own token: edges stop first, then the closer
    // drains the device workers within the grace period.
    let pipeline_token = CancellationToken::new();
    let pipeline = Arc::new(IngestionPipeline::new(
        devices.clone(),
        points.clone(),
        anomalies.clone(),
        registry,
        bus.clone(),
        PipelineConfig {
            auto_provision: config.allow_auto_device,
            worker_idle_timeout: config.worker_idle_timeout(),
            ..Default::default()
        },
        pipeline_token,
    ));

    let state = AppState {
        pipeline: pipeline.clone(),
        devices,
        points,
        anomalies,
        store: Arc::new(store),
        bus,
        engine,
        api_key: config.ingest_api_key.clone(),
        rate_limiter: Arc::new(RateLimiter::new(config.ingest_rate_limit_per_min)),
    };

    let mut runner = Runner::new()
        .with_grace_period(config.shutdown_grace())
        .with_named_process("api_server", {
            let state = state.clone();
            move |ctx| vigil_api::serve(state, addr, ctx)
        });

    if config.mqtt_enable {
        let bridge = MqttBridge::new(
            pipeline.clone(),
            MqttBridgeConfig {
                broker_url: config.mqtt_broker_url.clone(),
                batch_size: config.mqtt_batch_size,
                flush_interval: Duration::from_millis(500),
                reconnect_delay: Duration::from_secs(5),
            },
        );
        runner = runner.with_named_process("mqtt_bridge", move |ctx| bridge.run(ctx));
    }

    runner = runner.with_closer(move || async move {
        pipeline.shutdown().await;
        Ok(())
    });

    runner.run().await;
}

/// Connect, verify and prepare the store, retrying connectivity a few times
/// before giving up.
async fn initialize_store(config: &ServiceConfig) -> anyhow::Result<PostgresClient> {
    let client = PostgresClient::new(&PostgresConfig {
        host: config.postgres_host.clone(),
        port: config.postgres_port,
        database: config.postgres_database.clone(),
        username: config.postgres_username.clone(),
        password: config.postgres_password.clone(),
        pool_size: config.postgres_pool_size,
    })?;

    let mut delay = Duration::from_secs(1);
    for attempt in 1..=5u32 {
        match client.ping().await {
            Ok(()) => {
                client.ensure_schema().await?;
                info!("store initialized");
                return Ok(client);
            }
            Err(e) if attempt < 5 => {
                warn!(attempt, error = %e, "store unreachable, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e.context("store unreachable after retry budget")),
        }
    }
    unreachable!("retry loop always returns")
}
