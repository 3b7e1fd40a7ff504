//! Sensor Engine
//!
//! Consumes events from the configured event bus, correlates them against
//! the trigger dependency expressions of one sensor and enqueues a trigger
//! job to Redis whenever an expression is satisfied.

use anyhow::{Context, Result};
use sensor_engine::queue::RedisJobQueue;
use sensor_engine::sensor::{forward_reset_signals, run_sensor};
use sensor_engine::SensorDriver;
use shared::{BusConfig, SensorConfig, SensorSpec};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    shared::init_tracing();

    tracing::info!("Starting Sensor Engine...");

    // Load configuration
    let config = SensorConfig::from_env().context("Failed to load configuration")?;

    let spec = SensorSpec::load(&config.spec_path)
        .with_context(|| format!("Failed to load sensor spec from {}", config.spec_path))?;
    if spec.name != config.sensor_name {
        tracing::warn!(
            configured = %config.sensor_name,
            spec = %spec.name,
            "SENSOR_NAME differs from the sensor spec name"
        );
    }

    // Create Redis connection
    let redis_conn = shared::redis::create_client(&config.redis.connection_url())
        .await
        .context("Failed to connect to Redis")?;

    tracing::info!("Connected to Redis");

    let mut driver = sensor_engine::sensor_driver(&config, spec.clone(), redis_conn.clone())
        .await
        .context("Failed to create sensor driver")?;
    driver
        .initialize()
        .await
        .context("Failed to initialize sensor driver")?;

    let default_subject = match &config.eventbus {
        BusConfig::Stan(stan) => Some(stan.subject.clone()),
        _ => None,
    };

    let cancel = CancellationToken::new();
    let (resets, _) = broadcast::channel(1);

    tokio::spawn({
        let resets = resets.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = forward_reset_signals(resets, cancel).await {
                tracing::warn!("Condition reset signal unavailable: {:#}", e);
            }
        }
    });

    let sensor_handle = tokio::spawn({
        let driver: Arc<dyn SensorDriver> = Arc::from(driver);
        let queue = Arc::new(RedisJobQueue::new(redis_conn));
        let cancel = cancel.clone();
        async move { run_sensor(driver, &spec, queue, default_subject, resets, cancel).await }
    });
    tokio::pin!(sensor_handle);

    // Wait for either shutdown signal OR sensor failure
    tokio::select! {
        result = signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutdown signal received, stopping Sensor Engine...");
            cancel.cancel();
        }
        result = &mut sensor_handle => {
            return match result {
                Ok(Ok(())) => {
                    tracing::warn!("Sensor exited cleanly (unexpected)");
                    Ok(())
                }
                Ok(Err(e)) => {
                    tracing::error!("Sensor failed: {:#}", e);
                    Err(e.context("Sensor failed"))
                }
                Err(e) => {
                    tracing::error!("Sensor task panicked: {}", e);
                    anyhow::bail!("Sensor task panicked: {}", e);
                }
            };
        }
    }

    // Let subscriptions commit and flush before exiting
    match sensor_handle.await {
        Ok(result) => result.context("Sensor failed during shutdown"),
        Err(e) => anyhow::bail!("Sensor task panicked: {}", e),
    }
}
