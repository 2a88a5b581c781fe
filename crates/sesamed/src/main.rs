use anyhow::{Context, Result};
use sesame_core::{EmbeddingExtractor, ExtractorRegistry, HashedExtractor, OnnxExtractor};
use sesame_hw::{GpioInputLine, GpioOutputLine, InputLine, Level, LogOnlyOutputLine, OutputLine, UsbCamera};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod actuator;
mod cache;
mod config;
mod dbus_interface;
mod override_input;
mod pipeline;
mod sync;

use actuator::spawn_actuator;
use cache::EnrollmentCache;
use config::Config;
use override_input::spawn_override_listener;
use pipeline::FramePipeline;
use sync::{spawn_event_reporter, SyncClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("sesamed starting");

    // Configuration errors are fatal; nothing defaults silently.
    let config = Config::from_env().context("configuration")?;

    // Cache first: everything downstream reads it.
    let cache = Arc::new(EnrollmentCache::load(&config.cache_path, config.embedding_dim));

    let extractor = select_extractor(&config).context("extractor selection")?;
    if extractor.embedding_dim() != config.embedding_dim {
        anyhow::bail!(
            "extractor '{}' produces {}-dim embeddings, deployment is configured for {}",
            extractor.name(),
            extractor.embedding_dim(),
            config.embedding_dim
        );
    }
    tracing::info!(
        backend = extractor.name(),
        dim = extractor.embedding_dim(),
        "extractor selected"
    );

    // Actuator owns the lock line and forces it locked before anything
    // else can run.
    let lock_line = open_lock_line(&config);
    let (actuator, actuator_task) = spawn_actuator(
        lock_line,
        Duration::from_millis(config.lock_pulse_ms),
        Duration::from_millis(config.relock_debounce_ms),
    );

    let override_task = match GpioInputLine::open(
        &config.gpio_chip,
        config.override_pin,
        "sesame-override",
        config.override_pull_up,
        config.override_active_low,
    ) {
        Ok(line) => {
            let line: Arc<dyn InputLine> = Arc::new(line);
            Some(spawn_override_listener(
                line,
                actuator.clone(),
                Duration::from_millis(config.override_debounce_ms),
            ))
        }
        Err(e) => {
            tracing::warn!(error = %e, "override input unavailable, exit button disabled");
            None
        }
    };

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()
        .context("http client")?;

    let (sync_client, sync_status) = SyncClient::new(
        http.clone(),
        &config.api_base_url,
        &config.device_id,
        config.token.clone(),
        cache.clone(),
        Duration::from_secs(config.sync_interval_secs),
        Duration::from_secs(config.sync_backoff_max_secs),
    );
    // Held until shutdown: the sync loop treats a closed nudge channel as
    // a stop request.
    let (sync_now_tx, sync_now_rx) = tokio::sync::mpsc::channel(1);
    let sync_task = tokio::spawn(sync_client.run(sync_now_rx));

    let (events, events_task) = spawn_event_reporter(
        http,
        &config.api_base_url,
        &config.device_id,
        config.token.clone(),
    );

    // Observability surface; the agent runs fine without a bus.
    let _dbus = match dbus_interface::serve(
        cache.clone(),
        sync_status,
        sync_now_tx.clone(),
        Duration::from_secs(config.sync_interval_secs * 3),
    )
    .await
    {
        Ok(connection) => Some(connection),
        Err(e) => {
            tracing::warn!(error = %e, "D-Bus interface unavailable");
            None
        }
    };

    // Camera last among resources: a missing device is fatal at startup.
    let camera = UsbCamera::open(&config.camera_device).context("camera")?;

    let stop = Arc::new(AtomicBool::new(false));
    let pipeline_thread = FramePipeline {
        source: Box::new(camera),
        extractor,
        cache: cache.clone(),
        actuator: actuator.clone(),
        events,
        device_id: config.device_id.clone(),
        threshold: config.threshold,
        cooldown: Duration::from_secs(config.match_cooldown_secs),
    }
    .spawn(stop.clone());

    tracing::info!("sesamed ready");
    shutdown_signal().await;
    tracing::info!("sesamed shutting down");

    // Stop producers first, then the actuator, then flush the cache.
    stop.store(true, Ordering::Relaxed);
    if let Some(task) = override_task {
        task.abort();
    }
    sync_task.abort();
    tokio::task::spawn_blocking(move || {
        if pipeline_thread.join().is_err() {
            tracing::error!("pipeline thread panicked");
        }
    })
    .await
    .ok();
    events_task.abort();

    // Closing the last handle tells the actuator to force locked and exit.
    drop(actuator);
    actuator_task.await.ok();

    if let Err(e) = cache.persist() {
        tracing::error!(error = %e, "final cache flush failed");
    }

    tracing::info!("sesamed stopped");
    Ok(())
}

/// Register the ONNX backend when its model loads, always keep the hashed
/// fallback, then pick by configured name (unknown names fall back with a
/// warning).
fn select_extractor(config: &Config) -> Result<Box<dyn EmbeddingExtractor>> {
    let mut registry = ExtractorRegistry::new();
    match OnnxExtractor::load("facenet", &config.model_path.to_string_lossy()) {
        Ok(backend) => registry.register(Box::new(backend)),
        Err(e) => tracing::warn!(error = %e, "facenet backend unavailable"),
    }
    registry.register(Box::new(HashedExtractor));

    registry
        .take_or_default(&config.extractor)
        .context("no extractor backend available")
}

/// Open the lock line, degrading to log-only when hardware is missing so
/// development machines can run the full agent.
fn open_lock_line(config: &Config) -> Arc<dyn OutputLine> {
    if config.gpio_simulate {
        return Arc::new(LogOnlyOutputLine::new("sesame-lock"));
    }
    match GpioOutputLine::open(&config.gpio_chip, config.lock_pin, "sesame-lock", Level::Active) {
        Ok(line) => Arc::new(line),
        Err(e) => {
            tracing::error!(error = %e, "lock line unavailable, falling back to log-only");
            Arc::new(LogOnlyOutputLine::new("sesame-lock"))
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
