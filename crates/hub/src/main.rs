mod config;
mod dispatch;
mod ingest;
mod mqtt;
mod rules;
mod scheduler;
mod snapshot;
mod solar;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dispatch::MqttDispatcher;
use rules::RuleStore;
use scheduler::{LocalClock, Scheduler};
use snapshot::JsonFile;
use solar::SunriseSunsetClient;
use telemetry::TelemetryWindow;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path =
        PathBuf::from(env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string()));
    let cfg = config::load(&config_path)?;

    // ── Telemetry window ────────────────────────────────────────────
    let telemetry = Arc::new(
        TelemetryWindow::load(JsonFile::new(cfg.storage.telemetry_path.clone()))
            .await
            .context("failed to load telemetry snapshot")?,
    );

    // ── Rules ───────────────────────────────────────────────────────
    let solar = SunriseSunsetClient::new(
        cfg.solar.base_url.clone(),
        Duration::from_secs(cfg.solar.timeout_sec),
    )?;
    let rules = Arc::new(RuleStore::new(
        JsonFile::new(cfg.storage.rules_path.clone()),
        solar,
    ));
    let report = rules
        .reload()
        .await
        .context("failed to load rule snapshot")?;
    if report.unresolved > 0 {
        warn!(
            unresolved = report.unresolved,
            "some solar rules kept their persisted time"
        );
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, mut eventloop) = mqtt::connect(&cfg.mqtt).await?;
    if cfg.telemetry.enabled {
        mqtt::subscribe_telemetry(
            &client,
            &mut eventloop,
            &telemetry,
            Duration::from_secs(cfg.mqtt.connect_timeout_sec),
        )
        .await?;
    } else {
        info!("telemetry ingestion disabled");
    }

    let cancel = CancellationToken::new();

    // ── Scheduler ───────────────────────────────────────────────────
    let dispatcher = MqttDispatcher::new(
        client.clone(),
        Duration::from_secs(cfg.mqtt.publish_timeout_sec),
    );
    let scheduler = Scheduler::new(Arc::clone(&rules), dispatcher, LocalClock);
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    // ── HTTP API ────────────────────────────────────────────────────
    let listener = web::bind(cfg.web.port).await?;
    let web_state = AppState {
        rules: Arc::clone(&rules),
        telemetry: Arc::clone(&telemetry),
    };
    let web_task = tokio::spawn(web::serve(listener, web_state, cancel.clone()));

    // ── Shutdown on Ctrl-C ──────────────────────────────────────────
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    cancel.cancel();
                }
                Err(e) => error!("cannot listen for ctrl-c: {e}"),
            }
        }
    });

    info!("hub started");
    mqtt::run(eventloop, client, &telemetry, cfg.telemetry.enabled, cancel.clone()).await;

    scheduler_task.await.context("scheduler task panicked")?;
    web_task.await.context("http task panicked")??;
    info!("hub stopped");
    Ok(())
}
