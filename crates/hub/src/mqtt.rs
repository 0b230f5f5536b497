//! Broker connection: startup handshake, telemetry subscription and the
//! long-running event loop.
//!
//! Startup is strict: no CONNACK within the connect timeout, a refused
//! CONNACK, or a SUBACK failure code is fatal. Once running, errors are
//! transient. rumqttc reconnects on the next poll, and since sessions are
//! clean the telemetry subscription is re-issued on every CONNACK.

use anyhow::{bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode,
};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::ingest::{self, TELEMETRY_TOPICS};
use crate::telemetry::TelemetryWindow;

/// Capacity of the client → event loop request queue.
const REQUEST_CAP: usize = 20;

/// Pause after an event-loop error before polling again.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub fn options(cfg: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_sec));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }
    opts
}

fn telemetry_filters() -> Vec<SubscribeFilter> {
    TELEMETRY_TOPICS
        .iter()
        .map(|t| SubscribeFilter::new(t.to_string(), QoS::AtMostOnce))
        .collect()
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Open the broker session and wait for a successful CONNACK.
pub async fn connect(cfg: &MqttConfig) -> Result<(AsyncClient, EventLoop)> {
    let (client, mut eventloop) = AsyncClient::new(options(cfg), REQUEST_CAP);
    let limit = Duration::from_secs(cfg.connect_timeout_sec);

    timeout(limit, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        bail!("broker refused connection: {:?}", ack.code);
                    }
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("mqtt connect failed"),
            }
        }
    })
    .await
    .with_context(|| format!("no CONNACK from {}:{} within {limit:?}", cfg.host, cfg.port))??;

    info!(host = %cfg.host, port = cfg.port, client_id = %cfg.client_id, "mqtt connected");
    Ok((client, eventloop))
}

/// Subscribe to the telemetry topics and wait for the SUBACK. Readings that
/// arrive in the meantime are ingested, not dropped.
pub async fn subscribe_telemetry(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    window: &TelemetryWindow,
    limit: Duration,
) -> Result<()> {
    client
        .subscribe_many(telemetry_filters())
        .await
        .context("failed to queue telemetry subscription")?;

    timeout(limit, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let refused = ack
                        .return_codes
                        .iter()
                        .filter(|c| matches!(c, SubscribeReasonCode::Failure))
                        .count();
                    if refused > 0 {
                        bail!("broker refused {refused} telemetry subscription(s)");
                    }
                    return Ok(());
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    ingest::handle_publish(window, &p.topic, &p.payload).await;
                }
                Ok(_) => {}
                Err(e) => return Err(e).context("mqtt subscribe failed"),
            }
        }
    })
    .await
    .with_context(|| format!("no SUBACK within {limit:?}"))??;

    info!(topics = ?TELEMETRY_TOPICS, "mqtt subscribed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// React to one incoming event.
async fn handle_event(
    event: Event,
    client: &AsyncClient,
    window: &TelemetryWindow,
    telemetry_enabled: bool,
) {
    match event {
        Event::Incoming(Packet::Publish(p)) => {
            if telemetry_enabled {
                ingest::handle_publish(window, &p.topic, &p.payload).await;
            } else {
                debug!(topic = %p.topic, "telemetry disabled, ignoring publish");
            }
        }
        Event::Incoming(Packet::ConnAck(ack)) => {
            info!(session_present = ack.session_present, "mqtt reconnected");
            if telemetry_enabled && !ack.session_present {
                if let Err(e) = client.try_subscribe_many(telemetry_filters()) {
                    warn!("mqtt: resubscribe failed: {e}");
                }
            }
        }
        Event::Incoming(Packet::SubAck(ack)) => {
            if ack
                .return_codes
                .iter()
                .any(|c| matches!(c, SubscribeReasonCode::Failure))
            {
                warn!(pkid = ack.pkid, "mqtt: broker refused a subscription");
            }
        }
        Event::Incoming(Packet::Disconnect) => {
            warn!("mqtt disconnected");
        }
        _ => {}
    }
}

/// Poll the event loop until `cancel` fires.
pub async fn run(
    mut eventloop: EventLoop,
    client: AsyncClient,
    window: &TelemetryWindow,
    telemetry_enabled: bool,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(event) => handle_event(event, &client, window, telemetry_enabled).await,
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }

    if let Err(e) = client.try_disconnect() {
        debug!("mqtt: disconnect not sent: {e}");
    }
    info!("mqtt loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::JsonFile;
    use crate::telemetry::Reading;
    use rumqttc::Publish;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn window() -> (TempDir, TelemetryWindow) {
        let dir = tempfile::tempdir().unwrap();
        let window = TelemetryWindow::load(JsonFile::new(dir.path().join("temperature.json")))
            .await
            .unwrap();
        (dir, window)
    }

    fn publish(topic: &str, payload: &[u8]) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtMostOnce,
            payload.to_vec(),
        )))
    }

    fn client() -> AsyncClient {
        let (client, _eventloop) = AsyncClient::new(options(&MqttConfig::default()), 10);
        client
    }

    // -- options ----------------------------------------------------------

    #[test]
    fn options_carry_identity_and_keep_alive() {
        let cfg = MqttConfig {
            host: "broker.lan".into(),
            port: 1884,
            client_id: "hub-7".into(),
            keep_alive_sec: 2,
            ..Default::default()
        };
        let opts = options(&cfg);

        assert_eq!(opts.broker_address(), ("broker.lan".to_string(), 1884));
        assert_eq!(opts.client_id(), "hub-7");
        assert_eq!(opts.keep_alive(), Duration::from_secs(2));
        assert_eq!(opts.credentials(), None);
    }

    #[test]
    fn options_set_credentials_when_both_given() {
        let cfg = MqttConfig {
            username: Some("server".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        assert_eq!(
            options(&cfg).credentials(),
            Some(("server".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn filters_cover_both_telemetry_topics_at_qos0() {
        let filters = telemetry_filters();
        let paths: Vec<&str> = filters.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["Temperature", "Humidity"]);
        assert!(filters.iter().all(|f| f.qos == QoS::AtMostOnce));
    }

    // -- connect ----------------------------------------------------------

    #[tokio::test]
    async fn connect_fails_when_broker_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cfg = MqttConfig {
            port,
            connect_timeout_sec: 2,
            ..Default::default()
        };
        assert!(connect(&cfg).await.is_err());
    }

    #[tokio::test]
    async fn connect_times_out_without_connack() {
        // Accepts the TCP connection but never answers CONNECT.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let cfg = MqttConfig {
            port,
            connect_timeout_sec: 1,
            ..Default::default()
        };
        let Err(err) = connect(&cfg).await else {
            panic!("expected connect to fail");
        };
        let msg = format!("{err:#}");
        assert!(msg.contains("no CONNACK"), "got: {msg}");
    }

    // -- handle_event -----------------------------------------------------

    #[tokio::test]
    async fn telemetry_publish_is_appended() {
        let (_dir, window) = window().await;
        let client = client();

        handle_event(publish("Temperature", b"21.5"), &client, &window, true).await;
        handle_event(publish("Humidity", b"55"), &client, &window, true).await;

        assert_eq!(
            window.snapshot().await,
            vec![Reading::temperature(21.5), Reading::humidity(55.0)]
        );
    }

    #[tokio::test]
    async fn malformed_and_foreign_publishes_are_dropped() {
        let (_dir, window) = window().await;
        let client = client();

        handle_event(publish("Temperature", b"warm"), &client, &window, true).await;
        handle_event(publish("lights", b"on"), &client, &window, true).await;

        assert!(window.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn telemetry_disabled_ignores_publishes() {
        let (_dir, window) = window().await;
        let client = client();

        handle_event(publish("Temperature", b"21.5"), &client, &window, false).await;

        assert!(window.snapshot().await.is_empty());
    }

    // -- run --------------------------------------------------------------

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let (_dir, window) = window().await;
        let (client, eventloop) = AsyncClient::new(options(&MqttConfig::default()), 10);

        let cancel = CancellationToken::new();
        cancel.cancel();
        timeout(
            Duration::from_secs(5),
            run(eventloop, client, &window, true, cancel),
        )
        .await
        .expect("mqtt loop should stop when cancelled");
    }
}
