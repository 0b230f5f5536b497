//! Sensor ingestion: turns `Temperature` / `Humidity` publishes into
//! telemetry readings. Bad payloads are logged and dropped here; nothing
//! from this module ever reaches the scheduler or the rule store.

use thiserror::Error;
use tracing::{debug, warn};

use crate::telemetry::{Reading, TelemetryWindow};

pub const TEMPERATURE_TOPIC: &str = "Temperature";
pub const HUMIDITY_TOPIC: &str = "Humidity";

/// Topics the hub subscribes to when telemetry ingestion is enabled.
pub const TELEMETRY_TOPICS: [&str; 2] = [TEMPERATURE_TOPIC, HUMIDITY_TOPIC];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unhandled topic '{0}'")]
    UnknownTopic(String),

    #[error("bad {topic} payload: {source}")]
    Payload {
        topic: &'static str,
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a bare JSON number published on one of the telemetry topics.
pub fn decode_reading(topic: &str, payload: &[u8]) -> Result<Reading, IngestError> {
    let (topic, build): (&'static str, fn(f64) -> Reading) = match topic {
        TEMPERATURE_TOPIC => (TEMPERATURE_TOPIC, Reading::temperature),
        HUMIDITY_TOPIC => (HUMIDITY_TOPIC, Reading::humidity),
        other => return Err(IngestError::UnknownTopic(other.to_string())),
    };

    serde_json::from_slice::<f64>(payload)
        .map(build)
        .map_err(|source| IngestError::Payload { topic, source })
}

/// Decode one publish and append it to the window. Returns the stored
/// reading, or `None` when the message was discarded.
pub async fn handle_publish(
    window: &TelemetryWindow,
    topic: &str,
    payload: &[u8],
) -> Option<Reading> {
    match decode_reading(topic, payload) {
        Ok(reading) => {
            window.append(reading).await;
            debug!(topic, ?reading, "telemetry: reading stored");
            Some(reading)
        }
        Err(IngestError::UnknownTopic(_)) => {
            debug!(topic, "unhandled topic");
            None
        }
        Err(e) => {
            warn!(
                topic,
                payload = %String::from_utf8_lossy(payload),
                "telemetry: discarding message: {e}"
            );
            None
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::JsonFile;
    use tempfile::{tempdir, TempDir};

    async fn window() -> (TempDir, TelemetryWindow) {
        let dir = tempdir().unwrap();
        let window = TelemetryWindow::load(JsonFile::new(dir.path().join("telemetry.json")))
            .await
            .unwrap();
        (dir, window)
    }

    // -- decode_reading -----------------------------------------------------

    #[test]
    fn decode_temperature_float() {
        let r = decode_reading("Temperature", b"21.5").unwrap();
        assert_eq!(r, Reading::temperature(21.5));
    }

    #[test]
    fn decode_humidity_integer() {
        let r = decode_reading("Humidity", b"55").unwrap();
        assert_eq!(r, Reading::humidity(55.0));
    }

    #[test]
    fn decode_negative_with_whitespace() {
        let r = decode_reading("Temperature", b" -4.25\n").unwrap();
        assert_eq!(r, Reading::temperature(-4.25));
    }

    #[test]
    fn decode_quoted_number_rejected() {
        let err = decode_reading("Temperature", b"\"21.5\"").unwrap_err();
        assert!(matches!(err, IngestError::Payload { topic: "Temperature", .. }));
    }

    #[test]
    fn decode_object_rejected() {
        assert!(decode_reading("Humidity", br#"{"value": 40}"#).is_err());
    }

    #[test]
    fn decode_empty_payload_rejected() {
        assert!(decode_reading("Humidity", b"").is_err());
    }

    #[test]
    fn decode_topic_is_case_sensitive() {
        let err = decode_reading("temperature", b"20").unwrap_err();
        assert!(matches!(err, IngestError::UnknownTopic(t) if t == "temperature"));
    }

    #[test]
    fn decode_unknown_topic() {
        assert!(matches!(
            decode_reading("lights", b"1"),
            Err(IngestError::UnknownTopic(_))
        ));
    }

    // -- handle_publish -----------------------------------------------------

    #[tokio::test]
    async fn valid_payload_is_appended() {
        let (_dir, window) = window().await;

        let stored = handle_publish(&window, "Temperature", b"20.1").await;
        assert_eq!(stored, Some(Reading::temperature(20.1)));
        assert_eq!(window.snapshot().await, vec![Reading::temperature(20.1)]);
    }

    #[tokio::test]
    async fn malformed_payload_is_not_appended() {
        let (_dir, window) = window().await;
        handle_publish(&window, "Humidity", b"55.0").await;

        assert_eq!(handle_publish(&window, "Humidity", b"wet").await, None);
        assert_eq!(handle_publish(&window, "Temperature", b"").await, None);
        assert_eq!(window.snapshot().await, vec![Reading::humidity(55.0)]);
    }

    #[tokio::test]
    async fn readings_are_never_merged() {
        let (_dir, window) = window().await;
        handle_publish(&window, "Temperature", b"20.1").await;
        handle_publish(&window, "Humidity", b"55.0").await;

        assert_eq!(
            window.snapshot().await,
            vec![Reading::temperature(20.1), Reading::humidity(55.0)]
        );
    }

    #[tokio::test]
    async fn foreign_topic_is_ignored() {
        let (_dir, window) = window().await;
        assert_eq!(handle_publish(&window, "lights", b"on").await, None);
        assert!(window.snapshot().await.is_empty());
    }
}
