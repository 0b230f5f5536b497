//! Sunrise / sunset lookup against the sunrise-sunset.org JSON API.
//!
//! The API answers with UTC RFC 3339 timestamps (`formatted=0`); the hub
//! converts them to its own local time and keeps only `HH:MM`, the same
//! resolution the scheduler compares against.

use chrono::{DateTime, Local, TimeZone};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.sunrise-sunset.org/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarEvent {
    Sunrise,
    Sunset,
}

impl fmt::Display for SolarEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sunrise => write!(f, "sunrise"),
            Self::Sunset => write!(f, "sunset"),
        }
    }
}

/// Every way a lookup can fail. Callers treat all of them alike: the time
/// could not be resolved.
#[derive(Debug, Error)]
pub enum SolarError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed response body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("api responded with status '{0}'")]
    Status(String),

    #[error("unparseable {event} timestamp '{value}': {source}")]
    Timestamp {
        event: SolarEvent,
        value: String,
        source: chrono::ParseError,
    },
}

/// Resolves the local `HH:MM` of a solar event at a coordinate.
pub trait SolarResolver: Send + Sync {
    fn resolve(
        &self,
        latitude: f64,
        longitude: f64,
        event: SolarEvent,
    ) -> impl Future<Output = Result<String, SolarError>> + Send;
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SunResponse {
    // On error statuses the API sends `"results": ""`, so this stays untyped
    // until the status has been checked.
    #[serde(default)]
    results: serde_json::Value,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct SunResults {
    #[serde(default)]
    sunrise: String,
    #[serde(default)]
    sunset: String,
}

/// Extract `event` from an API response body and format it as `HH:MM` in
/// the timezone `tz`.
pub fn parse_response<Tz>(body: &[u8], event: SolarEvent, tz: &Tz) -> Result<String, SolarError>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let response: SunResponse = serde_json::from_slice(body)?;
    if response.status != "OK" {
        return Err(SolarError::Status(response.status));
    }

    let results: SunResults = serde_json::from_value(response.results)?;
    let value = match event {
        SolarEvent::Sunrise => results.sunrise,
        SolarEvent::Sunset => results.sunset,
    };

    let at = DateTime::parse_from_rfc3339(&value).map_err(|source| SolarError::Timestamp {
        event,
        value: value.clone(),
        source,
    })?;
    Ok(at.with_timezone(tz).format("%H:%M").to_string())
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SunriseSunsetClient {
    http: reqwest::Client,
    base_url: String,
}

impl SunriseSunsetClient {
    /// Every request made by this client is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SolarError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }
}

impl SolarResolver for SunriseSunsetClient {
    async fn resolve(
        &self,
        latitude: f64,
        longitude: f64,
        event: SolarEvent,
    ) -> Result<String, SolarError> {
        let body = self
            .http
            .get(&self.base_url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lng", longitude.to_string()),
                ("formatted", "0".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let hhmm = parse_response(&body, event, &Local)?;
        tracing::debug!(latitude, longitude, %event, time = %hhmm, "solar time resolved");
        Ok(hhmm)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
