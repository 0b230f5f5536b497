use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::warn;

use crate::snapshot::{JsonFile, SnapshotError};

/// Maximum number of readings retained in the window.
pub const WINDOW_LEN: usize = 10;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// One telemetry sample. Temperature and humidity arrive on separate
/// channels, so a reading carries exactly one populated field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
}

impl Reading {
    pub fn temperature(value: f64) -> Self {
        Self {
            temperature: Some(value),
            humidity: None,
        }
    }

    pub fn humidity(value: f64) -> Self {
        Self {
            temperature: None,
            humidity: Some(value),
        }
    }
}

/// The most recent [`WINDOW_LEN`] readings, oldest first.
///
/// Every append rewrites the snapshot file while the lock is still held, so
/// the file always reflects some window the process actually had.
pub struct TelemetryWindow {
    readings: Mutex<VecDeque<Reading>>,
    file: JsonFile<Vec<Reading>>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl TelemetryWindow {
    /// Build the window from its snapshot file, creating the file if needed.
    /// Oversized snapshots keep only the newest entries.
    pub async fn load(file: JsonFile<Vec<Reading>>) -> Result<Self, SnapshotError> {
        let persisted = file.load_or_create().await?;
        let skip = persisted.len().saturating_sub(WINDOW_LEN);
        let mut readings = VecDeque::with_capacity(WINDOW_LEN);
        readings.extend(persisted.into_iter().skip(skip));

        Ok(Self {
            readings: Mutex::new(readings),
            file,
        })
    }

    /// Append at the tail, evicting the oldest reading once the window is
    /// full, then flush. A failed flush is logged; the append stands.
    pub async fn append(&self, reading: Reading) {
        let mut readings = self.readings.lock().await;
        if readings.len() >= WINDOW_LEN {
            readings.pop_front();
        }
        readings.push_back(reading);

        let snapshot: Vec<Reading> = readings.iter().copied().collect();
        if let Err(e) = self.file.save(&snapshot).await {
            warn!(path = %self.file.path().display(), "telemetry: snapshot flush failed: {e}");
        }
    }

    /// Copy of the current window, oldest first.
    pub async fn snapshot(&self) -> Vec<Reading> {
        self.readings.lock().await.iter().copied().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
