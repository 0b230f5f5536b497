//! Automation rules and their store.
//!
//! Rules live in memory behind a single lock and are mirrored to a JSON
//! snapshot (`{"configs": [...]}`) after every mutation. Solar rules get
//! their `time` from the [`SolarResolver`] whenever they are created,
//! replaced or loaded from disk.
//!
//! Every mutation holds the lock for the whole validate → resolve → apply →
//! persist sequence, so mutations are applied strictly one after another.
//! When the final persist fails the in-memory change is kept and the error is
//! returned; the next successful mutation writes the full set again.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::snapshot::{JsonFile, SnapshotError};
use crate::solar::{SolarError, SolarEvent, SolarResolver};

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

/// Which solar event a rule follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "&'static str")]
pub enum Command {
    Sunset,
    Sunrise,
    #[default]
    None,
}

impl Command {
    pub fn solar_event(self) -> Option<SolarEvent> {
        match self {
            Self::Sunset => Some(SolarEvent::Sunset),
            Self::Sunrise => Some(SolarEvent::Sunrise),
            Self::None => None,
        }
    }
}

impl TryFrom<Option<String>> for Command {
    type Error = String;

    /// `null` and `""` both mean "no solar event".
    fn try_from(s: Option<String>) -> Result<Self, Self::Error> {
        let s = s.unwrap_or_default();
        match s.trim().to_ascii_lowercase().as_str() {
            "sunset" => Ok(Self::Sunset),
            "sunrise" => Ok(Self::Sunrise),
            "" | "none" => Ok(Self::None),
            _ => Err(format!("unknown command '{s}' (use sunSet or sunRise)")),
        }
    }
}

impl From<Command> for &'static str {
    fn from(c: Command) -> Self {
        match c {
            Command::Sunset => "sunSet",
            Command::Sunrise => "sunRise",
            Command::None => "",
        }
    }
}

/// One automation entry: publish `message` to `topic` at `time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Rule {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub message: String,
    /// When set, `time` is derived from `command` at the coordinate.
    #[serde(rename = "AdditionalCommand", default)]
    pub uses_solar_time: bool,
    /// Local `HH:MM`.
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub command: Command,
}

/// `true` for a zero-padded 24-hour `HH:MM`.
pub fn is_valid_hhmm(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 5
        && b[2] == b':'
        && [b[0], b[1], b[3], b[4]].iter().all(u8::is_ascii_digit)
        && NaiveTime::parse_from_str(s, "%H:%M").is_ok()
}

impl Rule {
    /// Check the fields a caller supplies. Every violation is reported, not
    /// just the first one.
    pub fn validate(&self) -> Result<(), RuleError> {
        let mut errors: Vec<String> = Vec::new();

        if self.id < 0 {
            errors.push(format!("ID must not be negative, got {}", self.id));
        }

        if self.topic.trim().is_empty() {
            errors.push("Topic is empty".to_string());
        } else if self.topic.contains(['+', '#']) {
            errors.push(format!("Topic '{}' must not contain wildcards", self.topic));
        }

        if self.uses_solar_time {
            if self.command.solar_event().is_none() {
                errors.push("solar time rules need Command sunSet or sunRise".to_string());
            }
            if !(-90.0..=90.0).contains(&self.latitude) {
                errors.push(format!("Latitude {} out of range [-90, 90]", self.latitude));
            }
            if !(-180.0..=180.0).contains(&self.longitude) {
                errors.push(format!(
                    "Longitude {} out of range [-180, 180]",
                    self.longitude
                ));
            }
        } else if !is_valid_hhmm(&self.time) {
            errors.push(format!("Time '{}' is not a valid HH:MM", self.time));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Invalid(errors.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Invalid(String),

    #[error("rule {0} not found")]
    NotFound(i64),

    #[error("solar time resolution failed for rule {id}: {source}")]
    Resolution {
        id: i64,
        #[source]
        source: SolarError,
    },

    #[error("failed to persist rules: {0}")]
    Persist(#[from] SnapshotError),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// On-disk layout of the rule snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RuleSnapshot {
    #[serde(default)]
    pub configs: Vec<Rule>,
}

/// Outcome of [`RuleStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Added,
    Updated,
}

/// Outcome of [`RuleStore::reload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub loaded: usize,
    /// Solar rules whose time could not be refreshed and kept the persisted
    /// value instead.
    pub unresolved: usize,
}

pub struct RuleStore<S> {
    rules: Mutex<Vec<Rule>>,
    file: JsonFile<RuleSnapshot>,
    solar: S,
}

impl<S: SolarResolver> RuleStore<S> {
    /// An empty store. Call [`reload`](Self::reload) to pick up the snapshot.
    pub fn new(file: JsonFile<RuleSnapshot>, solar: S) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            file,
            solar,
        }
    }

    /// Replace the in-memory set with the snapshot, re-resolving every solar
    /// rule. A rule whose resolution fails keeps its persisted time and is
    /// counted in the report.
    pub async fn reload(&self) -> Result<ReloadReport, SnapshotError> {
        let mut rules = self.rules.lock().await;
        let mut loaded = self.file.load_or_create().await?.configs;

        let mut report = ReloadReport {
            loaded: loaded.len(),
            unresolved: 0,
        };
        for rule in loaded.iter_mut().filter(|r| r.uses_solar_time) {
            if let Err(e) = self.resolve(rule).await {
                warn!(
                    rule = rule.id,
                    time = %rule.time,
                    "rules: keeping persisted time: {e}"
                );
                report.unresolved += 1;
            }
        }

        *rules = loaded;
        info!(
            rules = report.loaded,
            unresolved = report.unresolved,
            path = %self.file.path().display(),
            "rules loaded"
        );
        Ok(report)
    }

    /// All rules in insertion order.
    pub async fn list(&self) -> Vec<Rule> {
        self.rules.lock().await.clone()
    }

    /// Add `rule`, or replace the rule with the same id in place.
    pub async fn upsert(&self, mut rule: Rule) -> Result<Upserted, RuleError> {
        rule.validate()?;

        let mut rules = self.rules.lock().await;
        self.resolve(&mut rule).await?;

        let id = rule.id;
        let outcome = match rules.iter_mut().find(|r| r.id == id) {
            Some(existing) => {
                *existing = rule;
                Upserted::Updated
            }
            None => {
                rules.push(rule);
                Upserted::Added
            }
        };

        self.persist(&rules).await?;
        info!(rule = id, ?outcome, "rules: upserted");
        Ok(outcome)
    }

    /// Replace the existing rule `id`. The body's own id is ignored.
    pub async fn replace(&self, id: i64, mut rule: Rule) -> Result<Rule, RuleError> {
        rule.id = id;
        rule.validate()?;

        let mut rules = self.rules.lock().await;
        let pos = rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(RuleError::NotFound(id))?;
        self.resolve(&mut rule).await?;

        rules[pos] = rule.clone();
        self.persist(&rules).await?;
        info!(rule = id, "rules: replaced");
        Ok(rule)
    }

    /// Drop every rule.
    pub async fn clear(&self) -> Result<(), RuleError> {
        let mut rules = self.rules.lock().await;
        let dropped = rules.len();
        rules.clear();

        self.persist(&rules).await?;
        info!(dropped, "rules: cleared");
        Ok(())
    }

    /// Overwrite `rule.time` for solar rules; plain rules pass through.
    async fn resolve(&self, rule: &mut Rule) -> Result<(), RuleError> {
        if !rule.uses_solar_time {
            return Ok(());
        }
        let Some(event) = rule.command.solar_event() else {
            return Err(RuleError::Invalid(format!(
                "rule {} uses solar time without a command",
                rule.id
            )));
        };

        rule.time = self
            .solar
            .resolve(rule.latitude, rule.longitude, event)
            .await
            .map_err(|source| RuleError::Resolution {
                id: rule.id,
                source,
            })?;
        Ok(())
    }

    async fn persist(&self, rules: &[Rule]) -> Result<(), RuleError> {
        let snapshot = RuleSnapshot {
            configs: rules.to_vec(),
        };
        self.file.save(&snapshot).await.map_err(|e| {
            warn!("rules: {e}");
            RuleError::Persist(e)
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
