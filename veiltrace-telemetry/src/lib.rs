//! Telemetry facade for veiltrace. Operation outcomes, rejection kinds and
//! decryption round-trip latencies are held in memory so replay runs and
//! tests can assert on them without shipping anything to an exporter.

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};
use thiserror::Error;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for veiltrace-telemetry."
);

#[cfg(feature = "dev")]
const DEFAULT_FLUSH_MS: u64 = 1_000;
#[cfg(feature = "test")]
const DEFAULT_FLUSH_MS: u64 = 500;
#[cfg(any(feature = "prod", not(any(feature = "dev", feature = "test"))))]
const DEFAULT_FLUSH_MS: u64 = 5_000;

/// Latency series for decryption request -> resolution, measured in log time.
pub const DECRYPTION_ROUND_TRIP: &str = "decryption.round_trip_ms";

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_MS
}

fn default_endpoint() -> String {
    "memory://veiltrace".into()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct TelemetryConfig {
    /// Endpoint where snapshots would be shipped (unused by the in-memory sink).
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Flush cadence in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Global labels appended to every snapshot.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::new(),
        }
    }
}

impl TelemetryConfig {
    pub fn sample(component: &str) -> Self {
        Self {
            endpoint: default_endpoint(),
            flush_interval_ms: default_flush_interval_ms(),
            labels: BTreeMap::from([("component".into(), component.to_owned())]),
        }
    }
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("counter overflow for metric {0}")]
    CounterOverflow(String),
    #[error("snapshot encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub timestamp: SystemTime,
    pub labels: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u64>,
    pub latencies_ms: BTreeMap<String, Vec<u64>>,
}

impl TelemetrySnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn to_json(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Default)]
struct TelemetryState {
    counters: BTreeMap<String, u64>,
    latencies_ms: BTreeMap<String, Vec<u64>>,
}

#[derive(Clone)]
pub struct TelemetryHandle {
    config: TelemetryConfig,
    state: Arc<Mutex<TelemetryState>>,
}

impl Default for TelemetryHandle {
    fn default() -> Self {
        Self::from_config(TelemetryConfig::default())
    }
}

impl TelemetryHandle {
    pub fn from_config(config: TelemetryConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(TelemetryState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, TelemetryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_counter(&self, name: &str, delta: u64) -> Result<(), TelemetryError> {
        let mut guard = self.state();
        let entry = guard.counters.entry(name.to_owned()).or_default();
        *entry = entry
            .checked_add(delta)
            .ok_or_else(|| TelemetryError::CounterOverflow(name.to_owned()))?;
        Ok(())
    }

    /// Counts one committed (`op.<operation>.ok`) or rejected
    /// (`op.<operation>.rejected`) operation.
    pub fn record_operation(&self, operation: &str, committed: bool) -> Result<(), TelemetryError> {
        let suffix = if committed { "ok" } else { "rejected" };
        self.record_counter(&format!("op.{operation}.{suffix}"), 1)
    }

    pub fn record_rejection(&self, kind: &str) -> Result<(), TelemetryError> {
        self.record_counter(&format!("reject.{kind}"), 1)
    }

    pub fn record_latency_ms(&self, name: &str, value: u64) {
        self.state()
            .latencies_ms
            .entry(name.to_owned())
            .or_default()
            .push(value);
    }

    /// Current value of a counter without flushing.
    pub fn counter(&self, name: &str) -> u64 {
        self.state().counters.get(name).copied().unwrap_or(0)
    }

    pub fn flush(&self) -> TelemetrySnapshot {
        let mut guard = self.state();
        let snapshot = TelemetrySnapshot {
            timestamp: SystemTime::now(),
            labels: self.config.labels.clone(),
            counters: guard.counters.clone(),
            latencies_ms: guard.latencies_ms.clone(),
        };
        guard.counters.clear();
        guard.latencies_ms.clear();
        snapshot
    }

    pub fn flush_interval(&self) -> u64 {
        self.config.flush_interval_ms
    }
}
