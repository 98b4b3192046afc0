//! Journal replay: applies entries to a [`Registry`] one at a time and
//! reports what each one did.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use veiltrace_core::NoopEventSink;
//! use veiltrace_node::config::Config;
//! use veiltrace_node::journal::parse_journal;
//! use veiltrace_node::service::ReplayService;
//! use veiltrace_telemetry::TelemetryHandle;
//!
//! let cfg = Config::sample();
//! let telemetry = TelemetryHandle::from_config(cfg.telemetry.clone());
//! let mut service = ReplayService::new(&cfg, telemetry, Arc::new(NoopEventSink)).unwrap();
//! let entries = parse_journal(
//!     r#"{"caller":"u1","at-ms":1,"op":"create-session","duration":30,"activity-level":55,"interaction-type":2,"data-point-count":10}"#,
//! )
//! .unwrap();
//! let report = service.replay(&entries);
//! assert_eq!(report.applied, 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use veiltrace_core::{
    CorrelationId, DeterministicEngine, ErrorKind, EventSink, Invocation, Operation,
    OperationOutcome, Principal, Registry, RegistryError, RegistryResult, SimulatedOracle,
};
use veiltrace_telemetry::{TelemetryHandle, TelemetrySnapshot};

use crate::config::{Config, ConfigError};
use crate::journal::{JournalAction, JournalEntry};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum EntryResult {
    Applied { outcome: OperationOutcome },
    Rejected { kind: ErrorKind, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplayRecord {
    pub line: usize,
    pub caller: Principal,
    pub at_ms: u64,
    pub operation: &'static str,
    pub result: EntryResult,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplayReport {
    pub records: Vec<ReplayRecord>,
    pub applied: usize,
    pub rejected: BTreeMap<&'static str, usize>,
    pub pending_decryptions: Vec<CorrelationId>,
    pub telemetry: TelemetrySnapshot,
}

pub struct ReplayService {
    registry: Registry,
    oracle: Arc<SimulatedOracle>,
    oracle_principal: Principal,
    auto_deliver: bool,
    telemetry: TelemetryHandle,
}

impl ReplayService {
    pub fn new(
        config: &Config,
        telemetry: TelemetryHandle,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ServiceError> {
        let engine = Arc::new(DeterministicEngine::new(config.node.engine_seed()?));
        let oracle = Arc::new(SimulatedOracle::new(
            engine.clone(),
            config.node.oracle_key()?,
        ));
        let registry = Registry::new(config.registry.clone(), engine, oracle.clone())?
            .with_event_sink(events)
            .with_telemetry(telemetry.clone());
        Ok(Self {
            registry,
            oracle,
            oracle_principal: config.node.oracle_principal.clone(),
            auto_deliver: config.node.auto_deliver,
            telemetry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Applies one entry. A rejection leaves the registry as it was.
    pub fn apply(&mut self, entry: &JournalEntry) -> RegistryResult<OperationOutcome> {
        let invocation = Invocation::new(entry.caller.clone(), entry.at_ms);
        match &entry.action {
            JournalAction::Apply(operation) => {
                self.registry.apply(&invocation, operation.clone())
            }
            JournalAction::DeliverDecryption {
                correlation_id,
                tamper,
            } => self.deliver(*correlation_id, *tamper, entry.at_ms),
        }
    }

    /// Has the simulated oracle answer `correlation_id`; the callback runs
    /// as the oracle principal.
    fn deliver(
        &mut self,
        correlation_id: CorrelationId,
        tamper: bool,
        at_ms: u64,
    ) -> RegistryResult<OperationOutcome> {
        let mut delivery = self.oracle.deliver(correlation_id)?;
        if tamper {
            delivery = delivery.tampered();
        }
        let invocation = Invocation::new(self.oracle_principal.clone(), at_ms);
        let outcome = self.registry.apply(
            &invocation,
            Operation::DecryptionCallback {
                correlation_id,
                payload: delivery.payload,
                proof: delivery.proof,
            },
        )?;
        self.oracle.acknowledge(correlation_id);
        Ok(outcome)
    }

    fn record(
        &self,
        entry: &JournalEntry,
        operation: &'static str,
        result: RegistryResult<OperationOutcome>,
    ) -> ReplayRecord {
        let result = match result {
            Ok(outcome) => {
                debug!(line = entry.line, operation, "entry applied");
                EntryResult::Applied { outcome }
            }
            Err(err) => EntryResult::Rejected {
                kind: err.kind(),
                message: err.to_string(),
            },
        };
        ReplayRecord {
            line: entry.line,
            caller: entry.caller.clone(),
            at_ms: entry.at_ms,
            operation,
            result,
        }
    }

    /// Replays every entry in order. Rejected entries are reported and
    /// replay continues.
    pub fn replay(&mut self, entries: &[JournalEntry]) -> ReplayReport {
        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self.apply(entry);
            let requested = match &result {
                Ok(OperationOutcome::DecryptionRequested { correlation_id }) => {
                    Some(*correlation_id)
                }
                _ => None,
            };
            records.push(self.record(entry, entry.action.name(), result));
            if let (true, Some(correlation_id)) = (self.auto_deliver, requested) {
                let result = self.deliver(correlation_id, false, entry.at_ms);
                records.push(self.record(entry, "auto-deliver", result));
            }
        }

        let mut applied = 0;
        let mut rejected: BTreeMap<&'static str, usize> = BTreeMap::new();
        for record in &records {
            match &record.result {
                EntryResult::Applied { .. } => applied += 1,
                EntryResult::Rejected { kind, .. } => {
                    *rejected.entry(kind.as_str()).or_default() += 1
                }
            }
        }
        let pending_decryptions = self.registry.pending_decryptions().collect();
        info!(
            entries = entries.len(),
            applied,
            rejected = records.len() - applied,
            "journal replayed"
        );
        ReplayReport {
            records,
            applied,
            rejected,
            pending_decryptions,
            telemetry: self.telemetry.flush(),
        }
    }
}
