use std::path::{Path, PathBuf};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use veiltrace_core::{
    BitWidth, CorrelationId, DecryptedValue, DecryptionState, ErrorKind, EventKind,
    MemoryEventSink, Principal, SessionId,
};
use veiltrace_node::config::{load_config, ConfigFormat};
use veiltrace_node::journal::read_journal;
use veiltrace_node::service::{EntryResult, ReplayService};
use veiltrace_telemetry::TelemetryHandle;

fn manifest_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
}

fn rejected_lines(records: &[veiltrace_node::service::ReplayRecord]) -> Vec<(usize, ErrorKind)> {
    records
        .iter()
        .filter_map(|record| match &record.result {
            EntryResult::Rejected { kind, .. } => Some((record.line, *kind)),
            EntryResult::Applied { .. } => None,
        })
        .collect()
}

#[test]
fn demo_journal_replays_with_toml_config() {
    let config = load_config(&manifest_path("configs/veiltrace-node.toml"), ConfigFormat::Auto)
        .expect("bundled config");
    assert!(!config.node.auto_deliver);
    let entries = read_journal(&manifest_path("journals/demo.jsonl")).expect("bundled journal");
    let events = Arc::new(MemoryEventSink::new());
    let mut service = ReplayService::new(
        &config,
        TelemetryHandle::from_config(config.telemetry.clone()),
        events.clone(),
    )
    .expect("service");

    let report = service.replay(&entries);
    assert_eq!(report.records.len(), entries.len());
    assert_eq!(
        rejected_lines(&report.records),
        vec![
            (2, ErrorKind::InvalidInput),
            (5, ErrorKind::NotAuthorized),
            (12, ErrorKind::ProofInvalid),
            (14, ErrorKind::AlreadyResolved),
            (17, ErrorKind::NotAuthorized),
        ]
    );
    assert_eq!(report.applied, 12);
    assert!(report.pending_decryptions.is_empty());

    let registry = service.registry();
    assert_eq!(
        registry.sessions_of(&Principal::new("u1")),
        &[SessionId(1), SessionId(3), SessionId(4)]
    );
    assert_eq!(registry.sessions_of(&Principal::new("u2")), &[SessionId(2)]);
    assert!(!registry.session_info(SessionId(2)).unwrap().is_active);
    assert!(!registry.is_analyst(&Principal::new("analyst-a")));
    assert_eq!(
        registry.decryption_request(CorrelationId(1)).unwrap().state,
        DecryptionState::Fulfilled {
            values: vec![DecryptedValue {
                width: BitWidth::U8,
                value: 55
            }]
        }
    );

    assert_eq!(events.count(EventKind::AnomalyDetected), 2);
    assert_eq!(events.count(EventKind::SessionRecorded), 4);
    assert_eq!(events.count(EventKind::DecryptionFulfilled), 1);
    assert_eq!(report.telemetry.counter("reject.not-authorized"), 2);
    assert_eq!(
        report.telemetry.latencies_ms["decryption.round_trip_ms"],
        vec![20]
    );
}

#[test]
fn yaml_config_auto_delivers_every_target() {
    let config = load_config(&manifest_path("configs/veiltrace-node.yaml"), ConfigFormat::Auto)
        .expect("bundled yaml config");
    assert!(config.node.auto_deliver);
    let entries = read_journal(&manifest_path("journals/demo.jsonl")).expect("bundled journal");
    let mut service = ReplayService::new(
        &config,
        TelemetryHandle::default(),
        Arc::new(MemoryEventSink::new()),
    )
    .expect("service");

    let report = service.replay(&entries);
    let auto = report
        .records
        .iter()
        .find(|record| record.operation == "auto-deliver")
        .expect("auto delivery record");
    assert_eq!(auto.line, 11);
    assert_eq!(
        service
            .registry()
            .decryption_request(CorrelationId(1))
            .unwrap()
            .state,
        DecryptionState::Fulfilled {
            values: vec![
                DecryptedValue {
                    width: BitWidth::U8,
                    value: 55
                },
                DecryptedValue {
                    width: BitWidth::U32,
                    value: 10
                },
            ]
        }
    );
    // Manual deliveries find nothing left at the oracle.
    let rejected = rejected_lines(&report.records);
    assert!(rejected.contains(&(12, ErrorKind::Oracle)));
    assert!(rejected.contains(&(14, ErrorKind::AlreadyResolved)));
}
