use std::sync::Arc;

use pretty_assertions::assert_eq;
use veiltrace_core::{
    BitWidth, CollectingConsumer, CorrelationId, DecryptedValue, DecryptionState,
    DeterministicEngine, ErrorKind, EventKind, EventRef, EventSink, Invocation, MemoryEventSink,
    MetricsInput, Operation, OperationOutcome, Principal, Registry, RegistryConfig,
    RegistryError, RegistryEvent, SessionId, SessionInput, SimulatedOracle,
};

const ADMIN: &str = "did:veiltrace:admin";
const ORACLE: &str = "did:veiltrace:oracle";

struct Harness {
    registry: Registry,
    oracle: Arc<SimulatedOracle>,
    events: Arc<MemoryEventSink>,
    consumer: CollectingConsumer,
}

fn harness_with(config: RegistryConfig) -> Harness {
    let engine = Arc::new(DeterministicEngine::new([7u8; 32]));
    let oracle = Arc::new(SimulatedOracle::new(engine.clone(), [0x42; 32]));
    let events = Arc::new(MemoryEventSink::new());
    let consumer = CollectingConsumer::new();
    let registry = Registry::new(config, engine, oracle.clone())
        .expect("valid config")
        .with_event_sink(events.clone())
        .with_consumer(Arc::new(consumer.clone()));
    Harness {
        registry,
        oracle,
        events,
        consumer,
    }
}

fn harness() -> Harness {
    harness_with(RegistryConfig::default())
}

fn at(caller: &str, at_ms: u64) -> Invocation {
    Invocation::new(caller, at_ms)
}

fn u1() -> Principal {
    Principal::new("u1")
}

fn analyst_a() -> Principal {
    Principal::new("analyst-a")
}

/// U1 with one session, analyst A authorized and U1's pattern analyzed by A.
fn analyzed(h: &mut Harness) {
    h.registry
        .create_session(&at("u1", 10), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    h.registry
        .authorize_analyst(&at(ADMIN, 11), &analyst_a())
        .unwrap();
    h.registry
        .analyze_pattern(&at("analyst-a", 12), &u1())
        .unwrap();
}

#[test]
fn first_session_gets_id_one() {
    let mut h = harness();
    let id = h
        .registry
        .create_session(&at("u1", 1_000), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    assert_eq!(id, SessionId(1));
    assert_eq!(h.registry.sessions_of(&u1()), &[SessionId(1)]);
    let info = h.registry.session_info(id).unwrap();
    assert!(info.is_active);
    assert_eq!(info.created_at_ms, 1_000);
    assert_eq!(info.analyst, None);
    assert_eq!(h.events.kinds(), vec![EventKind::SessionRecorded]);
    assert_eq!(h.registry.telemetry().counter("op.create-session.ok"), 1);
}

#[test]
fn rejected_session_consumes_no_id() {
    let mut h = harness();
    let err = h
        .registry
        .create_session(&at("u1", 1), SessionInput::new(30, 150, 2, 10))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(h.registry.next_session_id(), SessionId(1));
    let id = h
        .registry
        .create_session(&at("u2", 2), SessionInput::new(30, 50, 2, 10))
        .unwrap();
    assert_eq!(id, SessionId(1));
    assert!(h.registry.sessions_of(&u1()).is_empty());
    assert_eq!(h.registry.telemetry().counter("reject.invalid-input"), 1);
    assert_eq!(h.events.count(EventKind::SessionRecorded), 1);
}

#[test]
fn pattern_stays_bound_to_first_session() {
    let mut h = harness();
    let first = h
        .registry
        .create_session(&at("u1", 1), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    let first_handles = h.registry.session_handles(first, &u1()).unwrap();
    assert_eq!(h.registry.pattern_handles(&u1(), &u1()).unwrap(), first_handles);

    for at_ms in 2..4 {
        h.registry
            .create_session(&at("u1", at_ms), SessionInput::new(90, 5, 9, 400))
            .unwrap();
    }
    assert_eq!(h.registry.pattern_handles(&u1(), &u1()).unwrap(), first_handles);
    let info = h.registry.pattern_info(&u1()).unwrap();
    assert_eq!(info.session_count, 3);
    assert!(!info.is_analyzed);
}

#[test]
fn analysis_requires_authorization() {
    let mut h = harness();
    h.registry
        .create_session(&at("u1", 1), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    let err = h
        .registry
        .analyze_pattern(&at("analyst-a", 2), &u1())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    assert!(h.registry.pattern_handles(&u1(), &analyst_a()).is_err());

    assert!(h
        .registry
        .authorize_analyst(&at(ADMIN, 3), &analyst_a())
        .unwrap());
    let info = h
        .registry
        .analyze_pattern(&at("analyst-a", 4), &u1())
        .unwrap();
    assert!(info.is_analyzed);
    assert_eq!(info.session_count, 1);
    assert!(h.registry.pattern_handles(&u1(), &analyst_a()).is_ok());
    assert_eq!(
        h.events.kinds(),
        vec![
            EventKind::SessionRecorded,
            EventKind::AnalystAuthorized,
            EventKind::PatternAnalyzed,
        ]
    );
}

#[test]
fn analyzing_a_silent_subject_fails() {
    let mut h = harness();
    h.registry
        .authorize_analyst(&at(ADMIN, 1), &analyst_a())
        .unwrap();
    let err = h
        .registry
        .analyze_pattern(&at("analyst-a", 2), &Principal::new("ghost"))
        .unwrap_err();
    assert!(matches!(err, RegistryError::NoSessions(_)));
}

#[test]
fn bad_proof_leaves_request_pending_until_genuine_delivery() {
    let mut h = harness();
    analyzed(&mut h);
    let id = h
        .registry
        .request_decryption(&at("analyst-a", 20), &u1())
        .unwrap();
    let delivery = h.oracle.deliver(id).unwrap();
    let forged = delivery.clone().tampered();

    let err = h
        .registry
        .on_decryption_callback(&at(ORACLE, 21), id, &forged.payload, &forged.proof)
        .unwrap_err();
    assert!(matches!(err, RegistryError::ProofInvalid(_)));
    assert!(err.is_callback_failure());
    assert_eq!(
        h.registry.decryption_request(id).unwrap().state,
        DecryptionState::Requested
    );

    let state = h
        .registry
        .on_decryption_callback(&at(ORACLE, 25), id, &delivery.payload, &delivery.proof)
        .unwrap();
    let expected = vec![DecryptedValue {
        width: BitWidth::U8,
        value: 55,
    }];
    assert_eq!(
        state,
        DecryptionState::Fulfilled {
            values: expected.clone()
        }
    );
    assert_eq!(h.consumer.delivered(), vec![(id, expected)]);
    assert_eq!(h.registry.decryption_request(id).unwrap().resolved_at_ms, Some(25));
    assert_eq!(h.registry.pending_decryptions().count(), 0);
}

#[test]
fn callback_is_exactly_once() {
    let mut h = harness();
    analyzed(&mut h);
    let id = h
        .registry
        .request_decryption(&at("analyst-a", 20), &u1())
        .unwrap();
    let delivery = h.oracle.deliver(id).unwrap();
    h.registry
        .on_decryption_callback(&at(ORACLE, 21), id, &delivery.payload, &delivery.proof)
        .unwrap();
    let before = h.registry.decryption_request(id).unwrap();
    let events_before = h.events.events().len();

    let err = h
        .registry
        .on_decryption_callback(&at(ORACLE, 22), id, &delivery.payload, &delivery.proof)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    assert_eq!(h.registry.decryption_request(id), Some(before));
    assert_eq!(h.events.events().len(), events_before);
    assert_eq!(h.consumer.delivered().len(), 1);
}

#[test]
fn request_status_does_not_carry_handles() {
    let mut h = harness();
    analyzed(&mut h);
    let id = h
        .registry
        .request_decryption(&at("analyst-a", 20), &u1())
        .unwrap();
    let mallory = Principal::new("mallory");
    assert_eq!(
        h.registry.pattern_handles(&u1(), &mallory).unwrap_err().kind(),
        ErrorKind::NotAuthorized
    );

    let status = h.registry.decryption_request(id).unwrap();
    assert_eq!(status.requester, analyst_a());
    assert_eq!(status.subject, u1());
    assert_eq!(status.state, DecryptionState::Requested);
    let json = serde_json::to_value(&status).unwrap();
    assert!(json.get("handles").is_none());
    assert_eq!(h.registry.pending_decryptions().collect::<Vec<_>>(), vec![id]);
}

#[test]
fn unknown_correlation_is_rejected() {
    let mut h = harness();
    let err = h
        .registry
        .on_decryption_callback(&at(ORACLE, 1), CorrelationId(99), &[1], &[0; 32])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownRequest);
}

#[test]
fn decryption_requires_analyzed_pattern_and_capability() {
    let mut h = harness();
    h.registry
        .create_session(&at("u1", 1), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    h.registry
        .authorize_analyst(&at(ADMIN, 2), &analyst_a())
        .unwrap();
    let err = h
        .registry
        .request_decryption(&at("analyst-a", 3), &u1())
        .unwrap_err();
    assert!(matches!(err, RegistryError::PatternNotAnalyzed(_)));

    h.registry
        .analyze_pattern(&at("analyst-a", 4), &u1())
        .unwrap();
    let analyst_b = Principal::new("analyst-b");
    h.registry
        .authorize_analyst(&at(ADMIN, 5), &analyst_b)
        .unwrap();
    let err = h
        .registry
        .request_decryption(&at("analyst-b", 6), &u1())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    assert!(h.oracle.pending().is_empty());
}

#[test]
fn verified_but_malformed_payload_fails_the_request() {
    let mut h = harness();
    analyzed(&mut h);
    let id = h
        .registry
        .request_decryption(&at("analyst-a", 20), &u1())
        .unwrap();
    let payload = [0x00, 0x37];
    let proof = h.oracle.sign(id, &payload);
    let state = h
        .registry
        .on_decryption_callback(&at(ORACLE, 21), id, &payload, &proof)
        .unwrap();
    assert!(matches!(state, DecryptionState::Failed { .. }));
    assert!(h.consumer.delivered().is_empty());
    assert_eq!(h.events.count(EventKind::DecryptionFailed), 1);

    // A fresh request is a new correlation, not a retry.
    let retry = h
        .registry
        .request_decryption(&at("analyst-a", 22), &u1())
        .unwrap();
    assert_ne!(retry, id);
}

#[test]
fn callback_origin_is_enforced_when_configured() {
    let mut h = harness_with(RegistryConfig::default().with_callback_origin(ORACLE));
    analyzed(&mut h);
    let id = h
        .registry
        .request_decryption(&at("analyst-a", 20), &u1())
        .unwrap();
    let delivery = h.oracle.deliver(id).unwrap();
    let err = h
        .registry
        .on_decryption_callback(&at("mallory", 21), id, &delivery.payload, &delivery.proof)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    assert_eq!(
        h.registry.decryption_request(id).unwrap().state,
        DecryptionState::Requested
    );
    assert!(h
        .registry
        .on_decryption_callback(&at(ORACLE, 22), id, &delivery.payload, &delivery.proof)
        .is_ok());
}

#[test]
fn revocation_keeps_granted_capabilities() {
    let mut h = harness();
    analyzed(&mut h);
    let held = h.registry.pattern_handles(&u1(), &analyst_a()).unwrap();
    assert!(h
        .registry
        .revoke_analyst(&at(ADMIN, 30), &analyst_a())
        .unwrap());
    assert!(!h.registry.is_analyst(&analyst_a()));
    assert_eq!(h.registry.pattern_handles(&u1(), &analyst_a()).unwrap(), held);
    let session = h.registry.sessions_of(&u1())[0];
    assert_eq!(
        h.registry.session_handles(session, &u1()).unwrap(),
        held,
        "pattern shares the first session's handles"
    );
    let err = h
        .registry
        .request_decryption(&at("analyst-a", 31), &u1())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
}

#[test]
fn assignment_is_admin_only_and_grants_session_handles() {
    let mut h = harness();
    let id = h
        .registry
        .create_session(&at("u1", 1), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    let err = h
        .registry
        .assign_analyst(&at("u1", 2), id, &analyst_a())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    let err = h
        .registry
        .assign_analyst(&at(ADMIN, 3), id, &analyst_a())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);

    h.registry
        .authorize_analyst(&at(ADMIN, 4), &analyst_a())
        .unwrap();
    h.registry
        .assign_analyst(&at(ADMIN, 5), id, &analyst_a())
        .unwrap();
    assert_eq!(h.registry.session_info(id).unwrap().analyst, Some(analyst_a()));
    assert!(h.registry.session_handles(id, &analyst_a()).is_ok());

    assert!(h.registry.deactivate_session(&at(ADMIN, 6), id).unwrap());
    assert!(!h.registry.deactivate_session(&at(ADMIN, 7), id).unwrap());
    let err = h
        .registry
        .assign_analyst(&at(ADMIN, 8), id, &analyst_a())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionInactive);
    assert_eq!(h.events.count(EventKind::SessionDeactivated), 1);
}

#[test]
fn anomalous_metrics_flag_later_sessions() {
    let mut h = harness();
    h.registry
        .create_session(&at("u1", 1), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    h.registry
        .authorize_analyst(&at(ADMIN, 2), &analyst_a())
        .unwrap();
    let review = h
        .registry
        .publish_metrics(&at("analyst-a", 3), &u1(), MetricsInput::new(40, 85, 12))
        .unwrap();
    assert!(review);
    assert!(h.registry.metrics_info(&u1()).unwrap());
    assert!(h.registry.metrics_handles(&u1(), &u1()).is_ok());
    assert!(h
        .registry
        .metrics_handles(&u1(), &Principal::new("u2"))
        .is_err());

    let second = h
        .registry
        .create_session(&at("u1", 4), SessionInput::new(30, 55, 2, 10))
        .unwrap();
    let anomalies: Vec<RegistryEvent> = h
        .events
        .events()
        .into_iter()
        .filter(|event| event.kind == EventKind::AnomalyDetected)
        .collect();
    assert_eq!(anomalies.len(), 2);
    assert_eq!(anomalies[0].reference, EventRef::Subject(u1()));
    assert_eq!(anomalies[1].reference, EventRef::Session(second));

    let calm = h
        .registry
        .publish_metrics(&at("analyst-a", 5), &u1(), MetricsInput::new(40, 70, 12))
        .unwrap();
    assert!(!calm);
    assert!(!h.registry.metrics_info(&u1()).unwrap());
}

struct BrokenSink;

impl EventSink for BrokenSink {
    fn emit(&self, _event: RegistryEvent) -> anyhow::Result<()> {
        anyhow::bail!("feed offline")
    }
}

#[test]
fn failing_event_sink_does_not_roll_back() {
    let engine = Arc::new(DeterministicEngine::new([1u8; 32]));
    let oracle = Arc::new(SimulatedOracle::new(engine.clone(), [1u8; 32]));
    let mut registry = Registry::new(RegistryConfig::default(), engine, oracle)
        .unwrap()
        .with_event_sink(Arc::new(BrokenSink));
    let id = registry
        .create_session(&at("u1", 1), SessionInput::new(1, 1, 1, 1))
        .unwrap();
    assert_eq!(registry.sessions_of(&u1()), &[id]);
}

#[test]
fn apply_dispatches_logged_operations() {
    let mut h = harness();
    let outcome = h
        .registry
        .apply(
            &at("u1", 1),
            Operation::CreateSession(SessionInput::new(30, 55, 2, 10)),
        )
        .unwrap();
    assert_eq!(
        outcome,
        OperationOutcome::SessionCreated {
            session_id: SessionId(1)
        }
    );
    h.registry
        .apply(
            &at(ADMIN, 2),
            Operation::AuthorizeAnalyst {
                analyst: analyst_a(),
            },
        )
        .unwrap();
    h.registry
        .apply(&at("analyst-a", 3), Operation::AnalyzePattern { subject: u1() })
        .unwrap();
    let outcome = h
        .registry
        .apply(
            &at("analyst-a", 4),
            Operation::RequestDecryption { subject: u1() },
        )
        .unwrap();
    let correlation_id = match outcome {
        OperationOutcome::DecryptionRequested { correlation_id } => correlation_id,
        other => panic!("unexpected outcome {other:?}"),
    };
    let delivery = h.oracle.deliver(correlation_id).unwrap();
    let outcome = h
        .registry
        .apply(
            &at(ORACLE, 5),
            Operation::DecryptionCallback {
                correlation_id,
                payload: delivery.payload,
                proof: delivery.proof,
            },
        )
        .unwrap();
    assert!(matches!(
        outcome,
        OperationOutcome::DecryptionResolved {
            resolution: DecryptionState::Fulfilled { .. },
            ..
        }
    ));
    let err = h
        .registry
        .apply(&at("u1", 6), Operation::DeactivateSession { session_id: SessionId(1) })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAuthorized);
    assert_eq!(h.registry.telemetry().counter("op.deactivate-session.rejected"), 1);
}

#[test]
fn invalid_config_is_refused() {
    let engine = Arc::new(DeterministicEngine::new([1u8; 32]));
    let oracle = Arc::new(SimulatedOracle::new(engine.clone(), [1u8; 32]));
    let config = RegistryConfig::default().with_administrator("did:veiltrace:registry");
    let err = Registry::new(config, engine, oracle).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidConfig);
}
