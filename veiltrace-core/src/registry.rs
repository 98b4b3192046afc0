use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use veiltrace_telemetry::{TelemetryHandle, DECRYPTION_ROUND_TRIP};

use crate::capability::{AnalystRegistry, CapabilityLedger};
use crate::config::RegistryConfig;
use crate::decryption::{
    DecryptionConsumer, DecryptionProtocol, DecryptionState, DecryptionStatus, NoopConsumer,
};
use crate::errors::{RegistryError, RegistryResult};
use crate::events::{EventKind, EventRef, EventSink, NoopEventSink, RegistryEvent};
use crate::handle::{EncryptedHandle, HomomorphicEngine};
use crate::metrics::{MetricsInput, MetricsPublisher};
use crate::oracle::DecryptionOracle;
use crate::pattern::PatternAggregator;
use crate::sessions::{RecordStore, SessionInfo, SessionInput};
use crate::types::{CorrelationId, Invocation, Principal, SessionId};

/// Public view of a subject's pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PatternInfo {
    pub session_count: u64,
    pub is_analyzed: bool,
}

/// Owns every component and the single capability ledger they share.
///
/// Each mutating method is one entry of the execution log: it either
/// commits completely and then emits its events, or returns an error having
/// changed nothing.
pub struct Registry {
    config: RegistryConfig,
    engine: Arc<dyn HomomorphicEngine>,
    oracle: Arc<dyn DecryptionOracle>,
    events: Arc<dyn EventSink>,
    consumer: Arc<dyn DecryptionConsumer>,
    telemetry: TelemetryHandle,
    ledger: CapabilityLedger,
    analysts: AnalystRegistry,
    store: RecordStore,
    patterns: PatternAggregator,
    metrics: MetricsPublisher,
    decryptions: DecryptionProtocol,
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        engine: Arc<dyn HomomorphicEngine>,
        oracle: Arc<dyn DecryptionOracle>,
    ) -> RegistryResult<Self> {
        config.validate()?;
        Ok(Self {
            analysts: AnalystRegistry::new(config.administrator.clone()),
            store: RecordStore::new(&config),
            metrics: MetricsPublisher::new(&config),
            patterns: PatternAggregator::new(),
            decryptions: DecryptionProtocol::new(),
            ledger: CapabilityLedger::new(),
            events: Arc::new(NoopEventSink),
            consumer: Arc::new(NoopConsumer),
            telemetry: TelemetryHandle::default(),
            engine,
            oracle,
            config,
        })
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn DecryptionConsumer>) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryHandle) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryHandle {
        &self.telemetry
    }

    fn emit(&self, kind: EventKind, reference: EventRef, principal: &Principal, at_ms: u64) {
        let event = RegistryEvent::new(kind, reference, principal, at_ms);
        if let Err(err) = self.events.emit(event) {
            error!(?kind, error = %err, "event sink failed");
        }
    }

    fn observe<T>(&self, operation: &'static str, result: RegistryResult<T>) -> RegistryResult<T> {
        let recorded = self
            .telemetry
            .record_operation(operation, result.is_ok());
        if let Err(err) = recorded {
            warn!(operation, error = %err, "telemetry counter rejected");
        }
        if let Err(rejection) = &result {
            let kind = rejection.kind();
            if let Err(err) = self.telemetry.record_rejection(kind.as_str()) {
                warn!(operation, error = %err, "telemetry counter rejected");
            }
            warn!(operation, kind = kind.as_str(), error = %rejection, "operation rejected");
        }
        result
    }

    /// Records a session for the calling subject, then updates its pattern.
    pub fn create_session(
        &mut self,
        invocation: &Invocation,
        input: SessionInput,
    ) -> RegistryResult<SessionId> {
        let result = self.commit_session(invocation, input);
        self.observe("create-session", result)
    }

    fn commit_session(
        &mut self,
        invocation: &Invocation,
        input: SessionInput,
    ) -> RegistryResult<SessionId> {
        let subject = &invocation.caller;
        let id = self.store.create(
            self.engine.as_ref(),
            &mut self.ledger,
            subject,
            input,
            invocation.at_ms,
        )?;
        self.patterns.touch(&self.store, subject)?;
        self.emit(
            EventKind::SessionRecorded,
            EventRef::Session(id),
            subject,
            invocation.at_ms,
        );
        if self.metrics.requires_review(subject) {
            self.emit(
                EventKind::AnomalyDetected,
                EventRef::Session(id),
                subject,
                invocation.at_ms,
            );
        }
        Ok(id)
    }

    /// Returns whether the analyst was newly authorized.
    pub fn authorize_analyst(
        &mut self,
        invocation: &Invocation,
        analyst: &Principal,
    ) -> RegistryResult<bool> {
        let result = self.analysts.authorize(&invocation.caller, analyst);
        if let Ok(true) = result {
            info!(%analyst, "analyst authorized");
            self.emit(
                EventKind::AnalystAuthorized,
                EventRef::Subject(analyst.clone()),
                &invocation.caller,
                invocation.at_ms,
            );
        }
        self.observe("authorize-analyst", result)
    }

    /// Clears the analyst flag. Capabilities already granted stay in place.
    pub fn revoke_analyst(
        &mut self,
        invocation: &Invocation,
        analyst: &Principal,
    ) -> RegistryResult<bool> {
        let result = self.analysts.revoke(&invocation.caller, analyst);
        if let Ok(true) = result {
            info!(%analyst, "analyst revoked");
            self.emit(
                EventKind::AnalystRevoked,
                EventRef::Subject(analyst.clone()),
                &invocation.caller,
                invocation.at_ms,
            );
        }
        self.observe("revoke-analyst", result)
    }

    pub fn assign_analyst(
        &mut self,
        invocation: &Invocation,
        session: SessionId,
        analyst: &Principal,
    ) -> RegistryResult<()> {
        let result = self.store.assign_analyst(
            &mut self.ledger,
            &self.analysts,
            &invocation.caller,
            session,
            analyst,
        );
        if result.is_ok() {
            self.emit(
                EventKind::AnalystAssigned,
                EventRef::Session(session),
                analyst,
                invocation.at_ms,
            );
        }
        self.observe("assign-analyst", result)
    }

    /// Returns whether the session was active before the call.
    pub fn deactivate_session(
        &mut self,
        invocation: &Invocation,
        session: SessionId,
    ) -> RegistryResult<bool> {
        let result = self
            .store
            .deactivate(&self.analysts, &invocation.caller, session);
        if let Ok(true) = result {
            info!(%session, "session deactivated");
            self.emit(
                EventKind::SessionDeactivated,
                EventRef::Session(session),
                &invocation.caller,
                invocation.at_ms,
            );
        }
        self.observe("deactivate-session", result)
    }

    /// Marks the subject's pattern analyzed on behalf of the calling analyst.
    pub fn analyze_pattern(
        &mut self,
        invocation: &Invocation,
        subject: &Principal,
    ) -> RegistryResult<PatternInfo> {
        let result = self
            .patterns
            .analyze(
                &self.store,
                &mut self.ledger,
                &self.analysts,
                subject,
                &invocation.caller,
            )
            .map(|pattern| PatternInfo {
                session_count: pattern.session_count,
                is_analyzed: pattern.is_analyzed,
            });
        if result.is_ok() {
            self.emit(
                EventKind::PatternAnalyzed,
                EventRef::Subject(subject.clone()),
                &invocation.caller,
                invocation.at_ms,
            );
        }
        self.observe("analyze-pattern", result)
    }

    /// Replaces the subject's metrics. Returns the review flag.
    pub fn publish_metrics(
        &mut self,
        invocation: &Invocation,
        subject: &Principal,
        input: MetricsInput,
    ) -> RegistryResult<bool> {
        let result = self
            .metrics
            .publish(
                self.engine.as_ref(),
                &mut self.ledger,
                &self.analysts,
                subject,
                &invocation.caller,
                input,
                invocation.at_ms,
            )
            .map(|metrics| metrics.requires_review);
        if let Ok(requires_review) = result {
            self.emit(
                EventKind::PrivacyMetricsUpdated,
                EventRef::Subject(subject.clone()),
                &invocation.caller,
                invocation.at_ms,
            );
            if requires_review {
                self.emit(
                    EventKind::AnomalyDetected,
                    EventRef::Subject(subject.clone()),
                    &invocation.caller,
                    invocation.at_ms,
                );
            }
        }
        self.observe("publish-metrics", result)
    }

    pub fn request_decryption(
        &mut self,
        invocation: &Invocation,
        subject: &Principal,
    ) -> RegistryResult<CorrelationId> {
        let result = self.submit_decryption(invocation, subject);
        if let Ok(correlation_id) = result {
            self.emit(
                EventKind::DecryptionRequested,
                EventRef::Request(correlation_id),
                &invocation.caller,
                invocation.at_ms,
            );
        }
        self.observe("request-decryption", result)
    }

    fn submit_decryption(
        &mut self,
        invocation: &Invocation,
        subject: &Principal,
    ) -> RegistryResult<CorrelationId> {
        let requester = &invocation.caller;
        self.analysts
            .require_analyst(requester, "request decryption")?;
        let pattern = self
            .patterns
            .get(subject)
            .filter(|pattern| pattern.is_analyzed)
            .ok_or_else(|| RegistryError::PatternNotAnalyzed(subject.clone()))?;
        let handles: Vec<EncryptedHandle> = self
            .config
            .decryption_targets
            .iter()
            .map(|field| pattern.handle(*field))
            .collect();
        self.ledger.require_all(&handles, requester)?;
        self.decryptions.request(
            self.oracle.as_ref(),
            handles,
            subject,
            requester,
            invocation.at_ms,
        )
    }

    /// Oracle entry point. Returns the state the request resolved to.
    pub fn on_decryption_callback(
        &mut self,
        invocation: &Invocation,
        correlation_id: CorrelationId,
        payload: &[u8],
        proof: &[u8],
    ) -> RegistryResult<DecryptionState> {
        let result = self.resolve_decryption(invocation, correlation_id, payload, proof);
        self.observe("decryption-callback", result)
    }

    fn resolve_decryption(
        &mut self,
        invocation: &Invocation,
        correlation_id: CorrelationId,
        payload: &[u8],
        proof: &[u8],
    ) -> RegistryResult<DecryptionState> {
        if let Some(origin) = &self.config.callback_origin {
            if origin != &invocation.caller {
                return Err(RegistryError::NotAuthorized {
                    principal: invocation.caller.clone(),
                    action: "deliver decryption callback",
                });
            }
        }
        let request = self
            .decryptions
            .callback(
                self.oracle.as_ref(),
                correlation_id,
                payload,
                proof,
                invocation.at_ms,
            )?
            .clone();
        self.telemetry.record_latency_ms(
            DECRYPTION_ROUND_TRIP,
            invocation.at_ms.saturating_sub(request.requested_at_ms),
        );
        let kind = match &request.state {
            DecryptionState::Fulfilled { values } => {
                if let Err(err) = self.consumer.consume(&request, values) {
                    error!(%correlation_id, error = %err, "decryption consumer failed");
                }
                EventKind::DecryptionFulfilled
            }
            _ => EventKind::DecryptionFailed,
        };
        self.emit(
            kind,
            EventRef::Request(correlation_id),
            &request.requester,
            invocation.at_ms,
        );
        Ok(request.state)
    }

    pub fn session_info(&self, session: SessionId) -> RegistryResult<SessionInfo> {
        self.store.info(session)
    }

    pub fn sessions_of(&self, subject: &Principal) -> &[SessionId] {
        self.store.sessions_of(subject)
    }

    pub fn session_count(&self, subject: &Principal) -> u64 {
        self.store.count_for(subject)
    }

    pub fn next_session_id(&self) -> SessionId {
        self.store.next_id()
    }

    pub fn pattern_info(&self, subject: &Principal) -> RegistryResult<PatternInfo> {
        self.patterns
            .get(subject)
            .map(|pattern| PatternInfo {
                session_count: pattern.session_count,
                is_analyzed: pattern.is_analyzed,
            })
            .ok_or_else(|| RegistryError::NoSessions(subject.clone()))
    }

    pub fn metrics_info(&self, subject: &Principal) -> RegistryResult<bool> {
        self.metrics
            .get(subject)
            .map(|metrics| metrics.requires_review)
            .ok_or_else(|| RegistryError::NoMetrics(subject.clone()))
    }

    pub fn is_analyst(&self, principal: &Principal) -> bool {
        self.analysts.is_authorized(principal)
    }

    /// Request metadata and state; the handles themselves are never returned.
    pub fn decryption_request(&self, correlation_id: CorrelationId) -> Option<DecryptionStatus> {
        self.decryptions.get(correlation_id).map(DecryptionStatus::from)
    }

    pub fn pending_decryptions(&self) -> impl Iterator<Item = CorrelationId> + '_ {
        self.decryptions
            .pending()
            .map(|request| request.correlation_id)
    }

    /// Session handles, only for a principal holding all four.
    pub fn session_handles(
        &self,
        session: SessionId,
        principal: &Principal,
    ) -> RegistryResult<[EncryptedHandle; 4]> {
        let handles = self.store.get(session)?.handles();
        self.ledger.require_all(&handles, principal)?;
        Ok(handles)
    }

    pub fn pattern_handles(
        &self,
        subject: &Principal,
        principal: &Principal,
    ) -> RegistryResult<[EncryptedHandle; 4]> {
        let handles = self
            .patterns
            .get(subject)
            .ok_or_else(|| RegistryError::NoSessions(subject.clone()))?
            .handles();
        self.ledger.require_all(&handles, principal)?;
        Ok(handles)
    }

    pub fn metrics_handles(
        &self,
        subject: &Principal,
        principal: &Principal,
    ) -> RegistryResult<[EncryptedHandle; 3]> {
        let handles = self
            .metrics
            .get(subject)
            .ok_or_else(|| RegistryError::NoMetrics(subject.clone()))?
            .handles();
        self.ledger.require_all(&handles, principal)?;
        Ok(handles)
    }
}
