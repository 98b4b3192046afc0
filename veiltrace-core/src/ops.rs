//! Serializable form of every mutating registry operation, as carried by an
//! execution log.

use serde::{Deserialize, Serialize};

use crate::decryption::DecryptionState;
use crate::errors::RegistryResult;
use crate::metrics::MetricsInput;
use crate::registry::{PatternInfo, Registry};
use crate::sessions::SessionInput;
use crate::types::{CorrelationId, Invocation, Principal, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum Operation {
    CreateSession(SessionInput),
    AuthorizeAnalyst {
        analyst: Principal,
    },
    RevokeAnalyst {
        analyst: Principal,
    },
    AssignAnalyst {
        session_id: SessionId,
        analyst: Principal,
    },
    DeactivateSession {
        session_id: SessionId,
    },
    AnalyzePattern {
        subject: Principal,
    },
    PublishMetrics {
        subject: Principal,
        privacy_score: u64,
        anomaly_level: u64,
        variability: u64,
    },
    RequestDecryption {
        subject: Principal,
    },
    DecryptionCallback {
        correlation_id: CorrelationId,
        #[serde(with = "hex::serde")]
        payload: Vec<u8>,
        #[serde(with = "hex::serde")]
        proof: Vec<u8>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateSession(_) => "create-session",
            Operation::AuthorizeAnalyst { .. } => "authorize-analyst",
            Operation::RevokeAnalyst { .. } => "revoke-analyst",
            Operation::AssignAnalyst { .. } => "assign-analyst",
            Operation::DeactivateSession { .. } => "deactivate-session",
            Operation::AnalyzePattern { .. } => "analyze-pattern",
            Operation::PublishMetrics { .. } => "publish-metrics",
            Operation::RequestDecryption { .. } => "request-decryption",
            Operation::DecryptionCallback { .. } => "decryption-callback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum OperationOutcome {
    SessionCreated {
        session_id: SessionId,
    },
    AnalystAuthorized {
        analyst: Principal,
        changed: bool,
    },
    AnalystRevoked {
        analyst: Principal,
        changed: bool,
    },
    AnalystAssigned {
        session_id: SessionId,
        analyst: Principal,
    },
    SessionDeactivated {
        session_id: SessionId,
        changed: bool,
    },
    PatternAnalyzed {
        subject: Principal,
        pattern: PatternInfo,
    },
    MetricsPublished {
        subject: Principal,
        requires_review: bool,
    },
    DecryptionRequested {
        correlation_id: CorrelationId,
    },
    DecryptionResolved {
        correlation_id: CorrelationId,
        resolution: DecryptionState,
    },
}

impl Registry {
    /// Applies one logged operation.
    pub fn apply(
        &mut self,
        invocation: &Invocation,
        operation: Operation,
    ) -> RegistryResult<OperationOutcome> {
        let outcome = match operation {
            Operation::CreateSession(input) => OperationOutcome::SessionCreated {
                session_id: self.create_session(invocation, input)?,
            },
            Operation::AuthorizeAnalyst { analyst } => OperationOutcome::AnalystAuthorized {
                changed: self.authorize_analyst(invocation, &analyst)?,
                analyst,
            },
            Operation::RevokeAnalyst { analyst } => OperationOutcome::AnalystRevoked {
                changed: self.revoke_analyst(invocation, &analyst)?,
                analyst,
            },
            Operation::AssignAnalyst {
                session_id,
                analyst,
            } => {
                self.assign_analyst(invocation, session_id, &analyst)?;
                OperationOutcome::AnalystAssigned {
                    session_id,
                    analyst,
                }
            }
            Operation::DeactivateSession { session_id } => OperationOutcome::SessionDeactivated {
                changed: self.deactivate_session(invocation, session_id)?,
                session_id,
            },
            Operation::AnalyzePattern { subject } => OperationOutcome::PatternAnalyzed {
                pattern: self.analyze_pattern(invocation, &subject)?,
                subject,
            },
            Operation::PublishMetrics {
                subject,
                privacy_score,
                anomaly_level,
                variability,
            } => OperationOutcome::MetricsPublished {
                requires_review: self.publish_metrics(
                    invocation,
                    &subject,
                    MetricsInput::new(privacy_score, anomaly_level, variability),
                )?,
                subject,
            },
            Operation::RequestDecryption { subject } => OperationOutcome::DecryptionRequested {
                correlation_id: self.request_decryption(invocation, &subject)?,
            },
            Operation::DecryptionCallback {
                correlation_id,
                payload,
                proof,
            } => OperationOutcome::DecryptionResolved {
                resolution: self.on_decryption_callback(
                    invocation,
                    correlation_id,
                    &payload,
                    &proof,
                )?,
                correlation_id,
            },
        };
        Ok(outcome)
    }
}
