use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::handle::EngineError;
use crate::oracle::OracleError;
use crate::types::{CorrelationId, Principal, SessionId};

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Every failure aborts the operation before any state is touched.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid input: {field} = {value} exceeds {max}")]
    InvalidInput {
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("{principal} is not authorized to {action}")]
    NotAuthorized {
        principal: Principal,
        action: &'static str,
    },
    #[error("{0} is inactive")]
    SessionInactive(SessionId),
    #[error("{0} does not exist")]
    UnknownSession(SessionId),
    #[error("subject {0} has no sessions")]
    NoSessions(Principal),
    #[error("pattern for subject {0} has not been analyzed")]
    PatternNotAnalyzed(Principal),
    #[error("no metrics published for subject {0}")]
    NoMetrics(Principal),
    #[error("proof for {0} failed verification")]
    ProofInvalid(CorrelationId),
    #[error("{0} was already resolved")]
    AlreadyResolved(CorrelationId),
    #[error("{0} does not match any decryption request")]
    UnknownRequest(CorrelationId),
    #[error("oracle reissued correlation id {0}")]
    DuplicateCorrelation(CorrelationId),
    #[error("registry configuration invalid: {0}")]
    InvalidConfig(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
}

/// Flat discriminator so callers can tell whether to fix input, seek
/// authorization, wait, or retry with a fresh request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    InvalidInput,
    NotAuthorized,
    SessionInactive,
    UnknownSession,
    NoSessions,
    PatternNotAnalyzed,
    NoMetrics,
    ProofInvalid,
    AlreadyResolved,
    UnknownRequest,
    DuplicateCorrelation,
    InvalidConfig,
    Engine,
    Oracle,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::NotAuthorized => "not-authorized",
            ErrorKind::SessionInactive => "session-inactive",
            ErrorKind::UnknownSession => "unknown-session",
            ErrorKind::NoSessions => "no-sessions",
            ErrorKind::PatternNotAnalyzed => "pattern-not-analyzed",
            ErrorKind::NoMetrics => "no-metrics",
            ErrorKind::ProofInvalid => "proof-invalid",
            ErrorKind::AlreadyResolved => "already-resolved",
            ErrorKind::UnknownRequest => "unknown-request",
            ErrorKind::DuplicateCorrelation => "duplicate-correlation",
            ErrorKind::InvalidConfig => "invalid-config",
            ErrorKind::Engine => "engine",
            ErrorKind::Oracle => "oracle",
        }
    }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::InvalidInput { .. } => ErrorKind::InvalidInput,
            RegistryError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            RegistryError::SessionInactive(_) => ErrorKind::SessionInactive,
            RegistryError::UnknownSession(_) => ErrorKind::UnknownSession,
            RegistryError::NoSessions(_) => ErrorKind::NoSessions,
            RegistryError::PatternNotAnalyzed(_) => ErrorKind::PatternNotAnalyzed,
            RegistryError::NoMetrics(_) => ErrorKind::NoMetrics,
            RegistryError::ProofInvalid(_) => ErrorKind::ProofInvalid,
            RegistryError::AlreadyResolved(_) => ErrorKind::AlreadyResolved,
            RegistryError::UnknownRequest(_) => ErrorKind::UnknownRequest,
            RegistryError::DuplicateCorrelation(_) => ErrorKind::DuplicateCorrelation,
            RegistryError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            RegistryError::Engine(_) => ErrorKind::Engine,
            RegistryError::Oracle(_) => ErrorKind::Oracle,
        }
    }

    /// Raised only on the asynchronous callback path.
    pub fn is_callback_failure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProofInvalid | ErrorKind::AlreadyResolved
        )
    }
}
