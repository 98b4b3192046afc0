//! Correlated decryption requests.
//!
//! A request is stored under the correlation id returned by the oracle and
//! moves `Requested -> Fulfilled | Failed` exactly once. The payload of a
//! callback is only decoded after its proof verifies; a rejected proof leaves
//! the request untouched so the genuine delivery can still land.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::{RegistryError, RegistryResult};
use crate::handle::{BitWidth, EncryptedHandle};
use crate::oracle::DecryptionOracle;
use crate::types::{CorrelationId, Principal};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedValue {
    pub width: BitWidth,
    pub value: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum DecryptionState {
    Requested,
    Fulfilled { values: Vec<DecryptedValue> },
    Failed { reason: String },
}

impl DecryptionState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, DecryptionState::Requested)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DecryptionRequest {
    pub correlation_id: CorrelationId,
    pub handles: Vec<EncryptedHandle>,
    pub subject: Principal,
    pub requester: Principal,
    pub requested_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
    pub state: DecryptionState,
}

/// What a caller may learn about a request. The handles under decryption
/// stay inside the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DecryptionStatus {
    pub correlation_id: CorrelationId,
    pub subject: Principal,
    pub requester: Principal,
    pub requested_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
    pub state: DecryptionState,
}

impl From<&DecryptionRequest> for DecryptionStatus {
    fn from(request: &DecryptionRequest) -> Self {
        Self {
            correlation_id: request.correlation_id,
            subject: request.subject.clone(),
            requester: request.requester.clone(),
            requested_at_ms: request.requested_at_ms,
            resolved_at_ms: request.resolved_at_ms,
            state: request.state.clone(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload carries {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Concatenates big-endian values, each in exactly `width / 8` bytes.
pub fn encode_cleartexts(values: &[(u64, BitWidth)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(values.iter().map(|(_, width)| width.bytes()).sum());
    for (value, width) in values {
        let bytes = value.to_be_bytes();
        payload.extend_from_slice(&bytes[bytes.len() - width.bytes()..]);
    }
    payload
}

pub fn decode_cleartexts(
    payload: &[u8],
    widths: &[BitWidth],
) -> Result<Vec<DecryptedValue>, DecodeError> {
    let expected: usize = widths.iter().map(|width| width.bytes()).sum();
    if payload.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: payload.len(),
        });
    }
    let mut offset = 0;
    let mut values = Vec::with_capacity(widths.len());
    for &width in widths {
        let chunk = &payload[offset..offset + width.bytes()];
        let value = chunk
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        values.push(DecryptedValue { width, value });
        offset += width.bytes();
    }
    Ok(values)
}

/// Downstream processing of fulfilled requests.
pub trait DecryptionConsumer: Send + Sync {
    fn consume(&self, request: &DecryptionRequest, values: &[DecryptedValue]) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct NoopConsumer;

impl DecryptionConsumer for NoopConsumer {
    fn consume(&self, _request: &DecryptionRequest, _values: &[DecryptedValue]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records every delivered cleartext.
#[derive(Clone, Debug, Default)]
pub struct CollectingConsumer {
    delivered: Arc<Mutex<Vec<(CorrelationId, Vec<DecryptedValue>)>>>,
}

impl CollectingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(CorrelationId, Vec<DecryptedValue>)> {
        self.delivered.lock().clone()
    }
}

impl DecryptionConsumer for CollectingConsumer {
    fn consume(&self, request: &DecryptionRequest, values: &[DecryptedValue]) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .push((request.correlation_id, values.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DecryptionProtocol {
    requests: BTreeMap<CorrelationId, DecryptionRequest>,
}

impl DecryptionProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits `handles` to the oracle and records the pending request.
    pub fn request(
        &mut self,
        oracle: &dyn DecryptionOracle,
        handles: Vec<EncryptedHandle>,
        subject: &Principal,
        requester: &Principal,
        at_ms: u64,
    ) -> RegistryResult<CorrelationId> {
        let correlation_id = oracle.submit(&handles)?;
        // The id only exists once the oracle has it, so a reissued id is left
        // pending at the oracle; it can never be resolved here.
        if self.requests.contains_key(&correlation_id) {
            return Err(RegistryError::DuplicateCorrelation(correlation_id));
        }
        info!(
            %correlation_id,
            %subject,
            %requester,
            handles = handles.len(),
            "decryption requested"
        );
        self.requests.insert(
            correlation_id,
            DecryptionRequest {
                correlation_id,
                handles,
                subject: subject.clone(),
                requester: requester.clone(),
                requested_at_ms: at_ms,
                resolved_at_ms: None,
                state: DecryptionState::Requested,
            },
        );
        Ok(correlation_id)
    }

    /// Resolves a pending request. Proof failures are errors and change
    /// nothing; an undecodable but verified payload resolves to `Failed`.
    pub fn callback(
        &mut self,
        oracle: &dyn DecryptionOracle,
        correlation_id: CorrelationId,
        payload: &[u8],
        proof: &[u8],
        at_ms: u64,
    ) -> RegistryResult<&DecryptionRequest> {
        let request = self
            .requests
            .get_mut(&correlation_id)
            .ok_or(RegistryError::UnknownRequest(correlation_id))?;
        if request.state.is_resolved() {
            return Err(RegistryError::AlreadyResolved(correlation_id));
        }
        if !oracle.verify_proof(correlation_id, payload, proof) {
            warn!(%correlation_id, "decryption proof rejected");
            return Err(RegistryError::ProofInvalid(correlation_id));
        }
        let widths: Vec<BitWidth> = request.handles.iter().map(|handle| handle.width).collect();
        request.state = match decode_cleartexts(payload, &widths) {
            Ok(values) => DecryptionState::Fulfilled { values },
            Err(err) => {
                warn!(%correlation_id, error = %err, "verified payload could not be decoded");
                DecryptionState::Failed {
                    reason: err.to_string(),
                }
            }
        };
        request.resolved_at_ms = Some(at_ms);
        info!(%correlation_id, resolved = ?request.state, "decryption resolved");
        Ok(request)
    }

    pub fn get(&self, correlation_id: CorrelationId) -> Option<&DecryptionRequest> {
        self.requests.get(&correlation_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &DecryptionRequest> {
        self.requests
            .values()
            .filter(|request| !request.state.is_resolved())
    }
}
