//! Decryption oracle seam.
//!
//! The registry hands handles to a [`DecryptionOracle`] and later receives
//! the cleartext through a callback that carries a proof bound to the
//! correlation id and payload. [`SimulatedOracle`] plays the oracle for tests
//! and journal replay: it reads plaintexts from a [`DeterministicEngine`] and
//! signs deliveries with a keyed BLAKE3 MAC.

use std::collections::BTreeMap;
use std::sync::Arc;

use blake3::Hasher;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decryption::encode_cleartexts;
use crate::handle::{DeterministicEngine, EncryptedHandle};
use crate::types::CorrelationId;

const PROOF_DOMAIN: &[u8] = b"veiltrace/decryption-proof/v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
    #[error("decryption request must name at least one handle")]
    EmptyRequest,
    #[error("oracle has no pending request {0}")]
    UnknownCorrelation(CorrelationId),
    #[error("oracle cannot resolve handle {0}")]
    UnknownHandle(String),
}

pub trait DecryptionOracle: Send + Sync {
    /// Queues the handles for decryption and returns the id the callback will
    /// carry.
    fn submit(&self, handles: &[EncryptedHandle]) -> Result<CorrelationId, OracleError>;

    /// Checks that `proof` attests `payload` as the answer to `correlation_id`.
    fn verify_proof(&self, correlation_id: CorrelationId, payload: &[u8], proof: &[u8]) -> bool;
}

/// Material the oracle delivers back to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OracleDelivery {
    pub correlation_id: CorrelationId,
    pub payload: Vec<u8>,
    pub proof: Vec<u8>,
}

impl OracleDelivery {
    /// Same delivery with one proof bit flipped.
    pub fn tampered(mut self) -> Self {
        match self.proof.first_mut() {
            Some(byte) => *byte ^= 0x01,
            None => self.proof.push(0x01),
        }
        self
    }
}

struct OracleState {
    next_id: u64,
    pending: BTreeMap<CorrelationId, Vec<EncryptedHandle>>,
}

pub struct SimulatedOracle {
    engine: Arc<DeterministicEngine>,
    key: [u8; 32],
    state: Mutex<OracleState>,
}

impl SimulatedOracle {
    pub fn new(engine: Arc<DeterministicEngine>, key: [u8; 32]) -> Self {
        Self {
            engine,
            key,
            state: Mutex::new(OracleState {
                next_id: 1,
                pending: BTreeMap::new(),
            }),
        }
    }

    fn mac(&self, correlation_id: CorrelationId, payload: &[u8]) -> blake3::Hash {
        let mut hasher = Hasher::new_keyed(&self.key);
        hasher.update(PROOF_DOMAIN);
        hasher.update(&correlation_id.to_be_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn sign(&self, correlation_id: CorrelationId, payload: &[u8]) -> Vec<u8> {
        self.mac(correlation_id, payload).as_bytes().to_vec()
    }

    pub fn pending(&self) -> Vec<CorrelationId> {
        self.state.lock().pending.keys().copied().collect()
    }

    /// Decrypts a queued request and signs the payload. The request stays
    /// queued, so the same delivery can be replayed.
    pub fn deliver(&self, correlation_id: CorrelationId) -> Result<OracleDelivery, OracleError> {
        let handles = self
            .state
            .lock()
            .pending
            .get(&correlation_id)
            .cloned()
            .ok_or(OracleError::UnknownCorrelation(correlation_id))?;
        let mut values = Vec::with_capacity(handles.len());
        for handle in &handles {
            let value = self
                .engine
                .reveal(handle)
                .ok_or_else(|| OracleError::UnknownHandle(handle.id.to_hex()))?;
            values.push((value, handle.width));
        }
        let payload = encode_cleartexts(&values);
        let proof = self.sign(correlation_id, &payload);
        Ok(OracleDelivery {
            correlation_id,
            payload,
            proof,
        })
    }

    /// Forgets a request once its callback has been accepted downstream.
    pub fn acknowledge(&self, correlation_id: CorrelationId) -> bool {
        self.state.lock().pending.remove(&correlation_id).is_some()
    }
}

impl DecryptionOracle for SimulatedOracle {
    fn submit(&self, handles: &[EncryptedHandle]) -> Result<CorrelationId, OracleError> {
        if handles.is_empty() {
            return Err(OracleError::EmptyRequest);
        }
        let mut state = self.state.lock();
        let id = CorrelationId(state.next_id);
        state.next_id += 1;
        state.pending.insert(id, handles.to_vec());
        Ok(id)
    }

    fn verify_proof(&self, correlation_id: CorrelationId, payload: &[u8], proof: &[u8]) -> bool {
        let Ok(bytes) = <[u8; 32]>::try_from(proof) else {
            return false;
        };
        // blake3::Hash equality is constant-time.
        self.mac(correlation_id, payload) == blake3::Hash::from(bytes)
    }
}
