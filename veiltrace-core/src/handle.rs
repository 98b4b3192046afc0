//! Encrypted handles and the homomorphic engine seam.
//!
//! The registry never sees plaintext after input validation: values are
//! turned into [`EncryptedHandle`]s by a [`HomomorphicEngine`] and only come
//! back out through the decryption protocol. Any backend that implements the
//! trait can be plugged in; [`DeterministicEngine`] is the seeded stand-in
//! used by tests and the replay node.

use std::collections::HashMap;
use std::fmt;

use blake3::Hasher;
use parking_lot::Mutex;
use rand::RngCore;
use rand_chacha::{rand_core::SeedableRng, ChaCha20Rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared plaintext width of an encrypted value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitWidth {
    U8,
    U16,
    U32,
}

impl BitWidth {
    pub const fn bits(self) -> u32 {
        match self {
            BitWidth::U8 => 8,
            BitWidth::U16 => 16,
            BitWidth::U32 => 32,
        }
    }

    /// Encoded size of one value in a cleartext payload.
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub const fn max_value(self) -> u64 {
        (1u64 << self.bits()) - 1
    }

    pub const fn fits(self, value: u64) -> bool {
        value <= self.max_value()
    }
}

impl fmt::Display for BitWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.bits())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(pub [u8; 32]);

impl HandleId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({})", &self.to_hex()[..16])
    }
}

/// Opaque reference to an encrypted value. Copying a handle shares the
/// underlying ciphertext, and with it every capability granted on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptedHandle {
    pub id: HandleId,
    pub width: BitWidth,
}

impl fmt::Display for EncryptedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, &self.id.to_hex()[..16])
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("plaintext {value} does not fit in {width}")]
    Overflow { value: u64, width: BitWidth },
    #[error("operand widths differ: {lhs} vs {rhs}")]
    WidthMismatch { lhs: BitWidth, rhs: BitWidth },
    #[error("handle {0} is unknown to the engine")]
    UnknownHandle(String),
}

/// Homomorphic operations the registry may invoke. Results are always fresh
/// handles; inputs are never mutated.
pub trait HomomorphicEngine: Send + Sync {
    fn encrypt(&self, plaintext: u64, width: BitWidth) -> Result<EncryptedHandle, EngineError>;
    fn add(
        &self,
        lhs: &EncryptedHandle,
        rhs: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError>;
    /// Encrypted `lhs > rhs`, as a `u8` holding 0 or 1.
    fn gt(
        &self,
        lhs: &EncryptedHandle,
        rhs: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError>;
    fn select(
        &self,
        condition: &EncryptedHandle,
        if_true: &EncryptedHandle,
        if_false: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError>;
}

/// Seeded engine that derives handle ids from a ChaCha20 stream and keeps the
/// plaintexts aside so a simulated oracle can answer decryption requests.
/// Encrypting the same value twice yields two unrelated handles.
pub struct DeterministicEngine {
    seed: [u8; 32],
    rng: Mutex<ChaCha20Rng>,
    plaintexts: Mutex<HashMap<HandleId, u64>>,
}

impl DeterministicEngine {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            rng: Mutex::new(ChaCha20Rng::from_seed(seed)),
            plaintexts: Mutex::new(HashMap::new()),
        }
    }

    /// Plaintext behind a handle. Only the simulated oracle should call this.
    pub(crate) fn reveal(&self, handle: &EncryptedHandle) -> Option<u64> {
        self.plaintexts.lock().get(&handle.id).copied()
    }

    fn plaintext(&self, handle: &EncryptedHandle) -> Result<u64, EngineError> {
        self.reveal(handle)
            .ok_or_else(|| EngineError::UnknownHandle(handle.id.to_hex()))
    }

    fn mint(&self, plaintext: u64, width: BitWidth) -> EncryptedHandle {
        let mut nonce = [0u8; 32];
        self.rng.lock().fill_bytes(&mut nonce);
        let mut hasher = Hasher::new();
        hasher.update(b"veiltrace/handle");
        hasher.update(&self.seed);
        hasher.update(&nonce);
        hasher.update(&width.bits().to_le_bytes());
        let mut id = [0u8; 32];
        id.copy_from_slice(hasher.finalize().as_bytes());
        let handle = EncryptedHandle {
            id: HandleId(id),
            width,
        };
        self.plaintexts.lock().insert(handle.id, plaintext);
        handle
    }
}

fn same_width(lhs: &EncryptedHandle, rhs: &EncryptedHandle) -> Result<BitWidth, EngineError> {
    if lhs.width != rhs.width {
        return Err(EngineError::WidthMismatch {
            lhs: lhs.width,
            rhs: rhs.width,
        });
    }
    Ok(lhs.width)
}

impl HomomorphicEngine for DeterministicEngine {
    fn encrypt(&self, plaintext: u64, width: BitWidth) -> Result<EncryptedHandle, EngineError> {
        if !width.fits(plaintext) {
            return Err(EngineError::Overflow {
                value: plaintext,
                width,
            });
        }
        Ok(self.mint(plaintext, width))
    }

    fn add(
        &self,
        lhs: &EncryptedHandle,
        rhs: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError> {
        let width = same_width(lhs, rhs)?;
        // Ciphertext arithmetic wraps at the declared width.
        let sum = self.plaintext(lhs)?.wrapping_add(self.plaintext(rhs)?) & width.max_value();
        Ok(self.mint(sum, width))
    }

    fn gt(
        &self,
        lhs: &EncryptedHandle,
        rhs: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError> {
        same_width(lhs, rhs)?;
        let flag = u64::from(self.plaintext(lhs)? > self.plaintext(rhs)?);
        Ok(self.mint(flag, BitWidth::U8))
    }

    fn select(
        &self,
        condition: &EncryptedHandle,
        if_true: &EncryptedHandle,
        if_false: &EncryptedHandle,
    ) -> Result<EncryptedHandle, EngineError> {
        let width = same_width(if_true, if_false)?;
        let chosen = if self.plaintext(condition)? != 0 {
            self.plaintext(if_true)?
        } else {
            self.plaintext(if_false)?
        };
        Ok(self.mint(chosen, width))
    }
}
