//! Confidential behavior records with capability-gated access.
//!
//! Subjects submit plaintext measurements that are immediately turned into
//! encrypted handles. Who may operate on a handle is tracked by one
//! grow-only [`CapabilityLedger`]; analysts are a separate, revocable set.
//! Per-subject patterns are seeded from the first session, analysts publish
//! metrics, and cleartext only comes back through correlated, proof-checked
//! decryption callbacks. [`Registry`] ties the components together and
//! applies one operation at a time.

pub mod capability;
pub mod config;
pub mod decryption;
pub mod errors;
pub mod events;
pub mod handle;
pub mod metrics;
pub mod ops;
pub mod oracle;
pub mod pattern;
pub mod registry;
pub mod sessions;
pub mod types;

pub use capability::{AnalystRegistry, CapabilityLedger};
pub use config::{PatternField, RegistryConfig};
pub use decryption::{
    CollectingConsumer, DecryptedValue, DecryptionConsumer, DecryptionRequest, DecryptionState,
    DecryptionStatus, NoopConsumer,
};
pub use errors::{ErrorKind, RegistryError, RegistryResult};
pub use events::{
    CompositeEventSink, EventKind, EventRef, EventSink, MemoryEventSink, NoopEventSink,
    RegistryEvent,
};
pub use handle::{BitWidth, DeterministicEngine, EncryptedHandle, EngineError, HomomorphicEngine};
pub use metrics::{MetricsInput, PrivacyMetrics};
pub use ops::{Operation, OperationOutcome};
pub use oracle::{DecryptionOracle, OracleDelivery, OracleError, SimulatedOracle};
pub use pattern::BehaviorPattern;
pub use registry::{PatternInfo, Registry};
pub use sessions::{BehaviorSession, SessionInfo, SessionInput};
pub use types::{CorrelationId, Invocation, Principal, SessionId};
