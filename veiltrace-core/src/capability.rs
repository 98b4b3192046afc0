//! Who may operate on which encrypted handle.
//!
//! Two independent structures live here. The [`CapabilityLedger`] is
//! grow-only: once a principal holds a capability on a handle it keeps it.
//! The [`AnalystRegistry`] is a revocable flag per principal that gates
//! analysis, metrics publication and decryption requests. Revoking an analyst
//! never touches the ledger.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{RegistryError, RegistryResult};
use crate::handle::{EncryptedHandle, HandleId};
use crate::types::Principal;

#[derive(Debug, Default)]
pub struct CapabilityLedger {
    grants: HashMap<HandleId, BTreeSet<Principal>>,
    total: usize,
}

impl CapabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants `principal` the right to operate on `handle`. Returns whether a
    /// new grant was recorded; repeating a grant is a no-op.
    pub fn grant(&mut self, handle: &EncryptedHandle, principal: &Principal) -> bool {
        let inserted = self
            .grants
            .entry(handle.id)
            .or_default()
            .insert(principal.clone());
        if inserted {
            self.total += 1;
            debug!(handle = %handle, %principal, "capability granted");
        }
        inserted
    }

    pub fn grant_all<'a>(
        &mut self,
        handles: impl IntoIterator<Item = &'a EncryptedHandle>,
        principal: &Principal,
    ) -> usize {
        handles
            .into_iter()
            .filter(|handle| self.grant(handle, principal))
            .count()
    }

    pub fn has_capability(&self, handle: &EncryptedHandle, principal: &Principal) -> bool {
        self.grants
            .get(&handle.id)
            .map(|holders| holders.contains(principal))
            .unwrap_or(false)
    }

    /// Fails with `NotAuthorized` unless `principal` holds every handle.
    pub fn require_all<'a>(
        &self,
        handles: impl IntoIterator<Item = &'a EncryptedHandle>,
        principal: &Principal,
    ) -> RegistryResult<()> {
        for handle in handles {
            if !self.has_capability(handle, principal) {
                return Err(RegistryError::NotAuthorized {
                    principal: principal.clone(),
                    action: "access encrypted handle",
                });
            }
        }
        Ok(())
    }

    /// Number of distinct (handle, principal) grants ever recorded.
    pub fn grant_count(&self) -> usize {
        self.total
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalystRegistry {
    administrator: Principal,
    analysts: BTreeSet<Principal>,
}

impl AnalystRegistry {
    pub fn new(administrator: Principal) -> Self {
        Self {
            administrator,
            analysts: BTreeSet::new(),
        }
    }

    pub fn require_admin(&self, caller: &Principal, action: &'static str) -> RegistryResult<()> {
        if caller != &self.administrator {
            return Err(RegistryError::NotAuthorized {
                principal: caller.clone(),
                action,
            });
        }
        Ok(())
    }

    pub fn require_analyst(&self, principal: &Principal, action: &'static str) -> RegistryResult<()> {
        if !self.is_authorized(principal) {
            return Err(RegistryError::NotAuthorized {
                principal: principal.clone(),
                action,
            });
        }
        Ok(())
    }

    pub fn authorize(&mut self, caller: &Principal, analyst: &Principal) -> RegistryResult<bool> {
        self.require_admin(caller, "authorize analyst")?;
        Ok(self.analysts.insert(analyst.clone()))
    }

    pub fn revoke(&mut self, caller: &Principal, analyst: &Principal) -> RegistryResult<bool> {
        self.require_admin(caller, "revoke analyst")?;
        Ok(self.analysts.remove(analyst))
    }

    pub fn is_authorized(&self, principal: &Principal) -> bool {
        self.analysts.contains(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{BitWidth, DeterministicEngine, HomomorphicEngine};

    fn handle(engine: &DeterministicEngine, value: u64) -> EncryptedHandle {
        engine.encrypt(value, BitWidth::U8).unwrap()
    }

    #[test]
    fn grant_is_idempotent() {
        let engine = DeterministicEngine::new([1u8; 32]);
        let h = handle(&engine, 3);
        let alice = Principal::new("alice");
        let mut ledger = CapabilityLedger::new();
        assert!(ledger.grant(&h, &alice));
        assert!(!ledger.grant(&h, &alice));
        assert!(ledger.has_capability(&h, &alice));
        assert_eq!(ledger.grant_count(), 1);
    }

    #[test]
    fn capability_is_per_handle() {
        let engine = DeterministicEngine::new([1u8; 32]);
        let (a, b) = (handle(&engine, 1), handle(&engine, 1));
        let alice = Principal::new("alice");
        let mut ledger = CapabilityLedger::new();
        ledger.grant(&a, &alice);
        assert!(!ledger.has_capability(&b, &alice));
        assert!(ledger.require_all([&a, &b], &alice).is_err());
        ledger.grant(&b, &alice);
        assert!(ledger.require_all([&a, &b], &alice).is_ok());
    }

    #[test]
    fn only_administrator_manages_analysts() {
        let admin = Principal::new("admin");
        let mallory = Principal::new("mallory");
        let mut registry = AnalystRegistry::new(admin.clone());
        let err = registry.authorize(&mallory, &mallory).unwrap_err();
        assert!(matches!(err, RegistryError::NotAuthorized { .. }));
        assert!(registry.authorize(&admin, &mallory).unwrap());
        assert!(!registry.authorize(&admin, &mallory).unwrap());
        assert!(registry.is_authorized(&mallory));
        assert!(registry.revoke(&admin, &mallory).unwrap());
        assert!(!registry.is_authorized(&mallory));
    }
}
