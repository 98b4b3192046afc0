//! Per-subject behavior pattern.
//!
//! Aggregation is initialize-once: the first session's handles become the
//! pattern's aggregate handles and later sessions only bump `session_count`.
//! A running average would need homomorphic division, which the engine seam
//! does not offer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capability::{AnalystRegistry, CapabilityLedger};
use crate::config::PatternField;
use crate::errors::{RegistryError, RegistryResult};
use crate::handle::EncryptedHandle;
use crate::sessions::{BehaviorSession, RecordStore};
use crate::types::Principal;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorPattern {
    pub avg_duration: EncryptedHandle,
    pub avg_activity: EncryptedHandle,
    pub dominant_interaction: EncryptedHandle,
    pub total_data_points: EncryptedHandle,
    pub session_count: u64,
    pub is_analyzed: bool,
}

impl BehaviorPattern {
    fn seeded_from(session: &BehaviorSession, session_count: u64) -> Self {
        Self {
            avg_duration: session.duration,
            avg_activity: session.activity,
            dominant_interaction: session.interaction_type,
            total_data_points: session.data_points,
            session_count,
            is_analyzed: false,
        }
    }

    pub fn handles(&self) -> [EncryptedHandle; 4] {
        [
            self.avg_duration,
            self.avg_activity,
            self.dominant_interaction,
            self.total_data_points,
        ]
    }

    pub fn handle(&self, field: PatternField) -> EncryptedHandle {
        match field {
            PatternField::AvgDuration => self.avg_duration,
            PatternField::AvgActivity => self.avg_activity,
            PatternField::DominantInteraction => self.dominant_interaction,
            PatternField::TotalDataPoints => self.total_data_points,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TouchOutcome {
    Initialized,
    Counted,
}

#[derive(Debug, Default)]
pub struct PatternAggregator {
    patterns: HashMap<Principal, BehaviorPattern>,
}

impl PatternAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&mut self, store: &RecordStore, subject: &Principal) -> RegistryResult<TouchOutcome> {
        let count = store.count_for(subject);
        if let Some(pattern) = self.patterns.get_mut(subject) {
            pattern.session_count = count;
            return Ok(TouchOutcome::Counted);
        }
        let first = store
            .first_of(subject)
            .ok_or_else(|| RegistryError::NoSessions(subject.clone()))?;
        self.patterns
            .insert(subject.clone(), BehaviorPattern::seeded_from(first, count));
        info!(%subject, seed = %first.id, "pattern initialized");
        Ok(TouchOutcome::Initialized)
    }

    pub fn analyze(
        &mut self,
        store: &RecordStore,
        ledger: &mut CapabilityLedger,
        analysts: &AnalystRegistry,
        subject: &Principal,
        analyst: &Principal,
    ) -> RegistryResult<&BehaviorPattern> {
        analysts.require_analyst(analyst, "analyze patterns")?;
        let count = store.count_for(subject);
        if count == 0 {
            return Err(RegistryError::NoSessions(subject.clone()));
        }
        if !self.patterns.contains_key(subject) {
            self.touch(store, subject)?;
        }
        let pattern = self
            .patterns
            .get_mut(subject)
            .ok_or_else(|| RegistryError::NoSessions(subject.clone()))?;
        pattern.is_analyzed = true;
        pattern.session_count = count;
        ledger.grant_all(&pattern.handles(), analyst);
        info!(%subject, %analyst, sessions = count, "pattern analyzed");
        Ok(pattern)
    }

    pub fn get(&self, subject: &Principal) -> Option<&BehaviorPattern> {
        self.patterns.get(subject)
    }
}
