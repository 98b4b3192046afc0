//! Record store: one encrypted [`BehaviorSession`] per submission plus the
//! per-subject index of session ids.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capability::{AnalystRegistry, CapabilityLedger};
use crate::config::{
    RegistryConfig, ACTIVITY_WIDTH, DATA_POINTS_WIDTH, DURATION_WIDTH, INTERACTION_WIDTH,
};
use crate::errors::{RegistryError, RegistryResult};
use crate::handle::{BitWidth, EncryptedHandle, HomomorphicEngine};
use crate::types::{Principal, SessionId};

/// Plaintext measurements as supplied by the submission front end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionInput {
    pub duration: u64,
    pub activity_level: u64,
    pub interaction_type: u64,
    pub data_point_count: u64,
}

impl SessionInput {
    pub fn new(duration: u64, activity_level: u64, interaction_type: u64, data_point_count: u64) -> Self {
        Self {
            duration,
            activity_level,
            interaction_type,
            data_point_count,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorSession {
    pub id: SessionId,
    pub subject: Principal,
    pub duration: EncryptedHandle,
    pub activity: EncryptedHandle,
    pub interaction_type: EncryptedHandle,
    pub data_points: EncryptedHandle,
    pub is_active: bool,
    pub created_at_ms: u64,
    pub analyst: Option<Principal>,
}

impl BehaviorSession {
    pub fn handles(&self) -> [EncryptedHandle; 4] {
        [
            self.duration,
            self.activity,
            self.interaction_type,
            self.data_points,
        ]
    }
}

/// Public metadata of a session; reading it needs no capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionInfo {
    pub is_active: bool,
    pub created_at_ms: u64,
    pub analyst: Option<Principal>,
}

#[derive(Clone, Copy, Debug)]
struct SessionLimits {
    max_activity_level: u64,
    max_interaction_type: u64,
}

fn check_bound(field: &'static str, value: u64, max: u64) -> RegistryResult<()> {
    if value > max {
        return Err(RegistryError::InvalidInput { field, value, max });
    }
    Ok(())
}

fn check_width(field: &'static str, value: u64, width: BitWidth) -> RegistryResult<()> {
    check_bound(field, value, width.max_value())
}

pub struct RecordStore {
    store_principal: Principal,
    limits: SessionLimits,
    sessions: BTreeMap<SessionId, BehaviorSession>,
    by_subject: HashMap<Principal, Vec<SessionId>>,
    next_id: u64,
}

impl RecordStore {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            store_principal: config.store_principal.clone(),
            limits: SessionLimits {
                max_activity_level: config.max_activity_level,
                max_interaction_type: config.max_interaction_type,
            },
            sessions: BTreeMap::new(),
            by_subject: HashMap::new(),
            next_id: 1,
        }
    }

    fn validate(&self, input: &SessionInput) -> RegistryResult<()> {
        check_bound(
            "activity-level",
            input.activity_level,
            self.limits.max_activity_level,
        )?;
        check_bound(
            "interaction-type",
            input.interaction_type,
            self.limits.max_interaction_type,
        )?;
        check_width("duration", input.duration, DURATION_WIDTH)?;
        check_width("data-point-count", input.data_point_count, DATA_POINTS_WIDTH)?;
        Ok(())
    }

    /// Validates, encrypts and commits a new session for `subject`. The id is
    /// only consumed once every fallible step has succeeded.
    pub fn create(
        &mut self,
        engine: &dyn HomomorphicEngine,
        ledger: &mut CapabilityLedger,
        subject: &Principal,
        input: SessionInput,
        at_ms: u64,
    ) -> RegistryResult<SessionId> {
        self.validate(&input)?;
        let duration = engine.encrypt(input.duration, DURATION_WIDTH)?;
        let activity = engine.encrypt(input.activity_level, ACTIVITY_WIDTH)?;
        let interaction_type = engine.encrypt(input.interaction_type, INTERACTION_WIDTH)?;
        let data_points = engine.encrypt(input.data_point_count, DATA_POINTS_WIDTH)?;

        let id = SessionId(self.next_id);
        self.next_id += 1;
        let session = BehaviorSession {
            id,
            subject: subject.clone(),
            duration,
            activity,
            interaction_type,
            data_points,
            is_active: true,
            created_at_ms: at_ms,
            analyst: None,
        };
        let handles = session.handles();
        ledger.grant_all(&handles, &self.store_principal);
        ledger.grant_all(&handles, subject);
        self.sessions.insert(id, session);
        self.by_subject.entry(subject.clone()).or_default().push(id);
        info!(%id, %subject, "session recorded");
        Ok(id)
    }

    pub fn assign_analyst(
        &mut self,
        ledger: &mut CapabilityLedger,
        analysts: &AnalystRegistry,
        caller: &Principal,
        id: SessionId,
        analyst: &Principal,
    ) -> RegistryResult<()> {
        analysts.require_admin(caller, "assign analyst")?;
        analysts.require_analyst(analyst, "be assigned to a session")?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        if !session.is_active {
            return Err(RegistryError::SessionInactive(id));
        }
        session.analyst = Some(analyst.clone());
        ledger.grant_all(&session.handles(), analyst);
        info!(%id, %analyst, "analyst assigned");
        Ok(())
    }

    /// Marks a session inactive. Returns whether the flag changed.
    pub fn deactivate(
        &mut self,
        analysts: &AnalystRegistry,
        caller: &Principal,
        id: SessionId,
    ) -> RegistryResult<bool> {
        analysts.require_admin(caller, "deactivate session")?;
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        let changed = session.is_active;
        session.is_active = false;
        Ok(changed)
    }

    pub fn info(&self, id: SessionId) -> RegistryResult<SessionInfo> {
        let session = self
            .sessions
            .get(&id)
            .ok_or(RegistryError::UnknownSession(id))?;
        Ok(SessionInfo {
            is_active: session.is_active,
            created_at_ms: session.created_at_ms,
            analyst: session.analyst.clone(),
        })
    }

    pub(crate) fn get(&self, id: SessionId) -> RegistryResult<&BehaviorSession> {
        self.sessions
            .get(&id)
            .ok_or(RegistryError::UnknownSession(id))
    }

    pub fn sessions_of(&self, subject: &Principal) -> &[SessionId] {
        self.by_subject
            .get(subject)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count_for(&self, subject: &Principal) -> u64 {
        self.sessions_of(subject).len() as u64
    }

    pub(crate) fn first_of(&self, subject: &Principal) -> Option<&BehaviorSession> {
        self.sessions_of(subject)
            .first()
            .and_then(|id| self.sessions.get(id))
    }

    /// Id the next committed session will receive.
    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id)
    }
}
