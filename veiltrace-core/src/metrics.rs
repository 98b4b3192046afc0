use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capability::{AnalystRegistry, CapabilityLedger};
use crate::config::{RegistryConfig, ANOMALY_LEVEL_WIDTH, PRIVACY_SCORE_WIDTH, VARIABILITY_WIDTH};
use crate::errors::{RegistryError, RegistryResult};
use crate::handle::{EncryptedHandle, HomomorphicEngine};
use crate::types::Principal;

/// Analyst-supplied plaintext metrics; stored as-is, never cross-checked
/// against the subject's sessions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsInput {
    pub privacy_score: u64,
    pub anomaly_level: u64,
    pub variability: u64,
}

impl MetricsInput {
    pub fn new(privacy_score: u64, anomaly_level: u64, variability: u64) -> Self {
        Self {
            privacy_score,
            anomaly_level,
            variability,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyMetrics {
    pub privacy_score: EncryptedHandle,
    pub anomaly_level: EncryptedHandle,
    pub behavior_variability: EncryptedHandle,
    pub requires_review: bool,
    pub published_by: Principal,
    pub published_at_ms: u64,
}

impl PrivacyMetrics {
    pub fn handles(&self) -> [EncryptedHandle; 3] {
        [
            self.privacy_score,
            self.anomaly_level,
            self.behavior_variability,
        ]
    }
}

pub struct MetricsPublisher {
    store_principal: Principal,
    max_privacy_score: u64,
    max_anomaly_level: u64,
    review_threshold: u64,
    entries: HashMap<Principal, PrivacyMetrics>,
}

impl MetricsPublisher {
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            store_principal: config.store_principal.clone(),
            max_privacy_score: config.max_privacy_score,
            max_anomaly_level: config.max_anomaly_level,
            review_threshold: config.review_threshold,
            entries: HashMap::new(),
        }
    }

    fn validate(&self, input: &MetricsInput) -> RegistryResult<()> {
        if input.privacy_score > self.max_privacy_score {
            return Err(RegistryError::InvalidInput {
                field: "privacy-score",
                value: input.privacy_score,
                max: self.max_privacy_score,
            });
        }
        if input.anomaly_level > self.max_anomaly_level {
            return Err(RegistryError::InvalidInput {
                field: "anomaly-level",
                value: input.anomaly_level,
                max: self.max_anomaly_level,
            });
        }
        if !VARIABILITY_WIDTH.fits(input.variability) {
            return Err(RegistryError::InvalidInput {
                field: "variability",
                value: input.variability,
                max: VARIABILITY_WIDTH.max_value(),
            });
        }
        Ok(())
    }

    /// Replaces the subject's metrics wholesale.
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &mut self,
        engine: &dyn HomomorphicEngine,
        ledger: &mut CapabilityLedger,
        analysts: &AnalystRegistry,
        subject: &Principal,
        publisher: &Principal,
        input: MetricsInput,
        at_ms: u64,
    ) -> RegistryResult<&PrivacyMetrics> {
        analysts.require_analyst(publisher, "publish privacy metrics")?;
        self.validate(&input)?;
        let metrics = PrivacyMetrics {
            privacy_score: engine.encrypt(input.privacy_score, PRIVACY_SCORE_WIDTH)?,
            anomaly_level: engine.encrypt(input.anomaly_level, ANOMALY_LEVEL_WIDTH)?,
            behavior_variability: engine.encrypt(input.variability, VARIABILITY_WIDTH)?,
            requires_review: input.anomaly_level > self.review_threshold,
            published_by: publisher.clone(),
            published_at_ms: at_ms,
        };
        let handles = metrics.handles();
        ledger.grant_all(&handles, &self.store_principal);
        ledger.grant_all(&handles, subject);
        ledger.grant_all(&handles, publisher);
        info!(
            %subject,
            %publisher,
            requires_review = metrics.requires_review,
            "privacy metrics published"
        );
        self.entries.insert(subject.clone(), metrics);
        self.entries
            .get(subject)
            .ok_or_else(|| RegistryError::NoMetrics(subject.clone()))
    }

    pub fn get(&self, subject: &Principal) -> Option<&PrivacyMetrics> {
        self.entries.get(subject)
    }

    pub fn requires_review(&self, subject: &Principal) -> bool {
        self.entries
            .get(subject)
            .map(|metrics| metrics.requires_review)
            .unwrap_or(false)
    }
}
