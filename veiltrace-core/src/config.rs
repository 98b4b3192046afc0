use serde::{Deserialize, Serialize};

use crate::errors::{RegistryError, RegistryResult};
use crate::handle::BitWidth;
use crate::types::Principal;

/// Plaintext width of each encrypted session field.
pub const DURATION_WIDTH: BitWidth = BitWidth::U32;
pub const ACTIVITY_WIDTH: BitWidth = BitWidth::U8;
pub const INTERACTION_WIDTH: BitWidth = BitWidth::U8;
pub const DATA_POINTS_WIDTH: BitWidth = BitWidth::U32;

/// Plaintext width of each encrypted metrics field.
pub const PRIVACY_SCORE_WIDTH: BitWidth = BitWidth::U8;
pub const ANOMALY_LEVEL_WIDTH: BitWidth = BitWidth::U8;
pub const VARIABILITY_WIDTH: BitWidth = BitWidth::U32;

/// Aggregate handles of a behavior pattern that can be selected for
/// decryption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatternField {
    AvgDuration,
    AvgActivity,
    DominantInteraction,
    TotalDataPoints,
}

fn default_administrator() -> Principal {
    Principal::new("did:veiltrace:admin")
}

fn default_store_principal() -> Principal {
    Principal::new("did:veiltrace:registry")
}

const fn default_max_activity_level() -> u64 {
    100
}

const fn default_max_interaction_type() -> u64 {
    10
}

const fn default_max_score() -> u64 {
    100
}

const fn default_review_threshold() -> u64 {
    70
}

fn default_decryption_targets() -> Vec<PatternField> {
    vec![PatternField::AvgActivity]
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Sole principal allowed to manage analysts and assign sessions.
    #[serde(default = "default_administrator")]
    pub administrator: Principal,
    /// Identity the registry itself holds capabilities under.
    #[serde(default = "default_store_principal")]
    pub store_principal: Principal,
    #[serde(default = "default_max_activity_level")]
    pub max_activity_level: u64,
    #[serde(default = "default_max_interaction_type")]
    pub max_interaction_type: u64,
    #[serde(default = "default_max_score")]
    pub max_privacy_score: u64,
    #[serde(default = "default_max_score")]
    pub max_anomaly_level: u64,
    /// Published anomaly levels strictly above this flag the subject for review.
    #[serde(default = "default_review_threshold")]
    pub review_threshold: u64,
    /// Pattern handles revealed by a decryption request, in payload order.
    #[serde(default = "default_decryption_targets")]
    pub decryption_targets: Vec<PatternField>,
    /// When set, only this principal may deliver decryption callbacks.
    #[serde(default)]
    pub callback_origin: Option<Principal>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            administrator: default_administrator(),
            store_principal: default_store_principal(),
            max_activity_level: default_max_activity_level(),
            max_interaction_type: default_max_interaction_type(),
            max_privacy_score: default_max_score(),
            max_anomaly_level: default_max_score(),
            review_threshold: default_review_threshold(),
            decryption_targets: default_decryption_targets(),
            callback_origin: None,
        }
    }
}

impl RegistryConfig {
    pub fn with_administrator(mut self, administrator: impl Into<Principal>) -> Self {
        self.administrator = administrator.into();
        self
    }

    pub fn with_callback_origin(mut self, origin: impl Into<Principal>) -> Self {
        self.callback_origin = Some(origin.into());
        self
    }

    pub fn validate(&self) -> RegistryResult<()> {
        if self.administrator.as_str().is_empty() {
            return Err(RegistryError::InvalidConfig("administrator must be set"));
        }
        if self.administrator == self.store_principal {
            return Err(RegistryError::InvalidConfig(
                "administrator and store principal must differ",
            ));
        }
        if !ACTIVITY_WIDTH.fits(self.max_activity_level)
            || !INTERACTION_WIDTH.fits(self.max_interaction_type)
            || !PRIVACY_SCORE_WIDTH.fits(self.max_privacy_score)
            || !ANOMALY_LEVEL_WIDTH.fits(self.max_anomaly_level)
        {
            return Err(RegistryError::InvalidConfig(
                "input bound exceeds the encrypted field width",
            ));
        }
        if self.review_threshold > self.max_anomaly_level {
            return Err(RegistryError::InvalidConfig(
                "review threshold above max anomaly level",
            ));
        }
        if self.decryption_targets.is_empty() {
            return Err(RegistryError::InvalidConfig(
                "at least one decryption target is required",
            ));
        }
        let mut seen = Vec::with_capacity(self.decryption_targets.len());
        for target in &self.decryption_targets {
            if seen.contains(target) {
                return Err(RegistryError::InvalidConfig(
                    "decryption targets must be distinct",
                ));
            }
            seen.push(*target);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.decryption_targets, vec![PatternField::AvgActivity]);
        assert_eq!(config.review_threshold, 70);
    }

    #[test]
    fn rejects_duplicate_targets() {
        let mut config = RegistryConfig::default();
        config.decryption_targets = vec![PatternField::AvgActivity, PatternField::AvgActivity];
        assert!(matches!(
            config.validate(),
            Err(RegistryError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_threshold_above_bound() {
        let mut config = RegistryConfig::default();
        config.review_threshold = 150;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_json() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{"administrator":"root","decryption-targets":["avg-duration","avg-activity"]}"#,
        )
        .unwrap();
        assert_eq!(config.administrator, Principal::new("root"));
        assert_eq!(config.max_activity_level, 100);
        assert_eq!(config.decryption_targets.len(), 2);
        assert!(config.callback_origin.is_none());
    }
}
