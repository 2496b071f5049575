//! Group configuration.

use crate::error::GroupError;

/// Inclusive bounds on the number of participants in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticipantLimits {
    /// Smallest allowed group (a group of one cannot exist)
    pub min: usize,
    /// Largest allowed group
    pub max: usize,
}

impl ParticipantLimits {
    /// Check that `count` is within `[min, max]`.
    ///
    /// # Errors
    ///
    /// - `InvalidParticipantsCount`: count outside bounds
    pub fn validate(&self, count: usize) -> Result<(), GroupError> {
        if count < self.min || count > self.max {
            return Err(GroupError::InvalidParticipantsCount {
                count,
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for ParticipantLimits {
    fn default() -> Self {
        Self { min: 2, max: 50 }
    }
}

/// Tuning for group managers and lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// Retention window: tickets kept locally and folded into a live group
    pub max_tickets_in_group: usize,
    /// Participant count bounds enforced at every construction and mutation
    pub participant_limits: ParticipantLimits,
    /// Maximum cards visited when resolving a historical sender key
    pub max_card_chain_depth: usize,
    /// Maximum identities per card directory search
    pub max_search_count: usize,
}

impl GroupConfig {
    /// Reject limits that would make every group invalid.
    ///
    /// # Errors
    ///
    /// - `Config`: a limit is zero or the participant bounds are inverted
    pub fn validate(&self) -> Result<(), GroupError> {
        if self.max_tickets_in_group == 0 {
            return Err(GroupError::Config("max_tickets_in_group must be positive".into()));
        }
        if self.participant_limits.min < 2 {
            return Err(GroupError::Config("groups need at least two participants".into()));
        }
        if self.participant_limits.min > self.participant_limits.max {
            return Err(GroupError::Config(format!(
                "participant limits inverted: min {} > max {}",
                self.participant_limits.min, self.participant_limits.max
            )));
        }
        if self.max_card_chain_depth == 0 || self.max_search_count == 0 {
            return Err(GroupError::Config("lookup limits must be positive".into()));
        }
        Ok(())
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_tickets_in_group: 50,
            participant_limits: ParticipantLimits::default(),
            max_card_chain_depth: 64,
            max_search_count: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GroupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_tickets_in_group, 50);
        assert_eq!(config.participant_limits, ParticipantLimits { min: 2, max: 50 });
    }

    #[test]
    fn limits_are_inclusive() {
        let limits = ParticipantLimits::default();

        assert!(limits.validate(2).is_ok());
        assert!(limits.validate(50).is_ok());
        assert!(matches!(
            limits.validate(1),
            Err(GroupError::InvalidParticipantsCount { count: 1, min: 2, max: 50 })
        ));
        assert!(limits.validate(51).is_err());
    }

    #[test]
    fn rejects_degenerate_config() {
        let config = GroupConfig { max_tickets_in_group: 0, ..GroupConfig::default() };
        assert!(matches!(config.validate(), Err(GroupError::Config(_))));

        let config = GroupConfig {
            participant_limits: ParticipantLimits { min: 5, max: 3 },
            ..GroupConfig::default()
        };
        assert!(matches!(config.validate(), Err(GroupError::Config(_))));

        let config = GroupConfig {
            participant_limits: ParticipantLimits { min: 1, max: 50 },
            ..GroupConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
