use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use fleetgate_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::action::{ActionType, validate_weight};
use crate::distribution_set::DistributionSetId;
use crate::rsql::FilterExpression;

/// Target filter query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetFilterQueryId(i64);

impl TargetFilterQueryId {
    /// Wraps a stored identifier.
    #[must_use]
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl Display for TargetFilterQueryId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Auto-assignment settings attached to a filter query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoAssignment {
    distribution_set_id: DistributionSetId,
    action_type: ActionType,
    weight: Option<i32>,
    initiated_by: Option<String>,
}

impl AutoAssignment {
    /// Creates validated auto-assignment settings.
    ///
    /// Time-forced assignments are rejected because a saved query has no
    /// natural force instant.
    pub fn new(
        distribution_set_id: DistributionSetId,
        action_type: ActionType,
        weight: Option<i32>,
        initiated_by: Option<String>,
    ) -> AppResult<Self> {
        if matches!(action_type, ActionType::TimeForced { .. }) {
            return Err(AppError::Validation(
                "auto assignment does not support time forced actions".to_owned(),
            ));
        }
        validate_weight(weight)?;

        Ok(Self {
            distribution_set_id,
            action_type,
            weight,
            initiated_by: initiated_by.filter(|value| !value.trim().is_empty()),
        })
    }

    /// Returns the distribution set to assign.
    #[must_use]
    pub fn distribution_set_id(&self) -> DistributionSetId {
        self.distribution_set_id
    }

    /// Returns the action type of created actions.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    /// Returns the weight of created actions.
    #[must_use]
    pub fn weight(&self) -> Option<i32> {
        self.weight
    }

    /// Returns the configured initiator.
    #[must_use]
    pub fn initiated_by(&self) -> Option<&str> {
        self.initiated_by.as_deref()
    }
}

/// Saved filter query, optionally driving auto assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFilterQuery {
    id: TargetFilterQueryId,
    name: NonEmptyString,
    query: String,
    auto_assignment: Option<AutoAssignment>,
    created_at: DateTime<Utc>,
}

impl TargetFilterQuery {
    /// Creates a filter query after validating its expression.
    pub fn new(
        id: TargetFilterQueryId,
        name: impl Into<String>,
        query: impl Into<String>,
        auto_assignment: Option<AutoAssignment>,
        created_at: DateTime<Utc>,
    ) -> AppResult<Self> {
        let query = query.into();
        FilterExpression::parse(query.as_str())?;

        Ok(Self::restore(
            id,
            NonEmptyString::new(name)?,
            query,
            auto_assignment,
            created_at,
        ))
    }

    /// Rehydrates a stored filter query without re-validating it.
    #[must_use]
    pub fn restore(
        id: TargetFilterQueryId,
        name: NonEmptyString,
        query: String,
        auto_assignment: Option<AutoAssignment>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name,
            query,
            auto_assignment,
            created_at,
        }
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> TargetFilterQueryId {
        self.id
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the raw query string.
    #[must_use]
    pub fn query(&self) -> &str {
        self.query.as_str()
    }

    /// Returns auto-assignment settings.
    #[must_use]
    pub fn auto_assignment(&self) -> Option<&AutoAssignment> {
        self.auto_assignment.as_ref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the initiator recorded on auto-assigned actions.
    #[must_use]
    pub fn auto_assign_initiator(&self) -> String {
        self.auto_assignment
            .as_ref()
            .and_then(AutoAssignment::initiated_by)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("autoassign:{}", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_query_is_rejected_at_construction() {
        let result = TargetFilterQuery::new(
            TargetFilterQueryId::new(1),
            "broken",
            "color==red",
            None,
            Utc::now(),
        );

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn initiator_defaults_to_query_name() {
        let assignment = AutoAssignment::new(
            DistributionSetId::new(4),
            ActionType::Forced,
            None,
            Some("   ".to_owned()),
        )
        .unwrap_or_else(|_| unreachable!());
        let query = TargetFilterQuery::new(
            TargetFilterQueryId::new(1),
            "sensors",
            "attribute.device_type==sensor",
            Some(assignment),
            Utc::now(),
        )
        .unwrap_or_else(|_| unreachable!());

        assert_eq!(query.auto_assign_initiator(), "autoassign:sensors");
    }

    #[test]
    fn time_forced_auto_assignment_is_rejected() {
        let result = AutoAssignment::new(
            DistributionSetId::new(4),
            ActionType::TimeForced {
                force_at: Utc::now(),
            },
            None,
            None,
        );

        assert!(result.is_err());
    }
}
