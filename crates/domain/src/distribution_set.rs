use std::fmt::{Display, Formatter};

use fleetgate_core::{AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

/// Distribution set identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DistributionSetId(i64);

impl DistributionSetId {
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

impl Display for DistributionSetId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Software bundle reference; contents are opaque to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionSet {
    id: DistributionSetId,
    name: NonEmptyString,
    version: NonEmptyString,
    type_key: NonEmptyString,
    complete: bool,
    deleted: bool,
}

impl DistributionSet {
    /// Creates a validated distribution set reference.
    pub fn new(
        id: DistributionSetId,
        name: impl Into<String>,
        version: impl Into<String>,
        type_key: impl Into<String>,
        complete: bool,
        deleted: bool,
    ) -> AppResult<Self> {
        Ok(Self {
            id,
            name: NonEmptyString::new(name)?,
            version: NonEmptyString::new(version)?,
            type_key: NonEmptyString::new(type_key)?,
            complete,
            deleted,
        })
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> DistributionSetId {
        self.id
    }

    /// Returns the name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the version.
    #[must_use]
    pub fn version(&self) -> &str {
        self.version.as_str()
    }

    /// Returns the distribution set type key.
    #[must_use]
    pub fn type_key(&self) -> &str {
        self.type_key.as_str()
    }

    /// Returns whether all mandatory modules are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Returns whether the set is soft deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns whether the set may be used for new assignments.
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        self.complete && !self.deleted
    }
}
