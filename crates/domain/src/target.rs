use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use fleetgate_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::distribution_set::{DistributionSet, DistributionSetId};
use crate::field_data::TargetFieldData;

/// Maximum accepted controller id length.
pub const MAX_CONTROLLER_ID_LENGTH: usize = 256;

/// Housekeeping attribute ignored when detecting attribute changes.
pub const LAST_UPDATE_ATTRIBUTE: &str = "last_update";

/// Controller identifier, unique per tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerId(String);

impl ControllerId {
    /// Creates a validated controller id.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        let trimmed = value.trim();

        if trimmed.is_empty() {
            return Err(AppError::Validation(
                "controller id must not be empty".to_owned(),
            ));
        }

        if trimmed.chars().count() > MAX_CONTROLLER_ID_LENGTH {
            return Err(AppError::Validation(format!(
                "controller id must not exceed {MAX_CONTROLLER_ID_LENGTH} characters"
            )));
        }

        if trimmed.chars().any(char::is_whitespace) {
            return Err(AppError::Validation(format!(
                "controller id '{trimmed}' must not contain whitespace"
            )));
        }

        Ok(Self(trimmed.to_owned()))
    }

    /// Returns the controller id value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ControllerId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Update status of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetUpdateStatus {
    /// Created administratively and never seen polling.
    Unknown,
    /// Seen polling, nothing assigned yet.
    Registered,
    /// An assignment is waiting to be installed.
    Pending,
    /// Installed software matches the assignment.
    InSync,
    /// The last assignment failed.
    Error,
}

impl TargetUpdateStatus {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Registered => "registered",
            Self::Pending => "pending",
            Self::InSync => "in_sync",
            Self::Error => "error",
        }
    }

    /// Parses storage value.
    pub fn parse(value: &str) -> AppResult<Self> {
        match value {
            "unknown" => Ok(Self::Unknown),
            "registered" => Ok(Self::Registered),
            "pending" => Ok(Self::Pending),
            "in_sync" => Ok(Self::InSync),
            "error" => Ok(Self::Error),
            _ => Err(AppError::Validation(format!(
                "unknown target update status '{value}'"
            ))),
        }
    }
}

/// Target type restricting which distribution set types may be assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetType {
    key: NonEmptyString,
    compatible_set_types: BTreeSet<String>,
}

impl TargetType {
    /// Creates a target type with its compatible distribution set type keys.
    pub fn new(
        key: impl Into<String>,
        compatible_set_types: impl IntoIterator<Item = String>,
    ) -> AppResult<Self> {
        Ok(Self {
            key: NonEmptyString::new(key)?,
            compatible_set_types: compatible_set_types.into_iter().collect(),
        })
    }

    /// Returns the target type key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Returns compatible distribution set type keys.
    #[must_use]
    pub fn compatible_set_types(&self) -> &BTreeSet<String> {
        &self.compatible_set_types
    }
}

/// Size limits applied to controller attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeLimits {
    /// Maximum attribute count per target.
    pub max_attributes: usize,
    /// Maximum attribute key length.
    pub max_key_length: usize,
    /// Maximum attribute value length.
    pub max_value_length: usize,
}

impl Default for AttributeLimits {
    fn default() -> Self {
        Self {
            max_attributes: 100,
            max_key_length: 128,
            max_value_length: 128,
        }
    }
}

/// How reported controller attributes combine with stored ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeUpdateMode {
    /// Reported attributes are added or overwrite existing keys.
    Merge,
    /// Reported attributes replace the stored map.
    Replace,
    /// Reported keys are removed.
    Remove,
}

/// Full target state used by repositories to rehydrate targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetParts {
    /// Controller id.
    pub controller_id: ControllerId,
    /// Display name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Last reported network address.
    pub address: Option<String>,
    /// Update status.
    pub update_status: TargetUpdateStatus,
    /// Last poll timestamp.
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Last successful installation timestamp.
    pub last_installation_at: Option<DateTime<Utc>>,
    /// Controller attributes.
    pub attributes: BTreeMap<String, String>,
    /// Administrative metadata.
    pub metadata: BTreeMap<String, String>,
    /// Tag names.
    pub tags: BTreeSet<String>,
    /// Whether the controller should push its attributes.
    pub request_attributes: bool,
    /// Assigned distribution set.
    pub assigned_distribution_set: Option<DistributionSetId>,
    /// Installed distribution set.
    pub installed_distribution_set: Option<DistributionSetId>,
    /// Optional target type.
    pub target_type: Option<TargetType>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency version.
    pub version: i64,
}

/// One remote controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    controller_id: ControllerId,
    name: String,
    description: Option<String>,
    address: Option<String>,
    update_status: TargetUpdateStatus,
    last_poll_at: Option<DateTime<Utc>>,
    last_installation_at: Option<DateTime<Utc>>,
    attributes: BTreeMap<String, String>,
    metadata: BTreeMap<String, String>,
    tags: BTreeSet<String>,
    request_attributes: bool,
    assigned_distribution_set: Option<DistributionSetId>,
    installed_distribution_set: Option<DistributionSetId>,
    target_type: Option<TargetType>,
    created_at: DateTime<Utc>,
    version: i64,
    attributes_reported: bool,
}

impl Target {
    /// Creates an administratively registered target that has never polled.
    #[must_use]
    pub fn new(controller_id: ControllerId, name: Option<String>, now: DateTime<Utc>) -> Self {
        let name = name
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| controller_id.as_str().to_owned());

        Self {
            controller_id,
            name,
            description: None,
            address: None,
            update_status: TargetUpdateStatus::Unknown,
            last_poll_at: None,
            last_installation_at: None,
            attributes: BTreeMap::new(),
            metadata: BTreeMap::new(),
            tags: BTreeSet::new(),
            request_attributes: true,
            assigned_distribution_set: None,
            installed_distribution_set: None,
            target_type: None,
            created_at: now,
            version: 0,
            attributes_reported: false,
        }
    }

    /// Creates a target on its first poll.
    #[must_use]
    pub fn register(
        controller_id: ControllerId,
        address: Option<String>,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let description = format!("Plug and Play target: {controller_id}");
        let mut target = Self::new(controller_id, name, now);
        target.description = Some(description);
        target.address = address;
        target.update_status = TargetUpdateStatus::Registered;
        target.last_poll_at = Some(now);
        target
    }

    /// Rehydrates a stored target.
    #[must_use]
    pub fn restore(parts: TargetParts) -> Self {
        Self {
            controller_id: parts.controller_id,
            name: parts.name,
            description: parts.description,
            address: parts.address,
            update_status: parts.update_status,
            last_poll_at: parts.last_poll_at,
            last_installation_at: parts.last_installation_at,
            attributes: parts.attributes,
            metadata: parts.metadata,
            tags: parts.tags,
            request_attributes: parts.request_attributes,
            assigned_distribution_set: parts.assigned_distribution_set,
            installed_distribution_set: parts.installed_distribution_set,
            target_type: parts.target_type,
            created_at: parts.created_at,
            version: parts.version,
            attributes_reported: false,
        }
    }

    /// Returns the controller id.
    #[must_use]
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the last reported address.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Returns the update status.
    #[must_use]
    pub fn update_status(&self) -> TargetUpdateStatus {
        self.update_status
    }

    /// Returns the last poll timestamp.
    #[must_use]
    pub fn last_poll_at(&self) -> Option<DateTime<Utc>> {
        self.last_poll_at
    }

    /// Returns the last installation timestamp.
    #[must_use]
    pub fn last_installation_at(&self) -> Option<DateTime<Utc>> {
        self.last_installation_at
    }

    /// Returns controller attributes.
    #[must_use]
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Returns administrative metadata.
    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Returns tag names.
    #[must_use]
    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// Returns whether the controller was asked to push its attributes.
    #[must_use]
    pub fn request_attributes(&self) -> bool {
        self.request_attributes
    }

    /// Returns the assigned distribution set.
    #[must_use]
    pub fn assigned_distribution_set(&self) -> Option<DistributionSetId> {
        self.assigned_distribution_set
    }

    /// Returns the installed distribution set.
    #[must_use]
    pub fn installed_distribution_set(&self) -> Option<DistributionSetId> {
        self.installed_distribution_set
    }

    /// Returns the target type.
    #[must_use]
    pub fn target_type(&self) -> Option<&TargetType> {
        self.target_type.as_ref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the optimistic concurrency version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Returns true when an attribute report was applied since the last write.
    #[must_use]
    pub fn attributes_reported(&self) -> bool {
        self.attributes_reported
    }

    /// Sets the optimistic concurrency version after a successful write.
    pub fn set_version(&mut self, version: i64) {
        self.version = version;
        self.attributes_reported = false;
    }

    /// Folds in narrow poll and attribute-request writes stored after this
    /// target was loaded.
    ///
    /// The poll timestamp never moves backwards. A stored attribute request
    /// survives unless this change applied an attribute report.
    pub fn merge_stored_signals(
        &mut self,
        last_poll_at: Option<DateTime<Utc>>,
        request_attributes: bool,
    ) {
        self.last_poll_at = self.last_poll_at.max(last_poll_at);
        if !self.attributes_reported {
            self.request_attributes |= request_attributes;
        }
    }

    /// Sets the target type.
    #[must_use]
    pub fn with_target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = Some(target_type);
        self
    }

    /// Adds one tag.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    /// Removes one tag and returns whether it was present.
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }

    /// Sets one metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Returns true when the poll carries data that must be written through.
    #[must_use]
    pub fn poll_has_material_change(&self, address: Option<&str>, name: Option<&str>) -> bool {
        let address_changed = address.is_some_and(|value| self.address.as_deref() != Some(value));
        let name_changed = name
            .map(str::trim)
            .is_some_and(|value| !value.is_empty() && value != self.name);

        address_changed || name_changed || self.update_status == TargetUpdateStatus::Unknown
    }

    /// Applies poll data to the target.
    pub fn apply_poll(&mut self, address: Option<&str>, name: Option<&str>, now: DateTime<Utc>) {
        if let Some(address) = address {
            self.address = Some(address.to_owned());
        }

        if let Some(name) = name.map(str::trim).filter(|value| !value.is_empty()) {
            self.name = name.to_owned();
        }

        if self.update_status == TargetUpdateStatus::Unknown {
            self.update_status = TargetUpdateStatus::Registered;
        }

        self.last_poll_at = Some(now);
    }

    /// Records a poll timestamp without touching any other field.
    pub fn touch_poll(&mut self, polled_at: DateTime<Utc>) {
        self.last_poll_at = Some(polled_at);
    }

    /// Applies reported controller attributes.
    ///
    /// Returns true when business attributes changed. The `last_update`
    /// housekeeping key alone never counts as a change. The request-attributes
    /// flag is cleared either way.
    pub fn apply_attributes(
        &mut self,
        reported: BTreeMap<String, String>,
        mode: AttributeUpdateMode,
        limits: AttributeLimits,
    ) -> AppResult<bool> {
        for (key, value) in &reported {
            if key.trim().is_empty() {
                return Err(AppError::Validation(
                    "controller attribute key must not be empty".to_owned(),
                ));
            }

            if key.chars().count() > limits.max_key_length {
                return Err(AppError::Validation(format!(
                    "controller attribute key '{key}' exceeds {} characters",
                    limits.max_key_length
                )));
            }

            if mode != AttributeUpdateMode::Remove
                && value.chars().count() > limits.max_value_length
            {
                return Err(AppError::Validation(format!(
                    "controller attribute value for key '{key}' exceeds {} characters",
                    limits.max_value_length
                )));
            }
        }

        let updated = match mode {
            AttributeUpdateMode::Merge => {
                let mut merged = self.attributes.clone();
                merged.extend(reported);
                merged
            }
            AttributeUpdateMode::Replace => reported,
            AttributeUpdateMode::Remove => {
                let mut remaining = self.attributes.clone();
                for key in reported.keys() {
                    remaining.remove(key);
                }
                remaining
            }
        };

        if updated.len() > limits.max_attributes {
            return Err(AppError::QuotaExceeded(format!(
                "controller '{}' would hold {} attributes, limit is {}",
                self.controller_id,
                updated.len(),
                limits.max_attributes
            )));
        }

        self.request_attributes = false;
        self.attributes_reported = true;

        if without_housekeeping(&updated) == without_housekeeping(&self.attributes) {
            return Ok(false);
        }

        self.attributes = updated;
        Ok(true)
    }

    /// Asks the controller to push its attributes on the next poll.
    pub fn mark_request_attributes(&mut self) {
        self.request_attributes = true;
    }

    /// Assigns a distribution set and marks the target pending.
    pub fn assign_distribution_set(&mut self, distribution_set_id: DistributionSetId) {
        self.assigned_distribution_set = Some(distribution_set_id);
        self.update_status = TargetUpdateStatus::Pending;
    }

    /// Records a successful installation.
    pub fn complete_installation(
        &mut self,
        distribution_set_id: DistributionSetId,
        download_only: bool,
        other_active_actions: bool,
        now: DateTime<Utc>,
    ) {
        if download_only {
            self.assigned_distribution_set = Some(distribution_set_id);
        }

        self.installed_distribution_set = Some(distribution_set_id);
        self.last_installation_at = Some(now);

        if self.assigned_distribution_set == self.installed_distribution_set {
            self.update_status = TargetUpdateStatus::InSync;
        } else if other_active_actions {
            self.update_status = TargetUpdateStatus::Pending;
        }
    }

    /// Records a finished download for a download-only assignment.
    pub fn complete_download(&mut self) {
        self.update_status = TargetUpdateStatus::InSync;
    }

    /// Records a failed assignment.
    pub fn fail_assignment(&mut self) {
        self.update_status = TargetUpdateStatus::Error;
        self.assigned_distribution_set = None;
    }

    /// Falls back after a confirmed cancellation.
    ///
    /// `next_assignment` is the distribution set of the newest remaining
    /// active action, if any.
    pub fn fall_back_after_cancel(&mut self, next_assignment: Option<DistributionSetId>) {
        match next_assignment {
            Some(distribution_set_id) => {
                self.assigned_distribution_set = Some(distribution_set_id);
                self.update_status = TargetUpdateStatus::Pending;
            }
            None => {
                self.assigned_distribution_set = self.installed_distribution_set;
                self.update_status = if self.installed_distribution_set.is_some() {
                    TargetUpdateStatus::InSync
                } else {
                    TargetUpdateStatus::Registered
                };
            }
        }
    }

    /// Returns true when the distribution set type may be assigned to this target.
    #[must_use]
    pub fn is_compatible_with(&self, distribution_set: &DistributionSet) -> bool {
        self.target_type.as_ref().is_none_or(|target_type| {
            target_type
                .compatible_set_types
                .contains(distribution_set.type_key())
        })
    }

    /// Builds the filter field snapshot of this target.
    #[must_use]
    pub fn field_data(&self) -> TargetFieldData {
        let mut data = TargetFieldData::new();
        data.add("id", self.controller_id.as_str());
        data.add("controllerid", self.controller_id.as_str());
        data.add("name", self.name.as_str());
        data.add("updatestatus", self.update_status.as_str());
        data.add("createdat", self.created_at.timestamp_millis().to_string());

        if let Some(description) = &self.description {
            data.add("description", description.as_str());
        }
        if let Some(address) = &self.address {
            data.add("ipaddress", address.as_str());
        }
        if let Some(target_type) = &self.target_type {
            data.add("targettype", target_type.key());
        }
        if let Some(assigned) = self.assigned_distribution_set {
            data.add("assignedds", assigned.to_string());
        }
        if let Some(installed) = self.installed_distribution_set {
            data.add("installedds", installed.to_string());
        }
        if let Some(last_poll_at) = self.last_poll_at {
            data.add(
                "lastcontrollerrequestat",
                last_poll_at.timestamp_millis().to_string(),
            );
        }
        for tag in &self.tags {
            data.add("tag", tag.as_str());
        }
        for (key, value) in &self.attributes {
            data.add(format!("attribute.{key}"), value.as_str());
        }
        for (key, value) in &self.metadata {
            data.add(format!("metadata.{key}"), value.as_str());
        }

        data
    }
}

fn without_housekeeping(attributes: &BTreeMap<String, String>) -> BTreeMap<&str, &str> {
    attributes
        .iter()
        .filter(|(key, _)| key.as_str() != LAST_UPDATE_ATTRIBUTE)
        .map(|(key, value)| (key.as_str(), value.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn controller(value: &str) -> ControllerId {
        ControllerId::new(value).unwrap_or_else(|_| unreachable!())
    }

    fn attributes(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect()
    }

    #[test]
    fn controller_id_rejects_blank_and_whitespace() {
        assert!(ControllerId::new("   ").is_err());
        assert!(ControllerId::new("dev ice").is_err());
        assert!(ControllerId::new("x".repeat(MAX_CONTROLLER_ID_LENGTH + 1)).is_err());
        assert!(ControllerId::new(" device-1 ").is_ok());
    }

    #[test]
    fn registered_target_uses_plug_and_play_defaults() {
        let target = Target::register(controller("dev-1"), None, None, Utc::now());

        assert_eq!(target.name(), "dev-1");
        assert_eq!(target.description(), Some("Plug and Play target: dev-1"));
        assert_eq!(target.update_status(), TargetUpdateStatus::Registered);
        assert!(target.last_poll_at().is_some());
    }

    #[test]
    fn unknown_target_poll_is_material() {
        let target = Target::new(controller("dev-1"), None, Utc::now());
        assert!(target.poll_has_material_change(None, None));
    }

    #[test]
    fn unchanged_poll_is_not_material() {
        let target = Target::register(
            controller("dev-1"),
            Some("10.0.0.1".to_owned()),
            None,
            Utc::now(),
        );

        assert!(!target.poll_has_material_change(Some("10.0.0.1"), None));
        assert!(target.poll_has_material_change(Some("10.0.0.2"), None));
        assert!(target.poll_has_material_change(None, Some("renamed")));
    }

    #[test]
    fn last_update_alone_is_not_an_attribute_change() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        let changed = target.apply_attributes(
            attributes(&[("device_type", "sensor"), (LAST_UPDATE_ATTRIBUTE, "1")]),
            AttributeUpdateMode::Merge,
            AttributeLimits::default(),
        );
        assert!(matches!(changed, Ok(true)));

        target.mark_request_attributes();
        let changed = target.apply_attributes(
            attributes(&[(LAST_UPDATE_ATTRIBUTE, "2")]),
            AttributeUpdateMode::Merge,
            AttributeLimits::default(),
        );

        assert!(matches!(changed, Ok(false)));
        assert!(!target.request_attributes());
        assert_eq!(
            target.attributes().get(LAST_UPDATE_ATTRIBUTE).map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn stored_signals_keep_newer_poll_and_pending_request() {
        let loaded_at = Utc::now();
        let mut target = Target::register(controller("dev-1"), None, None, loaded_at);
        let flushed_at = loaded_at + TimeDelta::minutes(10);

        target.merge_stored_signals(Some(flushed_at), true);
        assert_eq!(target.last_poll_at(), Some(flushed_at));
        assert!(target.request_attributes());

        target.merge_stored_signals(Some(loaded_at), false);
        assert_eq!(target.last_poll_at(), Some(flushed_at));
    }

    #[test]
    fn attribute_report_settles_a_stored_request() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        let applied = target.apply_attributes(
            attributes(&[("device_type", "sensor")]),
            AttributeUpdateMode::Merge,
            AttributeLimits::default(),
        );
        assert!(applied.is_ok());
        assert!(target.attributes_reported());

        target.merge_stored_signals(None, true);
        assert!(!target.request_attributes());

        target.set_version(2);
        assert!(!target.attributes_reported());
    }

    #[test]
    fn attribute_modes_merge_replace_and_remove() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        let limits = AttributeLimits::default();

        assert!(
            target
                .apply_attributes(
                    attributes(&[("a", "1"), ("b", "2")]),
                    AttributeUpdateMode::Merge,
                    limits
                )
                .is_ok()
        );
        assert!(
            target
                .apply_attributes(attributes(&[("a", "")]), AttributeUpdateMode::Remove, limits)
                .is_ok()
        );
        assert_eq!(target.attributes(), &attributes(&[("b", "2")]));

        assert!(
            target
                .apply_attributes(attributes(&[("c", "3")]), AttributeUpdateMode::Replace, limits)
                .is_ok()
        );
        assert_eq!(target.attributes(), &attributes(&[("c", "3")]));
    }

    #[test]
    fn attribute_limits_are_enforced() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        let limits = AttributeLimits {
            max_attributes: 1,
            max_key_length: 4,
            max_value_length: 4,
        };

        let oversized_key = target.apply_attributes(
            attributes(&[("toolong", "1")]),
            AttributeUpdateMode::Merge,
            limits,
        );
        assert!(matches!(oversized_key, Err(AppError::Validation(_))));

        let too_many = target.apply_attributes(
            attributes(&[("a", "1"), ("b", "2")]),
            AttributeUpdateMode::Merge,
            limits,
        );
        assert!(matches!(too_many, Err(AppError::QuotaExceeded(_))));
    }

    #[test]
    fn installation_of_assigned_set_moves_target_in_sync() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        let set = DistributionSetId::new(7);
        target.assign_distribution_set(set);
        assert_eq!(target.update_status(), TargetUpdateStatus::Pending);

        target.complete_installation(set, false, true, Utc::now());

        assert_eq!(target.update_status(), TargetUpdateStatus::InSync);
        assert_eq!(target.installed_distribution_set(), Some(set));
    }

    #[test]
    fn failed_assignment_clears_assigned_set() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        target.assign_distribution_set(DistributionSetId::new(3));
        target.fail_assignment();

        assert_eq!(target.update_status(), TargetUpdateStatus::Error);
        assert_eq!(target.assigned_distribution_set(), None);
    }

    #[test]
    fn field_data_exposes_attributes_and_tags() {
        let mut target = Target::register(controller("dev-1"), None, None, Utc::now());
        target.add_tag("beta");
        assert!(
            target
                .apply_attributes(
                    attributes(&[("device_type", "sensor")]),
                    AttributeUpdateMode::Merge,
                    AttributeLimits::default()
                )
                .is_ok()
        );

        let data = target.field_data();
        assert_eq!(data.values("attribute.device_type"), ["sensor".to_owned()]);
        assert_eq!(data.values("tag"), ["beta".to_owned()]);
        assert_eq!(data.values("id"), ["dev-1".to_owned()]);
    }
}
