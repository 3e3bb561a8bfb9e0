//! Deployment actions and their lifecycle state machine.
//!
//! Status dispatch goes through two exhaustive classification tables,
//! [`ActionStatus::update_feedback_effect`] and
//! [`ActionStatus::cancel_feedback_effect`]. Adding a status variant fails to
//! compile until both tables classify it.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleetgate_core::{AppError, AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::distribution_set::DistributionSetId;
use crate::target::{ControllerId, Target};

/// Highest accepted action weight.
pub const MAX_ACTION_WEIGHT: i32 = 1000;

/// Action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(i64);

impl ActionId {
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

impl Display for ActionId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Lifecycle status of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    /// Assigned and waiting for the controller.
    Running,
    /// Controller fetched the deployment instructions.
    Retrieved,
    /// Controller is downloading artifacts.
    Download,
    /// Controller finished downloading artifacts.
    Downloaded,
    /// Controller reported a non-fatal problem.
    Warning,
    /// Installation finished successfully.
    Finished,
    /// Installation failed.
    Error,
    /// Cancellation requested, waiting for controller acknowledgement.
    Canceling,
    /// Cancellation confirmed.
    Canceled,
    /// Controller refused the cancellation.
    CancelRejected,
}

/// Effect of feedback reported through the regular update channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFeedbackEffect {
    /// Informational progress; the action stays active.
    Progress,
    /// Download completed; closes download-only actions.
    Downloaded,
    /// Installation completed.
    Finished,
    /// Installation failed.
    Failed,
    /// Only accepted through the cancel channel.
    CancelChannelOnly,
}

/// Effect of feedback reported through the cancel channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelFeedbackEffect {
    /// Cancellation succeeded.
    Confirmed,
    /// Cancellation refused; the action runs again.
    Rejected,
    /// Informational entry only.
    Progress,
}

impl ActionStatus {
    /// Every status value.
    pub const ALL: [Self; 10] = [
        Self::Running,
        Self::Retrieved,
        Self::Download,
        Self::Downloaded,
        Self::Warning,
        Self::Finished,
        Self::Error,
        Self::Canceling,
        Self::Canceled,
        Self::CancelRejected,
    ];

    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Retrieved => "retrieved",
            Self::Download => "download",
            Self::Downloaded => "downloaded",
            Self::Warning => "warning",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::CancelRejected => "cancel_rejected",
        }
    }

    /// Classifies feedback reported through the update channel.
    #[must_use]
    pub fn update_feedback_effect(self) -> UpdateFeedbackEffect {
        match self {
            Self::Running | Self::Retrieved | Self::Download | Self::Warning => {
                UpdateFeedbackEffect::Progress
            }
            Self::Downloaded => UpdateFeedbackEffect::Downloaded,
            Self::Finished => UpdateFeedbackEffect::Finished,
            Self::Error => UpdateFeedbackEffect::Failed,
            Self::Canceling | Self::Canceled | Self::CancelRejected => {
                UpdateFeedbackEffect::CancelChannelOnly
            }
        }
    }

    /// Classifies feedback reported through the cancel channel.
    #[must_use]
    pub fn cancel_feedback_effect(self) -> CancelFeedbackEffect {
        match self {
            Self::Canceled | Self::Finished => CancelFeedbackEffect::Confirmed,
            Self::Error | Self::CancelRejected => CancelFeedbackEffect::Rejected,
            Self::Running
            | Self::Retrieved
            | Self::Download
            | Self::Downloaded
            | Self::Warning
            | Self::Canceling => CancelFeedbackEffect::Progress,
        }
    }

    /// Returns true for canceling or canceled actions.
    #[must_use]
    pub fn is_canceling_or_canceled(self) -> bool {
        matches!(self, Self::Canceling | Self::Canceled)
    }
}

impl Display for ActionStatus {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for ActionStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| AppError::Validation(format!("unknown action status '{value}'")))
    }
}

/// How strongly the controller is pushed to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionType {
    /// Controller may defer the installation.
    Soft,
    /// Controller must install immediately.
    Forced,
    /// Soft until the given instant, forced afterwards.
    TimeForced {
        /// Instant from which the action counts as forced.
        force_at: DateTime<Utc>,
    },
    /// Download artifacts without installing them.
    DownloadOnly,
}

impl ActionType {
    /// Returns stable storage value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Forced => "forced",
            Self::TimeForced { .. } => "time_forced",
            Self::DownloadOnly => "download_only",
        }
    }

    /// Parses storage values; time-forced requires its instant.
    pub fn parse(value: &str, force_at: Option<DateTime<Utc>>) -> AppResult<Self> {
        match (value, force_at) {
            ("soft", _) => Ok(Self::Soft),
            ("forced", _) => Ok(Self::Forced),
            ("time_forced", Some(force_at)) => Ok(Self::TimeForced { force_at }),
            ("time_forced", None) => Err(AppError::Validation(
                "time_forced action type requires force_at".to_owned(),
            )),
            ("download_only", _) => Ok(Self::DownloadOnly),
            _ => Err(AppError::Validation(format!(
                "unknown action type '{value}'"
            ))),
        }
    }

    /// Returns the force instant for time-forced actions.
    #[must_use]
    pub fn force_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::TimeForced { force_at } => Some(*force_at),
            _ => None,
        }
    }

    /// Returns true for download-only actions.
    #[must_use]
    pub fn is_download_only(&self) -> bool {
        matches!(self, Self::DownloadOnly)
    }

    /// Returns true when the action counts as forced at the given instant.
    #[must_use]
    pub fn is_forced_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Forced => true,
            Self::TimeForced { force_at } => *force_at <= now,
            Self::Soft | Self::DownloadOnly => false,
        }
    }
}

/// Maintenance window during which installation may happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    schedule: NonEmptyString,
    duration: NonEmptyString,
    timezone: NonEmptyString,
}

impl MaintenanceWindow {
    /// Creates a maintenance window from a cron schedule, a duration and a timezone offset.
    pub fn new(
        schedule: impl Into<String>,
        duration: impl Into<String>,
        timezone: impl Into<String>,
    ) -> AppResult<Self> {
        Ok(Self {
            schedule: NonEmptyString::new(schedule)?,
            duration: NonEmptyString::new(duration)?,
            timezone: NonEmptyString::new(timezone)?,
        })
    }

    /// Returns the cron schedule.
    #[must_use]
    pub fn schedule(&self) -> &str {
        self.schedule.as_str()
    }

    /// Returns the window duration.
    #[must_use]
    pub fn duration(&self) -> &str {
        self.duration.as_str()
    }

    /// Returns the timezone offset.
    #[must_use]
    pub fn timezone(&self) -> &str {
        self.timezone.as_str()
    }
}

/// Input for a new action.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAction {
    /// Target controller.
    pub controller_id: ControllerId,
    /// Assigned distribution set.
    pub distribution_set_id: DistributionSetId,
    /// Action type.
    pub action_type: ActionType,
    /// Optional weight.
    pub weight: Option<i32>,
    /// Optional maintenance window.
    pub maintenance_window: Option<MaintenanceWindow>,
    /// Optional external reference.
    pub external_ref: Option<String>,
    /// Optional initiator.
    pub initiated_by: Option<String>,
}

/// Full action state used by repositories to rehydrate actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionParts {
    /// Identifier.
    pub id: ActionId,
    /// Target controller.
    pub controller_id: ControllerId,
    /// Assigned distribution set.
    pub distribution_set_id: DistributionSetId,
    /// Current status.
    pub status: ActionStatus,
    /// Whether the action is still open.
    pub active: bool,
    /// Optional weight.
    pub weight: Option<i32>,
    /// Action type.
    pub action_type: ActionType,
    /// Optional maintenance window.
    pub maintenance_window: Option<MaintenanceWindow>,
    /// Optional external reference.
    pub external_ref: Option<String>,
    /// Optional initiator.
    pub initiated_by: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub last_modified_at: DateTime<Utc>,
    /// Optimistic concurrency version.
    pub version: i64,
}

/// Result of applying one feedback entry to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOutcome {
    /// Entry recorded and status field updated; action stays active.
    Progressed,
    /// Entry recorded without touching the status field.
    Recorded,
    /// Feedback dropped; nothing is written.
    Ignored,
    /// Assignment completed successfully and the action is closed.
    Completed,
    /// Assignment failed and the action is closed.
    Failed,
    /// Cancellation confirmed and the action is closed.
    CancelConfirmed,
    /// Cancellation rejected; the action runs again.
    CancelRejected,
}

impl FeedbackOutcome {
    /// Returns true when the outcome closed the action.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::CancelConfirmed)
    }

    /// Returns true when a status entry must be stored.
    #[must_use]
    pub fn records_entry(self) -> bool {
        self != Self::Ignored
    }
}

/// Inputs of a feedback transition that live outside the action itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackContext {
    /// Transition timestamp.
    pub now: DateTime<Utc>,
    /// Whether the target has other active actions.
    pub other_active_actions: bool,
    /// Whether intermediate feedback for closed actions is still recorded.
    pub record_closed_intermediate: bool,
}

/// One deployment of a distribution set to a target.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    id: ActionId,
    controller_id: ControllerId,
    distribution_set_id: DistributionSetId,
    status: ActionStatus,
    active: bool,
    weight: Option<i32>,
    action_type: ActionType,
    maintenance_window: Option<MaintenanceWindow>,
    external_ref: Option<String>,
    initiated_by: Option<String>,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    version: i64,
}

impl Action {
    /// Creates a running, active action from validated input.
    pub fn create(id: ActionId, input: NewAction, now: DateTime<Utc>) -> AppResult<Self> {
        validate_weight(input.weight)?;

        Ok(Self {
            id,
            controller_id: input.controller_id,
            distribution_set_id: input.distribution_set_id,
            status: ActionStatus::Running,
            active: true,
            weight: input.weight,
            action_type: input.action_type,
            maintenance_window: input.maintenance_window,
            external_ref: input.external_ref,
            initiated_by: input.initiated_by,
            created_at: now,
            last_modified_at: now,
            version: 0,
        })
    }

    /// Rehydrates a stored action.
    #[must_use]
    pub fn restore(parts: ActionParts) -> Self {
        Self {
            id: parts.id,
            controller_id: parts.controller_id,
            distribution_set_id: parts.distribution_set_id,
            status: parts.status,
            active: parts.active,
            weight: parts.weight,
            action_type: parts.action_type,
            maintenance_window: parts.maintenance_window,
            external_ref: parts.external_ref,
            initiated_by: parts.initiated_by,
            created_at: parts.created_at,
            last_modified_at: parts.last_modified_at,
            version: parts.version,
        }
    }

    /// Returns the identifier.
    #[must_use]
    pub fn id(&self) -> ActionId {
        self.id
    }

    /// Returns the target controller.
    #[must_use]
    pub fn controller_id(&self) -> &ControllerId {
        &self.controller_id
    }

    /// Returns the distribution set.
    #[must_use]
    pub fn distribution_set_id(&self) -> DistributionSetId {
        self.distribution_set_id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> ActionStatus {
        self.status
    }

    /// Returns whether the action is still open.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns the optional weight.
    #[must_use]
    pub fn weight(&self) -> Option<i32> {
        self.weight
    }

    /// Returns the weight, falling back to a default when unset.
    #[must_use]
    pub fn effective_weight(&self, default_weight: i32) -> i32 {
        self.weight.unwrap_or(default_weight)
    }

    /// Returns the action type.
    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    /// Returns the maintenance window.
    #[must_use]
    pub fn maintenance_window(&self) -> Option<&MaintenanceWindow> {
        self.maintenance_window.as_ref()
    }

    /// Returns the external reference.
    #[must_use]
    pub fn external_ref(&self) -> Option<&str> {
        self.external_ref.as_deref()
    }

    /// Returns the initiator.
    #[must_use]
    pub fn initiated_by(&self) -> Option<&str> {
        self.initiated_by.as_deref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last modification timestamp.
    #[must_use]
    pub fn last_modified_at(&self) -> DateTime<Utc> {
        self.last_modified_at
    }

    /// Returns the optimistic concurrency version.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Sets the optimistic concurrency version after a successful write.
    pub fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    /// Returns true when update feedback with this status is subject to
    /// status and message quotas.
    #[must_use]
    pub fn is_informational_update(&self, status: ActionStatus) -> bool {
        match status.update_feedback_effect() {
            UpdateFeedbackEffect::Progress => true,
            UpdateFeedbackEffect::Downloaded => !self.action_type.is_download_only(),
            UpdateFeedbackEffect::Finished
            | UpdateFeedbackEffect::Failed
            | UpdateFeedbackEffect::CancelChannelOnly => false,
        }
    }

    /// Applies feedback reported through the update channel.
    pub fn apply_update_feedback(
        &mut self,
        status: ActionStatus,
        target: &mut Target,
        context: FeedbackContext,
    ) -> AppResult<FeedbackOutcome> {
        let effect = status.update_feedback_effect();
        if effect == UpdateFeedbackEffect::CancelChannelOnly {
            return Err(AppError::InvalidState(format!(
                "status '{status}' for action '{}' must be reported as cancel feedback",
                self.id
            )));
        }

        if !self.active {
            return Ok(self.apply_closed_update_feedback(status, target, context));
        }

        if self.status == ActionStatus::Canceling {
            return match effect {
                UpdateFeedbackEffect::Finished | UpdateFeedbackEffect::Failed => {
                    Err(AppError::InvalidState(format!(
                        "action '{}' is being canceled; report '{status}' as cancel feedback",
                        self.id
                    )))
                }
                _ => Ok(FeedbackOutcome::Recorded),
            };
        }

        let download_only = self.action_type.is_download_only();
        let outcome = match effect {
            UpdateFeedbackEffect::Progress => {
                self.status = status;
                FeedbackOutcome::Progressed
            }
            UpdateFeedbackEffect::Downloaded if download_only => {
                self.close(ActionStatus::Downloaded);
                target.complete_download();
                target.mark_request_attributes();
                FeedbackOutcome::Completed
            }
            UpdateFeedbackEffect::Downloaded => {
                self.status = ActionStatus::Downloaded;
                FeedbackOutcome::Progressed
            }
            UpdateFeedbackEffect::Finished => {
                self.close(ActionStatus::Finished);
                target.complete_installation(
                    self.distribution_set_id,
                    download_only,
                    context.other_active_actions,
                    context.now,
                );
                target.mark_request_attributes();
                FeedbackOutcome::Completed
            }
            UpdateFeedbackEffect::Failed => {
                self.close(ActionStatus::Error);
                target.fail_assignment();
                FeedbackOutcome::Failed
            }
            UpdateFeedbackEffect::CancelChannelOnly => FeedbackOutcome::Ignored,
        };

        self.last_modified_at = context.now;
        Ok(outcome)
    }

    fn apply_closed_update_feedback(
        &mut self,
        status: ActionStatus,
        target: &mut Target,
        context: FeedbackContext,
    ) -> FeedbackOutcome {
        match status.update_feedback_effect() {
            UpdateFeedbackEffect::Finished if self.action_type.is_download_only() => {
                self.status = ActionStatus::Finished;
                self.last_modified_at = context.now;
                target.complete_installation(
                    self.distribution_set_id,
                    true,
                    context.other_active_actions,
                    context.now,
                );
                target.mark_request_attributes();
                FeedbackOutcome::Completed
            }
            UpdateFeedbackEffect::Finished | UpdateFeedbackEffect::Failed => {
                FeedbackOutcome::Ignored
            }
            UpdateFeedbackEffect::Progress
            | UpdateFeedbackEffect::Downloaded
            | UpdateFeedbackEffect::CancelChannelOnly => {
                if context.record_closed_intermediate {
                    FeedbackOutcome::Recorded
                } else {
                    FeedbackOutcome::Ignored
                }
            }
        }
    }

    /// Moves an active action to canceling.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> AppResult<()> {
        if self.status.is_canceling_or_canceled() {
            return Err(AppError::CancelNotAllowed(format!(
                "action '{}' is already {}",
                self.id, self.status
            )));
        }

        if !self.active {
            return Err(AppError::CancelNotAllowed(format!(
                "action '{}' is not active",
                self.id
            )));
        }

        self.status = ActionStatus::Canceling;
        self.last_modified_at = now;
        Ok(())
    }

    /// Applies feedback reported through the cancel channel.
    ///
    /// `next_assignment` is the distribution set the target falls back to when
    /// other active actions remain.
    pub fn apply_cancel_feedback(
        &mut self,
        status: ActionStatus,
        target: &mut Target,
        next_assignment: Option<DistributionSetId>,
        now: DateTime<Utc>,
    ) -> AppResult<FeedbackOutcome> {
        if !self.status.is_canceling_or_canceled() {
            return Err(AppError::CancelNotAllowed(format!(
                "action '{}' is {} and not canceling",
                self.id, self.status
            )));
        }

        if self.status == ActionStatus::Canceled {
            return Ok(FeedbackOutcome::Recorded);
        }

        let outcome = match status.cancel_feedback_effect() {
            CancelFeedbackEffect::Confirmed => {
                self.close(ActionStatus::Canceled);
                target.fall_back_after_cancel(next_assignment);
                FeedbackOutcome::CancelConfirmed
            }
            CancelFeedbackEffect::Rejected => {
                self.status = ActionStatus::Running;
                FeedbackOutcome::CancelRejected
            }
            CancelFeedbackEffect::Progress => FeedbackOutcome::Recorded,
        };

        self.last_modified_at = now;
        Ok(outcome)
    }

    /// Closes a canceling action without controller acknowledgement.
    pub fn force_quit(
        &mut self,
        target: &mut Target,
        next_assignment: Option<DistributionSetId>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        if self.status != ActionStatus::Canceling || !self.active {
            return Err(AppError::CancelNotAllowed(format!(
                "action '{}' must be canceling to be force quit",
                self.id
            )));
        }

        self.close(ActionStatus::Canceled);
        self.last_modified_at = now;
        target.fall_back_after_cancel(next_assignment);
        Ok(())
    }

    /// Records that the controller retrieved the action.
    ///
    /// The status field is left alone for canceling, canceled or closed actions.
    pub fn apply_retrieved(&mut self, now: DateTime<Utc>) -> FeedbackOutcome {
        if !self.active || self.status.is_canceling_or_canceled() {
            return FeedbackOutcome::Recorded;
        }

        self.status = ActionStatus::Retrieved;
        self.last_modified_at = now;
        FeedbackOutcome::Progressed
    }

    /// Switches an active action to forced.
    ///
    /// Returns false when the action is already forced.
    pub fn force(&mut self, now: DateTime<Utc>) -> AppResult<bool> {
        if !self.active {
            return Err(AppError::InvalidState(format!(
                "action '{}' is not active",
                self.id
            )));
        }

        if self.action_type == ActionType::Forced {
            return Ok(false);
        }

        self.action_type = ActionType::Forced;
        self.last_modified_at = now;
        Ok(true)
    }

    /// Sets the external reference.
    pub fn set_external_ref(&mut self, external_ref: Option<String>, now: DateTime<Utc>) {
        self.external_ref = external_ref
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        self.last_modified_at = now;
    }

    fn close(&mut self, status: ActionStatus) {
        self.status = status;
        self.active = false;
    }
}

/// Validates an optional action weight.
pub fn validate_weight(weight: Option<i32>) -> AppResult<()> {
    if let Some(weight) = weight
        && !(0..=MAX_ACTION_WEIGHT).contains(&weight)
    {
        return Err(AppError::Validation(format!(
            "action weight must be between 0 and {MAX_ACTION_WEIGHT}, got {weight}"
        )));
    }

    Ok(())
}
