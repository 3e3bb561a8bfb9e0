//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod action;
mod action_status;
mod distribution_set;
mod field_data;
mod filter_query;
mod rsql;
mod target;

pub use action::{
    Action, ActionId, ActionParts, ActionStatus, ActionType, CancelFeedbackEffect,
    FeedbackContext, FeedbackOutcome, MAX_ACTION_WEIGHT, MaintenanceWindow, NewAction,
    UpdateFeedbackEffect, validate_weight,
};
pub use action_status::{ActionStatusEntry, ActionStatusUpdate, CANCELLATION_FINISHED_MESSAGE};
pub use distribution_set::{DistributionSet, DistributionSetId};
pub use field_data::TargetFieldData;
pub use filter_query::{AutoAssignment, TargetFilterQuery, TargetFilterQueryId};
pub use rsql::{ComparisonOperator, FieldPath, FilterExpression, FilterMatcher, TargetField};
pub use target::{
    AttributeLimits, AttributeUpdateMode, ControllerId, LAST_UPDATE_ATTRIBUTE,
    MAX_CONTROLLER_ID_LENGTH, Target, TargetParts, TargetType, TargetUpdateStatus,
};
