//! Events exchanged between the orchestrator and the registration services.
//!
//! Every event carries the saga it belongs to, a unique event id, a timestamp
//! and the correlation id of the originating request. The variant-specific
//! payload is flattened next to those fields and discriminated by
//! `eventType`, so the JSON form is a single flat object:
//!
//! ```json
//! {"sagaId":"...","eventId":"...","timestamp":"...","correlationId":"c-1",
//!  "eventType":"ALERT_SETUP_FAILED","userId":"u-1","errorMessage":"x","errorCode":"E1"}
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{EventId, SagaId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registration::{STEP_CREATE_USER, STEP_SEND_WELCOME_NOTIFICATION, STEP_SETUP_ALERTS};

pub const USER_CREATED: &str = "USER_CREATED";
pub const USER_CREATION_FAILED: &str = "USER_CREATION_FAILED";
pub const ALERT_SETUP_COMPLETED: &str = "ALERT_SETUP_COMPLETED";
pub const ALERT_SETUP_FAILED: &str = "ALERT_SETUP_FAILED";
pub const NOTIFICATION_SENT: &str = "NOTIFICATION_SENT";
pub const NOTIFICATION_FAILED: &str = "NOTIFICATION_FAILED";
pub const SAGA_COMPENSATION: &str = "SAGA_COMPENSATION";

/// Every discriminant the codec understands.
pub const EVENT_TYPES: [&str; 7] = [
    USER_CREATED,
    USER_CREATION_FAILED,
    ALERT_SETUP_COMPLETED,
    ALERT_SETUP_FAILED,
    NOTIFICATION_SENT,
    NOTIFICATION_FAILED,
    SAGA_COMPENSATION,
];

/// An event on the saga channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaEvent {
    pub saga_id: SagaId,
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Variant-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// The user record was created.
    UserCreated(UserCreatedData),

    /// The user record could not be created.
    UserCreationFailed(StepFailedData),

    /// Usage alerts were configured.
    AlertSetupCompleted(AlertSetupCompletedData),

    /// Usage alerts could not be configured.
    AlertSetupFailed(StepFailedData),

    /// The welcome notification went out.
    NotificationSent(NotificationSentData),

    /// The welcome notification could not be sent.
    NotificationFailed(NotificationFailedData),

    /// Request (and acknowledgment) to undo completed work.
    SagaCompensation(SagaCompensationData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCreatedData {
    pub user_id: String,
    pub phone_number: String,
    pub data_plan_limit: i64,
    pub current_usage: i64,
}

/// Data shared by `USER_CREATION_FAILED` and `ALERT_SETUP_FAILED`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailedData {
    pub user_id: Option<String>,
    pub error_message: String,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSetupCompletedData {
    pub user_id: String,
    pub alert_id: String,
    pub threshold_percent: f64,
    pub alert_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSentData {
    pub user_id: String,
    pub notification_id: String,
    pub notification_type: String,
    pub recipient: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFailedData {
    pub user_id: String,
    pub notification_type: String,
    pub error_message: String,
    pub error_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaCompensationData {
    pub compensation_reason: String,
    pub failed_step: Option<String>,
    #[serde(default)]
    pub compensation_data: HashMap<String, serde_json::Value>,
}

/// What an event means for the saga it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind<'a> {
    /// The named step finished successfully.
    StepSucceeded { step: &'static str },
    /// The named step failed.
    StepFailed {
        step: &'static str,
        error_message: &'a str,
    },
    /// The saga's compensation was acknowledged.
    Compensation,
}

impl EventPayload {
    /// The `eventType` discriminant.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::UserCreated(_) => USER_CREATED,
            EventPayload::UserCreationFailed(_) => USER_CREATION_FAILED,
            EventPayload::AlertSetupCompleted(_) => ALERT_SETUP_COMPLETED,
            EventPayload::AlertSetupFailed(_) => ALERT_SETUP_FAILED,
            EventPayload::NotificationSent(_) => NOTIFICATION_SENT,
            EventPayload::NotificationFailed(_) => NOTIFICATION_FAILED,
            EventPayload::SagaCompensation(_) => SAGA_COMPENSATION,
        }
    }

    /// Maps the event onto the step it reports on.
    pub fn kind(&self) -> EventKind<'_> {
        match self {
            EventPayload::UserCreated(_) => EventKind::StepSucceeded {
                step: STEP_CREATE_USER,
            },
            EventPayload::AlertSetupCompleted(_) => EventKind::StepSucceeded {
                step: STEP_SETUP_ALERTS,
            },
            EventPayload::NotificationSent(_) => EventKind::StepSucceeded {
                step: STEP_SEND_WELCOME_NOTIFICATION,
            },
            EventPayload::UserCreationFailed(data) => EventKind::StepFailed {
                step: STEP_CREATE_USER,
                error_message: &data.error_message,
            },
            EventPayload::AlertSetupFailed(data) => EventKind::StepFailed {
                step: STEP_SETUP_ALERTS,
                error_message: &data.error_message,
            },
            EventPayload::NotificationFailed(data) => EventKind::StepFailed {
                step: STEP_SEND_WELCOME_NOTIFICATION,
                error_message: &data.error_message,
            },
            EventPayload::SagaCompensation(_) => EventKind::Compensation,
        }
    }
}

impl SagaEvent {
    /// Creates an event stamped with the current time.
    pub fn new(saga_id: SagaId, correlation_id: impl Into<String>, payload: EventPayload) -> Self {
        Self::at(saga_id, correlation_id, Utc::now(), payload)
    }

    /// Creates an event with an explicit timestamp.
    pub fn at(
        saga_id: SagaId,
        correlation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            saga_id,
            event_id: EventId::new(),
            timestamp,
            correlation_id: correlation_id.into(),
            payload,
        }
    }

    /// Creates a `SAGA_COMPENSATION` event.
    pub fn compensation(
        saga_id: SagaId,
        correlation_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        reason: impl Into<String>,
        failed_step: Option<String>,
        compensation_data: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::at(
            saga_id,
            correlation_id,
            timestamp,
            EventPayload::SagaCompensation(SagaCompensationData {
                compensation_reason: reason.into(),
                failed_step,
                compensation_data,
            }),
        )
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    pub fn kind(&self) -> EventKind<'_> {
        self.payload.kind()
    }

    /// Channel key. Every event belongs to a saga, so the event id fallback
    /// never applies.
    pub fn partition_key(&self) -> String {
        self.saga_id.to_string()
    }

    /// Returns the compensation payload if this is a `SAGA_COMPENSATION` event.
    pub fn as_compensation(&self) -> Option<&SagaCompensationData> {
        match &self.payload {
            EventPayload::SagaCompensation(data) => Some(data),
            _ => None,
        }
    }
}

/// Errors turning bytes into a [`SagaEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The `eventType` discriminant is not one this build understands.
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// The payload is not valid JSON or is missing required fields.
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl DecodeError {
    /// Short label used for the dropped-events metric.
    pub fn reason(&self) -> &'static str {
        match self {
            DecodeError::UnknownEventType(_) => "unknown_event_type",
            DecodeError::Malformed(_) => "malformed",
        }
    }
}

/// Serializes an event for the channel.
pub fn encode(event: &SagaEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(event)
}

/// Deserializes an event, separating unknown discriminants from malformed
/// payloads.
pub fn decode(bytes: &[u8]) -> Result<SagaEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(event_type) = value.get("eventType").and_then(|t| t.as_str())
        && !EVENT_TYPES.contains(&event_type)
    {
        return Err(DecodeError::UnknownEventType(event_type.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}
