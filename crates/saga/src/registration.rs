//! User registration saga: step names, owning services and compensations.

use crate::model::SagaStep;

/// The saga type identifier for user registration.
pub const SAGA_TYPE: &str = "UserRegistration";

/// Step name: create the user record.
pub const STEP_CREATE_USER: &str = "CREATE_USER";

/// Step name: configure data-usage alerts for the user.
pub const STEP_SETUP_ALERTS: &str = "SETUP_ALERTS";

/// Step name: send the welcome notification.
pub const STEP_SEND_WELCOME_NOTIFICATION: &str = "SEND_WELCOME_NOTIFICATION";

pub const USER_SERVICE: &str = "user-service";
pub const ALERT_SERVICE: &str = "alert-trigger-service";
pub const NOTIFICATION_SERVICE: &str = "notification-service";

pub const COMPENSATE_DELETE_USER: &str = "DELETE_USER";
pub const COMPENSATE_DISABLE_ALERTS: &str = "DISABLE_ALERTS";
pub const COMPENSATE_SEND_FAILURE_NOTIFICATION: &str = "SEND_FAILURE_NOTIFICATION";

/// The fixed three-step plan, in execution order.
pub fn plan() -> Vec<SagaStep> {
    vec![
        SagaStep::new(STEP_CREATE_USER, USER_SERVICE, COMPENSATE_DELETE_USER),
        SagaStep::new(STEP_SETUP_ALERTS, ALERT_SERVICE, COMPENSATE_DISABLE_ALERTS),
        SagaStep::new(
            STEP_SEND_WELCOME_NOTIFICATION,
            NOTIFICATION_SERVICE,
            COMPENSATE_SEND_FAILURE_NOTIFICATION,
        ),
    ]
}

/// Saga failure reason recorded when a step's failure event arrives.
pub fn failure_reason(step: &str) -> &'static str {
    match step {
        STEP_CREATE_USER => "User creation failed",
        STEP_SETUP_ALERTS => "Alert setup failed",
        STEP_SEND_WELCOME_NOTIFICATION => "Notification failed",
        _ => "Step failed",
    }
}
