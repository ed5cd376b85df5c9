// libs/appointment-cell/src/models.rs
use serde::{Deserialize, Serialize};
use std::fmt;

use shared_models::{AppError, Notification, RequestStatus, Session, StatusKind};

// ==============================================================================
// PERSPECTIVE
// ==============================================================================

/// Which side of the client/therapist relationship a device is on. Decides
/// which field is filtered on and which field keys the status map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Perspective {
    Client,
    Therapist,
}

impl Perspective {
    pub fn of(session: &Session) -> Self {
        if session.is_client() {
            Perspective::Client
        } else {
            Perspective::Therapist
        }
    }

    /// Field holding the signed-in user's id.
    pub fn own_field(&self) -> &'static str {
        match self {
            Perspective::Client => "clientId",
            Perspective::Therapist => "therapistId",
        }
    }

    pub fn counterparty_id<'a>(&self, notification: &'a Notification) -> &'a str {
        match self {
            Perspective::Client => &notification.therapist_id,
            Perspective::Therapist => &notification.client_id,
        }
    }

    pub fn counterparty_name(&self, notification: &Notification) -> String {
        match self {
            Perspective::Client => notification.therapist_display_name(),
            Perspective::Therapist => notification
                .client
                .name
                .clone()
                .unwrap_or_else(|| "Client".to_string()),
        }
    }
}

// ==============================================================================
// WORKFLOW RESULTS
// ==============================================================================

/// One document write inside an accept or reject fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStep {
    MarkRequest,
    NotifyClient,
    CreateAppointment,
}

impl fmt::Display for WriteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteStep::MarkRequest => write!(f, "update original request"),
            WriteStep::NotifyClient => write!(f, "notify client"),
            WriteStep::CreateAppointment => write!(f, "create appointment"),
        }
    }
}

fn describe_steps(steps: &[WriteStep]) -> String {
    if steps.is_empty() {
        return "none".to_string();
    }
    steps
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOutcome {
    pub request_id: String,
    pub notification_id: String,
    pub appointment_id: String,
    /// Set when the request had already been marked accepted and only the
    /// missing writes were performed.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectOutcome {
    pub request_id: String,
    pub notification_id: String,
    pub resumed: bool,
}

// ==============================================================================
// ERRORS
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppointmentError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Notification {0} is not an appointment request")]
    NotAppointmentRequest(String),

    #[error("Request has already been {0}")]
    AlreadyResolved(RequestStatus),

    #[error("Unauthorized access to appointment request")]
    Unauthorized,

    #[error("Only clients can request appointments")]
    NotAClient,

    #[error("A request to this therapist is already {0}")]
    DuplicateRequest(StatusKind),

    #[error("Invalid appointment time: {0}")]
    InvalidTime(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(
        "Request only partially processed: completed [{}], failed at {failed}: {source}",
        describe_steps(.completed)
    )]
    PartialWrite {
        completed: Vec<WriteStep>,
        failed: WriteStep,
        source: AppError,
    },

    #[error(transparent)]
    Store(#[from] AppError),
}

impl AppointmentError {
    /// Worth trying again later, e.g. the store was unreachable.
    pub fn is_transient(&self) -> bool {
        match self {
            AppointmentError::Store(e) => e.is_transient(),
            AppointmentError::PartialWrite { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_permission(&self) -> bool {
        match self {
            AppointmentError::Store(e) => e.is_permission(),
            AppointmentError::PartialWrite { source, .. } => source.is_permission(),
            _ => false,
        }
    }
}
