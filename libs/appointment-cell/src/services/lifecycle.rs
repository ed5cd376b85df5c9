// libs/appointment-cell/src/services/lifecycle.rs
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use shared_models::{Notification, NotificationType, RequestStatus, Session};

use crate::models::AppointmentError;

/// Where a request stands relative to the resolution being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No outcome recorded yet, run the whole fan-out.
    Fresh,
    /// Already marked with the same outcome, only missing writes remain.
    Resume,
}

/// Preconditions of the request lifecycle: pending -> accepted | rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestLifecycleService;

impl RequestLifecycleService {
    pub fn new() -> Self {
        Self
    }

    /// Checks that `actor` may resolve `request` as `target`.
    pub fn check_resolution(
        &self,
        actor: &Session,
        request: &Notification,
        target: RequestStatus,
    ) -> Result<Resolution, AppointmentError> {
        if request.notification_type != NotificationType::AppointmentRequest {
            return Err(AppointmentError::NotAppointmentRequest(request.id.clone()));
        }

        if !actor.is_therapist() || request.recipient_id != actor.user_id {
            warn!(
                "User {} attempted to resolve request {} addressed to {}",
                actor.user_id, request.id, request.recipient_id
            );
            return Err(AppointmentError::Unauthorized);
        }

        match request.request_status {
            None => Ok(Resolution::Fresh),
            Some(status) if status == target => {
                debug!("Request {} already {}, resuming", request.id, status);
                Ok(Resolution::Resume)
            }
            Some(status) => Err(AppointmentError::AlreadyResolved(status)),
        }
    }

    /// The slot must end after it starts and must not start in the past.
    pub fn validate_slot(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), AppointmentError> {
        if end <= start {
            return Err(AppointmentError::InvalidTime(format!(
                "end time {} must be after start time {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }

        if start < now {
            return Err(AppointmentError::InvalidTime(format!(
                "start time {} is in the past",
                start.to_rfc3339()
            )));
        }

        Ok(())
    }

    pub fn validate_rejection_reason(&self, reason: &str) -> Result<String, AppointmentError> {
        let trimmed = reason.trim();
        if trimmed.is_empty() {
            return Err(AppointmentError::ValidationError(
                "a reason for rejection is required".to_string(),
            ));
        }
        Ok(trimmed.to_string())
    }
}
