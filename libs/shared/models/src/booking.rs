use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::UserType;

// ==============================================================================
// NOTIFICATION DOCUMENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    AppointmentRequest,
    AppointmentAccepted,
    AppointmentRejected,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::AppointmentRequest => "appointment_request",
            NotificationType::AppointmentAccepted => "appointment_accepted",
            NotificationType::AppointmentRejected => "appointment_rejected",
        }
    }

    pub fn lifecycle_types() -> [NotificationType; 3] {
        [
            NotificationType::AppointmentRequest,
            NotificationType::AppointmentAccepted,
            NotificationType::AppointmentRejected,
        ]
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadStatus {
    #[default]
    Unread,
    Read,
}

/// Outcome recorded on the original request document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Accepted,
    Rejected,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Accepted => write!(f, "accepted"),
            RequestStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Therapist fields captured when the event happened. Never re-joined
/// against the live profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TherapistSnapshot {
    #[serde(rename = "therapistName", default)]
    pub name: Option<String>,
    #[serde(rename = "therapistGender", default)]
    pub gender: Option<String>,
    #[serde(rename = "therapistType", default)]
    pub therapist_type: Option<String>,
    #[serde(rename = "therapistExpertise", default)]
    pub expertise: Option<String>,
    #[serde(rename = "therapistProfileImage", default)]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClientSnapshot {
    #[serde(rename = "clientName", default)]
    pub name: Option<String>,
    #[serde(rename = "clientAge", default)]
    pub age: Option<String>,
    #[serde(rename = "clientGender", default)]
    pub gender: Option<String>,
    #[serde(rename = "clientComplaint", default)]
    pub complaint: Option<String>,
    #[serde(rename = "clientProfileImage", default)]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, skip_serializing)]
    pub id: String,
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_type: Option<UserType>,
    pub recipient_id: String,
    pub therapist_id: String,
    pub client_id: String,
    #[serde(default)]
    pub status: ReadStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_status: Option<RequestStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request_id: Option<String>,
    #[serde(flatten)]
    pub therapist: TherapistSnapshot,
    #[serde(flatten)]
    pub client: ClientSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Notification {
    /// Creation time used for ordering. A document whose server timestamp has
    /// not resolved yet is the newest thing the client knows about.
    pub fn effective_created_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.created_at.unwrap_or(now)
    }

    pub fn is_unread(&self) -> bool {
        self.status == ReadStatus::Unread
    }

    /// End of the slot this notification carries, if it carries one.
    pub fn slot_end(&self) -> Option<DateTime<Utc>> {
        match (self.scheduled_time, self.end_time) {
            (_, Some(end)) => Some(end),
            (Some(start), None) => Some(start + default_appointment_length()),
            (None, None) => None,
        }
    }

    pub fn therapist_display_name(&self) -> String {
        self.therapist
            .name
            .clone()
            .unwrap_or_else(|| "Therapist".to_string())
    }
}

// ==============================================================================
// APPOINTMENT DOCUMENTS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    #[default]
    Scheduled,
}

pub fn default_appointment_length() -> Duration {
    Duration::hours(1)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub therapist_id: String,
    pub client_id: String,
    pub scheduled_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: AppointmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request_id: Option<String>,
    #[serde(flatten)]
    pub therapist: TherapistSnapshot,
    #[serde(flatten)]
    pub client: ClientSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Appointment {
    pub fn effective_end_time(&self) -> DateTime<Utc> {
        self.end_time
            .unwrap_or(self.scheduled_time + default_appointment_length())
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.effective_end_time() > now
    }

    pub fn therapist_display_name(&self) -> String {
        self.therapist
            .name
            .clone()
            .unwrap_or_else(|| "Therapist".to_string())
    }
}

// ==============================================================================
// DIRECTORY ENTRIES
// ==============================================================================

/// A therapist as listed in the directory, with expertise already flattened
/// into display labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TherapistProfile {
    pub id: String,
    pub name: Option<String>,
    pub user_type: UserType,
    pub gender: Option<String>,
    #[serde(default)]
    pub expertise: Vec<String>,
    pub profile_image_url: Option<String>,
}

impl TherapistProfile {
    pub fn expertise_text(&self) -> String {
        if self.expertise.is_empty() {
            "Not specified".to_string()
        } else {
            self.expertise.join(", ")
        }
    }

    pub fn snapshot(&self) -> TherapistSnapshot {
        TherapistSnapshot {
            name: self.name.clone(),
            gender: Some(
                self.gender
                    .clone()
                    .unwrap_or_else(|| "Not specified".to_string()),
            ),
            therapist_type: Some(self.user_type.as_str().to_string()),
            expertise: Some(self.expertise_text()),
            profile_image: self.profile_image_url.clone(),
        }
    }
}
