use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub therapist_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedRequest {
    pub appointment_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub therapist_name: String,
    /// `false` while only the acceptance notification is visible and the
    /// appointment document has not been observed yet.
    #[serde(default = "confirmed_by_default")]
    pub confirmed: bool,
}

fn confirmed_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RejectedTherapist {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Per-counterparty relationship state derived from notifications and
/// appointments. Keys are therapist ids on a client's device and client ids on
/// a therapist's device. A counterparty appears in at most one map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusMap {
    #[serde(default)]
    pub pending_requests: BTreeMap<String, PendingRequest>,
    #[serde(default)]
    pub accepted_requests: BTreeMap<String, AcceptedRequest>,
    #[serde(default)]
    pub rejected_therapists: BTreeMap<String, RejectedTherapist>,
}

impl StatusMap {
    pub fn is_empty(&self) -> bool {
        self.pending_requests.is_empty()
            && self.accepted_requests.is_empty()
            && self.rejected_therapists.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending_requests.len() + self.accepted_requests.len() + self.rejected_therapists.len()
    }

    /// Accepted wins over pending, pending over rejected. The derivation never
    /// produces overlapping entries, the precedence only matters for maps read
    /// back from an older cache.
    pub fn status_of(&self, counterparty_id: &str) -> TherapistStatus {
        if let Some(accepted) = self.accepted_requests.get(counterparty_id) {
            return TherapistStatus::Accepted(accepted.clone());
        }
        if let Some(pending) = self.pending_requests.get(counterparty_id) {
            return TherapistStatus::Pending(pending.clone());
        }
        if let Some(rejected) = self.rejected_therapists.get(counterparty_id) {
            return TherapistStatus::Rejected(rejected.clone());
        }
        TherapistStatus::None
    }

    pub fn set_pending(&mut self, counterparty_id: &str, pending: PendingRequest) {
        self.clear(counterparty_id);
        self.pending_requests.insert(counterparty_id.to_string(), pending);
    }

    pub fn set_accepted(&mut self, counterparty_id: &str, accepted: AcceptedRequest) {
        self.clear(counterparty_id);
        self.accepted_requests.insert(counterparty_id.to_string(), accepted);
    }

    pub fn set_rejected(&mut self, counterparty_id: &str, rejected: RejectedTherapist) {
        self.clear(counterparty_id);
        self.rejected_therapists.insert(counterparty_id.to_string(), rejected);
    }

    pub fn clear(&mut self, counterparty_id: &str) {
        self.pending_requests.remove(counterparty_id);
        self.accepted_requests.remove(counterparty_id);
        self.rejected_therapists.remove(counterparty_id);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    None,
    Pending,
    Accepted,
    Rejected,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::None => write!(f, "none"),
            StatusKind::Pending => write!(f, "pending"),
            StatusKind::Accepted => write!(f, "accepted"),
            StatusKind::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TherapistStatus {
    None,
    Pending(PendingRequest),
    Accepted(AcceptedRequest),
    Rejected(RejectedTherapist),
}

impl TherapistStatus {
    pub fn kind(&self) -> StatusKind {
        match self {
            TherapistStatus::None => StatusKind::None,
            TherapistStatus::Pending(_) => StatusKind::Pending,
            TherapistStatus::Accepted(_) => StatusKind::Accepted,
            TherapistStatus::Rejected(_) => StatusKind::Rejected,
        }
    }

    /// A new request is allowed from `None` and `Rejected` only.
    pub fn allows_new_request(&self) -> bool {
        matches!(self, TherapistStatus::None | TherapistStatus::Rejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_setters_keep_entries_exclusive() {
        let mut map = StatusMap::default();
        map.set_rejected("t1", RejectedTherapist { timestamp: at(8), reason: "busy".into() });
        map.set_pending(
            "t1",
            PendingRequest { request_id: "n2".into(), timestamp: at(9), therapist_name: "Dr. Rao".into() },
        );

        assert_eq!(map.len(), 1);
        assert_eq!(map.status_of("t1").kind(), StatusKind::Pending);
        assert_eq!(map.status_of("t2").kind(), StatusKind::None);
    }

    #[test]
    fn test_cache_format_round_trips_timestamps_as_strings() {
        let mut map = StatusMap::default();
        map.set_accepted(
            "t1",
            AcceptedRequest {
                appointment_time: at(10),
                end_time: at(11),
                therapist_name: "Dr. Rao".into(),
                confirmed: true,
            },
        );

        let raw = serde_json::to_string(&map).unwrap();
        assert!(raw.contains("\"acceptedRequests\""));
        assert!(raw.contains("2026-03-01T10:00:00Z"));

        let parsed: StatusMap = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn test_missing_maps_default_to_empty() {
        let parsed: StatusMap = serde_json::from_str(r#"{"pendingRequests":{}}"#).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_new_request_allowed_only_from_none_or_rejected() {
        assert!(TherapistStatus::None.allows_new_request());
        assert!(TherapistStatus::Rejected(RejectedTherapist { timestamp: at(8), reason: "x".into() })
            .allows_new_request());
        assert!(!TherapistStatus::Pending(PendingRequest {
            request_id: "n1".into(),
            timestamp: at(8),
            therapist_name: "Dr. Rao".into(),
        })
        .allows_new_request());
    }
}
