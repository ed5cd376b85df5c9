use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use shared_database::{Collection, Direction, Document, DocumentStore, Filter, Query};
use shared_models::{
    AcceptedRequest, AppError, Appointment, Notification, NotificationType, PendingRequest,
    RejectedTherapist, Session, StatusMap,
};
use shared_utils::Clock;

use crate::models::Perspective;

const DEFAULT_REJECTION_REASON: &str = "Request rejected";

/// Rebuilds the per-counterparty status map from the store.
#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn notification_query(session: &Session) -> Query {
        let perspective = Perspective::of(session);
        Query::new(Collection::Notifications)
            .filter(Filter::eq(perspective.own_field(), session.user_id.as_str()))
            .filter(Filter::is_in(
                "type",
                NotificationType::lifecycle_types().map(|t| t.as_str()),
            ))
            .order_by("createdAt", Direction::Descending)
    }

    pub fn appointment_query(session: &Session) -> Query {
        let perspective = Perspective::of(session);
        Query::new(Collection::Appointments)
            .filter(Filter::eq(perspective.own_field(), session.user_id.as_str()))
    }

    /// Queries both collections and derives a fresh map. Nothing is cached
    /// here, a failed query leaves the caller's previous map untouched.
    pub async fn reconcile(&self, session: &Session) -> Result<StatusMap, AppError> {
        let notification_query = Self::notification_query(session);
        let appointment_query = Self::appointment_query(session);

        let (notification_docs, appointment_docs) = futures::try_join!(
            self.store.query(&notification_query),
            self.store.query(&appointment_query),
        )?;

        Ok(self.derive_from_documents(session, notification_docs, appointment_docs))
    }

    /// Same derivation over documents that were already fetched, e.g. from a
    /// listener snapshot.
    pub fn derive_from_documents(
        &self,
        session: &Session,
        notification_docs: Vec<Document>,
        appointment_docs: Vec<Document>,
    ) -> StatusMap {
        let notifications = parse_documents::<Notification>(notification_docs);
        let appointments = parse_documents::<Appointment>(appointment_docs);
        let map = derive_status_map(
            Perspective::of(session),
            &notifications,
            &appointments,
            self.clock.now(),
        );

        debug!(
            "Reconciled {} notifications and {} appointments into {} statuses for {}",
            notifications.len(),
            appointments.len(),
            map.len(),
            session.user_id
        );
        map
    }
}

fn parse_documents<T: serde::de::DeserializeOwned>(documents: Vec<Document>) -> Vec<T> {
    documents
        .into_iter()
        .filter_map(|doc| {
            let id = doc.id.clone();
            match doc.into_typed::<T>() {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    warn!("Skipping malformed document {}: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

/// Pure derivation of the status map.
///
/// Per counterparty only the most recently created notification counts (ties
/// go to the greater document id, unresolved timestamps count as `now`). An
/// active appointment overrides whatever the notifications say.
pub fn derive_status_map(
    perspective: Perspective,
    notifications: &[Notification],
    appointments: &[Appointment],
    now: DateTime<Utc>,
) -> StatusMap {
    let mut latest: HashMap<&str, &Notification> = HashMap::new();
    for notification in notifications {
        let counterparty = perspective.counterparty_id(notification);
        let newer = match latest.get(counterparty) {
            Some(current) => {
                let candidate_key = (notification.effective_created_at(now), notification.id.as_str());
                let current_key = (current.effective_created_at(now), current.id.as_str());
                candidate_key > current_key
            }
            None => true,
        };
        if newer {
            latest.insert(counterparty, notification);
        }
    }

    let mut map = StatusMap::default();

    for (counterparty, notification) in latest {
        match notification.notification_type {
            NotificationType::AppointmentRequest => map.set_pending(
                counterparty,
                PendingRequest {
                    request_id: notification.id.clone(),
                    timestamp: notification.effective_created_at(now),
                    therapist_name: perspective.counterparty_name(notification),
                },
            ),
            NotificationType::AppointmentAccepted => {
                // Acceptance seen before the appointment document: accepted but
                // unconfirmed until the slot is over.
                if let Some(end_time) = notification.slot_end().filter(|end| *end > now) {
                    let appointment_time = notification
                        .scheduled_time
                        .unwrap_or(end_time - shared_models::default_appointment_length());
                    map.set_accepted(
                        counterparty,
                        AcceptedRequest {
                            appointment_time,
                            end_time,
                            therapist_name: perspective.counterparty_name(notification),
                            confirmed: false,
                        },
                    );
                }
            }
            NotificationType::AppointmentRejected => map.set_rejected(
                counterparty,
                RejectedTherapist {
                    timestamp: notification.effective_created_at(now),
                    reason: notification
                        .rejection_reason
                        .clone()
                        .filter(|reason| !reason.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_REJECTION_REASON.to_string()),
                },
            ),
        }
    }

    let mut active: HashMap<&str, &Appointment> = HashMap::new();
    for appointment in appointments.iter().filter(|a| a.is_active(now)) {
        let counterparty = match perspective {
            Perspective::Client => appointment.therapist_id.as_str(),
            Perspective::Therapist => appointment.client_id.as_str(),
        };
        let later = match active.get(counterparty) {
            Some(current) => {
                (appointment.scheduled_time, appointment.id.as_str())
                    > (current.scheduled_time, current.id.as_str())
            }
            None => true,
        };
        if later {
            active.insert(counterparty, appointment);
        }
    }

    for (counterparty, appointment) in active {
        let name = match perspective {
            Perspective::Client => appointment.therapist_display_name(),
            Perspective::Therapist => appointment
                .client
                .name
                .clone()
                .unwrap_or_else(|| "Client".to_string()),
        };
        map.set_accepted(
            counterparty,
            AcceptedRequest {
                appointment_time: appointment.scheduled_time,
                end_time: appointment.effective_end_time(),
                therapist_name: name,
                confirmed: true,
            },
        );
    }

    map
}
