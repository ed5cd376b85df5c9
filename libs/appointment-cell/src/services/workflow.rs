use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use shared_config::AppConfig;
use shared_database::{Collection, DocumentStore, Fields, Filter, Query, RetryPolicy};
use shared_models::{
    AppError, Appointment, AppointmentStatus, ClientSnapshot, Notification, NotificationType,
    ReadStatus, RequestStatus, Session, TherapistProfile, TherapistStatus,
};
use shared_utils::Clock;

use crate::models::{AcceptOutcome, AppointmentError, RejectOutcome, WriteStep};
use crate::services::lifecycle::{RequestLifecycleService, Resolution};

fn timestamp(instant: DateTime<Utc>) -> Value {
    Value::String(instant.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// A failed step with nothing before it is a plain store error, anything else
/// is reported as a partial write.
fn step_failed(completed: &[WriteStep], failed: WriteStep, source: AppError) -> AppointmentError {
    if completed.is_empty() {
        AppointmentError::Store(source)
    } else {
        warn!(
            "Fan-out stopped at {} after {} completed steps: {}",
            failed,
            completed.len(),
            source
        );
        AppointmentError::PartialWrite {
            completed: completed.to_vec(),
            failed,
            source,
        }
    }
}

/// Request, accept and reject writes. Every transition is a sequence of
/// independent document writes, there are no multi-document transactions.
#[derive(Clone)]
pub struct AppointmentRequestWorkflow {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    lifecycle: RequestLifecycleService,
}

impl AppointmentRequestWorkflow {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: &AppConfig) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::from_config(config),
            lifecycle: RequestLifecycleService::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Writes one `appointment_request` notification addressed to the
    /// therapist. `current` is the locally known status for that therapist.
    #[instrument(skip(self, client, therapist, current), fields(client = %client.user_id, therapist = %therapist.id))]
    pub async fn submit_request(
        &self,
        client: &Session,
        therapist: &TherapistProfile,
        current: &TherapistStatus,
    ) -> Result<String, AppointmentError> {
        if !client.is_client() {
            return Err(AppointmentError::NotAClient);
        }
        if therapist.id.is_empty() {
            return Err(AppointmentError::ValidationError(
                "therapist id is required".to_string(),
            ));
        }
        if !current.allows_new_request() {
            debug!("Refusing duplicate request, status is {}", current.kind());
            return Err(AppointmentError::DuplicateRequest(current.kind()));
        }

        let request = Notification {
            id: String::new(),
            notification_type: NotificationType::AppointmentRequest,
            sender_id: client.user_id.clone(),
            sender_name: Some(client.display_name().to_string()),
            sender_type: Some(client.user_type),
            recipient_id: therapist.id.clone(),
            therapist_id: therapist.id.clone(),
            client_id: client.user_id.clone(),
            status: ReadStatus::Unread,
            request_status: None,
            scheduled_time: None,
            end_time: None,
            rejection_reason: None,
            message: Some(format!(
                "{} has requested an appointment with you",
                client.display_name()
            )),
            original_request_id: None,
            therapist: therapist.snapshot(),
            client: ClientSnapshot {
                name: Some(client.display_name().to_string()),
                age: client.profile.age.clone(),
                gender: client.profile.gender.clone(),
                complaint: client.profile.complaint.clone(),
                profile_image: client.profile.profile_image_url.clone(),
            },
            created_at: None,
            updated_at: None,
        };
        let fields = Fields::from_serializable(&request)?.server_timestamp("createdAt");

        // A create that timed out may still have landed. Before sending it
        // again, look for the open request it would have written.
        let retrying = AtomicBool::new(false);
        let (retrying, fields) = (&retrying, &fields);
        let request_id = self
            .retry
            .run("create appointment request", || async move {
                if retrying.swap(true, Ordering::SeqCst) {
                    if let Some(existing) = self
                        .find_open_request(&client.user_id, &therapist.id)
                        .await?
                    {
                        warn!("Earlier attempt already wrote request {}", existing);
                        return Ok(existing);
                    }
                }
                self.store
                    .create(Collection::Notifications, fields.clone())
                    .await
            })
            .await?;

        info!("Appointment request {} sent to {}", request_id, therapist.id);
        Ok(request_id)
    }

    /// Accepts a pending request: marks the request, notifies the client and
    /// creates the appointment. Calling it again on a request already marked
    /// accepted performs only the writes that are still missing.
    #[instrument(skip(self, therapist), fields(therapist = %therapist.user_id))]
    pub async fn accept_request(
        &self,
        therapist: &Session,
        request_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AcceptOutcome, AppointmentError> {
        self.lifecycle.validate_slot(start, end, self.clock.now())?;

        let request = self.load_request(request_id).await?;
        let resolution = self
            .lifecycle
            .check_resolution(therapist, &request, RequestStatus::Accepted)?;

        let (start, end) = match resolution {
            Resolution::Fresh => (start, end),
            // The slot already recorded on the request wins.
            Resolution::Resume => (
                request.scheduled_time.unwrap_or(start),
                request.end_time.unwrap_or(end),
            ),
        };

        let mut completed = Vec::new();

        match resolution {
            Resolution::Fresh => {
                let fields = Fields::new()
                    .set("status", "read")
                    .set("requestStatus", RequestStatus::Accepted.to_string())
                    .set("scheduledTime", timestamp(start))
                    .set("endTime", timestamp(end))
                    .server_timestamp("updatedAt");
                self.retry
                    .run("mark request accepted", || {
                        self.store
                            .update(Collection::Notifications, request_id, fields.clone())
                    })
                    .await
                    .map_err(|e| step_failed(&completed, WriteStep::MarkRequest, e))?;
            }
            Resolution::Resume => {}
        }
        completed.push(WriteStep::MarkRequest);

        let notification_id = match self
            .find_counter_notification(request_id, NotificationType::AppointmentAccepted)
            .await
            .map_err(|e| step_failed(&completed, WriteStep::NotifyClient, e))?
        {
            Some(existing) => existing,
            None => {
                let accepted = self.counter_notification(
                    therapist,
                    &request,
                    NotificationType::AppointmentAccepted,
                    |n| {
                        n.scheduled_time = Some(start);
                        n.end_time = Some(end);
                        n.message = Some(format!(
                            "{} has accepted your appointment request",
                            n.therapist_display_name()
                        ));
                    },
                );
                let fields = Fields::from_serializable(&accepted)?.server_timestamp("createdAt");
                self.retry
                    .run("notify client of acceptance", || {
                        self.store.create(Collection::Notifications, fields.clone())
                    })
                    .await
                    .map_err(|e| step_failed(&completed, WriteStep::NotifyClient, e))?
            }
        };
        completed.push(WriteStep::NotifyClient);

        let appointment_id = match self
            .find_by_original_request(Collection::Appointments, request_id, None)
            .await
            .map_err(|e| step_failed(&completed, WriteStep::CreateAppointment, e))?
        {
            Some(existing) => existing,
            None => {
                let appointment = Appointment {
                    id: String::new(),
                    therapist_id: request.therapist_id.clone(),
                    client_id: request.client_id.clone(),
                    scheduled_time: start,
                    end_time: Some(end),
                    status: AppointmentStatus::Scheduled,
                    original_request_id: Some(request.id.clone()),
                    therapist: request.therapist.clone(),
                    client: request.client.clone(),
                    created_at: None,
                    updated_at: None,
                };
                let fields = Fields::from_serializable(&appointment)?
                    .server_timestamp("createdAt")
                    .server_timestamp("updatedAt");
                self.retry
                    .run("create appointment", || {
                        self.store.create(Collection::Appointments, fields.clone())
                    })
                    .await
                    .map_err(|e| step_failed(&completed, WriteStep::CreateAppointment, e))?
            }
        };

        info!(
            "Request {} accepted, appointment {} at {}",
            request_id,
            appointment_id,
            start.to_rfc3339()
        );

        Ok(AcceptOutcome {
            request_id: request_id.to_string(),
            notification_id,
            appointment_id,
            resumed: resolution == Resolution::Resume,
        })
    }

    /// Rejects a pending request with a reason shown to the client.
    #[instrument(skip(self, therapist, reason), fields(therapist = %therapist.user_id))]
    pub async fn reject_request(
        &self,
        therapist: &Session,
        request_id: &str,
        reason: &str,
    ) -> Result<RejectOutcome, AppointmentError> {
        let reason = self.lifecycle.validate_rejection_reason(reason)?;

        let request = self.load_request(request_id).await?;
        let resolution = self
            .lifecycle
            .check_resolution(therapist, &request, RequestStatus::Rejected)?;

        let reason = match resolution {
            Resolution::Fresh => reason,
            Resolution::Resume => request.rejection_reason.clone().unwrap_or(reason),
        };

        let mut completed = Vec::new();

        if resolution == Resolution::Fresh {
            let fields = Fields::new()
                .set("status", "read")
                .set("requestStatus", RequestStatus::Rejected.to_string())
                .set("rejectionReason", reason.as_str())
                .server_timestamp("updatedAt");
            self.retry
                .run("mark request rejected", || {
                    self.store
                        .update(Collection::Notifications, request_id, fields.clone())
                })
                .await
                .map_err(|e| step_failed(&completed, WriteStep::MarkRequest, e))?;
        }
        completed.push(WriteStep::MarkRequest);

        let notification_id = match self
            .find_counter_notification(request_id, NotificationType::AppointmentRejected)
            .await
            .map_err(|e| step_failed(&completed, WriteStep::NotifyClient, e))?
        {
            Some(existing) => existing,
            None => {
                let rejected = self.counter_notification(
                    therapist,
                    &request,
                    NotificationType::AppointmentRejected,
                    |n| {
                        n.rejection_reason = Some(reason.clone());
                        n.message = Some(format!(
                            "{} has declined your appointment request",
                            n.therapist_display_name()
                        ));
                    },
                );
                let fields = Fields::from_serializable(&rejected)?.server_timestamp("createdAt");
                self.retry
                    .run("notify client of rejection", || {
                        self.store.create(Collection::Notifications, fields.clone())
                    })
                    .await
                    .map_err(|e| step_failed(&completed, WriteStep::NotifyClient, e))?
            }
        };

        info!("Request {} rejected", request_id);

        Ok(RejectOutcome {
            request_id: request_id.to_string(),
            notification_id,
            resumed: resolution == Resolution::Resume,
        })
    }

    async fn load_request(&self, request_id: &str) -> Result<Notification, AppointmentError> {
        let document = self
            .store
            .get(Collection::Notifications, request_id)
            .await?
            .ok_or_else(|| AppointmentError::NotFound(request_id.to_string()))?;
        Ok(document.into_typed::<Notification>()?)
    }

    /// An `appointment_request` from `client_id` to `therapist_id` that has
    /// not been resolved yet.
    async fn find_open_request(
        &self,
        client_id: &str,
        therapist_id: &str,
    ) -> Result<Option<String>, AppError> {
        let query = Query::new(Collection::Notifications)
            .filter(Filter::eq("clientId", client_id))
            .filter(Filter::eq("therapistId", therapist_id))
            .filter(Filter::eq("type", NotificationType::AppointmentRequest.as_str()));

        let documents = self.store.query(&query).await?;
        Ok(documents
            .into_iter()
            .find(|doc| doc.data.get("requestStatus").map_or(true, Value::is_null))
            .map(|doc| doc.id))
    }

    fn counter_notification(
        &self,
        therapist: &Session,
        request: &Notification,
        kind: NotificationType,
        customize: impl FnOnce(&mut Notification),
    ) -> Notification {
        let mut notification = Notification {
            id: String::new(),
            notification_type: kind,
            sender_id: therapist.user_id.clone(),
            sender_name: therapist
                .profile
                .name
                .clone()
                .or_else(|| request.therapist.name.clone()),
            sender_type: Some(therapist.user_type),
            recipient_id: request.client_id.clone(),
            therapist_id: request.therapist_id.clone(),
            client_id: request.client_id.clone(),
            status: ReadStatus::Unread,
            request_status: None,
            scheduled_time: None,
            end_time: None,
            rejection_reason: None,
            message: None,
            original_request_id: Some(request.id.clone()),
            therapist: request.therapist.clone(),
            client: request.client.clone(),
            created_at: None,
            updated_at: None,
        };
        customize(&mut notification);
        notification
    }

    async fn find_counter_notification(
        &self,
        request_id: &str,
        kind: NotificationType,
    ) -> Result<Option<String>, AppError> {
        self.find_by_original_request(Collection::Notifications, request_id, Some(kind))
            .await
    }

    async fn find_by_original_request(
        &self,
        collection: Collection,
        request_id: &str,
        kind: Option<NotificationType>,
    ) -> Result<Option<String>, AppError> {
        let mut query = Query::new(collection)
            .filter(Filter::eq("originalRequestId", request_id))
            .limit(1);
        if let Some(kind) = kind {
            query = query.filter(Filter::eq("type", kind.as_str()));
        }

        let documents = self
            .retry
            .run("look up earlier writes", || self.store.query(&query))
            .await?;
        Ok(documents.into_iter().next().map(|doc| doc.id))
    }
}
