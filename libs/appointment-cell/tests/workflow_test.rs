use assert_matches::assert_matches;
use async_trait::async_trait;
use chrono::Duration;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use appointment_cell::*;
use shared_database::{
    Collection, Document, DocumentStore, Fields, InMemoryStore, Query, RetryPolicy, StoreResult,
    Subscription,
};
use shared_models::*;
use shared_utils::test_utils::{test_clock, test_epoch, TestConfig, TestUser};
use shared_utils::ManualClock;

struct Fixture {
    store: InMemoryStore,
    clock: ManualClock,
    workflow: AppointmentRequestWorkflow,
    client: Session,
    therapist: Session,
}

fn fixture() -> Fixture {
    let clock = test_clock();
    let store = InMemoryStore::new(Arc::new(clock.clone()));
    let workflow = AppointmentRequestWorkflow::new(
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        &TestConfig::default().to_app_config(),
    );

    Fixture {
        store,
        clock,
        workflow,
        client: TestUser::client("Sam"),
        therapist: TestUser::therapist("Dr. Rao", UserType::Slp),
    }
}

/// Wraps the in-memory store so the next creates can fail outright or land
/// and then answer late.
struct ScriptedStore {
    inner: InMemoryStore,
    failing_creates: AtomicU32,
    late_creates: AtomicU32,
    creates: AtomicU32,
}

impl ScriptedStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failing_creates: AtomicU32::new(0),
            late_creates: AtomicU32::new(0),
            creates: AtomicU32::new(0),
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl DocumentStore for ScriptedStore {
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.inner.query(query).await
    }

    async fn subscribe(&self, query: Query) -> StoreResult<Subscription> {
        self.inner.subscribe(query).await
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StoreResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_creates) {
            return Err(AppError::Network("connection reset".into()));
        }
        let id = self.inner.create(collection, fields).await?;
        if take_one(&self.late_creates) {
            tokio::time::sleep(StdDuration::from_millis(300)).await;
        }
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> StoreResult<()> {
        self.inner.update(collection, id, fields).await
    }

    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        self.inner.get(collection, id).await
    }
}

fn scripted_workflow(f: &Fixture) -> (Arc<ScriptedStore>, AppointmentRequestWorkflow) {
    let store = Arc::new(ScriptedStore::new(f.store.clone()));
    let workflow = AppointmentRequestWorkflow::new(
        store.clone(),
        Arc::new(f.clock.clone()),
        &TestConfig::default().to_app_config(),
    )
    .with_retry_policy(RetryPolicy {
        max_attempts: 3,
        base_delay: StdDuration::from_millis(1),
        timeout: StdDuration::from_millis(50),
    });
    (store, workflow)
}

fn request_documents(store: &InMemoryStore) -> Vec<Document> {
    store
        .documents(Collection::Notifications)
        .into_iter()
        .filter(|doc| doc.data["type"] == "appointment_request")
        .collect()
}

async fn load_notification(store: &InMemoryStore, id: &str) -> Notification {
    store
        .get(Collection::Notifications, id)
        .await
        .unwrap()
        .expect("notification should exist")
        .into_typed()
        .unwrap()
}

#[tokio::test]
async fn test_submit_writes_request_with_snapshots() {
    let f = fixture();
    let profile = TestUser::profile_of(&f.therapist);

    let request_id = f
        .workflow
        .submit_request(&f.client, &profile, &TherapistStatus::None)
        .await
        .unwrap();

    let request = load_notification(&f.store, &request_id).await;
    assert_eq!(request.notification_type, NotificationType::AppointmentRequest);
    assert_eq!(request.recipient_id, f.therapist.user_id);
    assert_eq!(request.client_id, f.client.user_id);
    assert_eq!(request.status, ReadStatus::Unread);
    assert!(request.request_status.is_none());
    assert_eq!(request.created_at, Some(test_epoch()));
    assert_eq!(request.therapist.name.as_deref(), Some("Dr. Rao"));
    assert_eq!(request.therapist.expertise.as_deref(), Some("Child Language Disorder"));
    assert_eq!(request.client.complaint.as_deref(), Some("Stuttering"));
    assert_eq!(request.sender_type, Some(UserType::Client));
}

#[tokio::test]
async fn test_submit_refuses_duplicates_without_writing() {
    let f = fixture();
    let profile = TestUser::profile_of(&f.therapist);
    let pending = TherapistStatus::Pending(PendingRequest {
        request_id: "notifications-000001".into(),
        timestamp: test_epoch(),
        therapist_name: "Dr. Rao".into(),
    });

    let result = f.workflow.submit_request(&f.client, &profile, &pending).await;

    assert_matches!(result, Err(AppointmentError::DuplicateRequest(StatusKind::Pending)));
    assert_eq!(f.store.write_count(), 0);
}

#[tokio::test]
async fn test_only_clients_can_submit() {
    let f = fixture();
    let other = TestUser::therapist("Dr. Iyer", UserType::Audiologist);

    let result = f
        .workflow
        .submit_request(&f.therapist, &TestUser::profile_of(&other), &TherapistStatus::None)
        .await;

    assert_matches!(result, Err(AppointmentError::NotAClient));
    assert_eq!(f.store.write_count(), 0);
}

#[tokio::test]
async fn test_accept_fans_out_three_writes() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    let start = test_epoch() + Duration::days(1);
    let end = start + Duration::minutes(45);
    let outcome = f
        .workflow
        .accept_request(&f.therapist, &request_id, start, end)
        .await
        .unwrap();

    assert!(!outcome.resumed);
    assert_eq!(f.store.write_count(), 4);

    let request = load_notification(&f.store, &request_id).await;
    assert_eq!(request.request_status, Some(RequestStatus::Accepted));
    assert_eq!(request.status, ReadStatus::Read);
    assert_eq!(request.scheduled_time, Some(start));
    assert_eq!(request.end_time, Some(end));

    let accepted = load_notification(&f.store, &outcome.notification_id).await;
    assert_eq!(accepted.notification_type, NotificationType::AppointmentAccepted);
    assert_eq!(accepted.recipient_id, f.client.user_id);
    assert_eq!(accepted.original_request_id.as_deref(), Some(request_id.as_str()));
    assert_eq!(accepted.client.name.as_deref(), Some("Sam"));

    let appointment: Appointment = f
        .store
        .get(Collection::Appointments, &outcome.appointment_id)
        .await
        .unwrap()
        .unwrap()
        .into_typed()
        .unwrap();
    assert_eq!(appointment.scheduled_time, start);
    assert_eq!(appointment.effective_end_time(), end);
    assert_eq!(appointment.client_id, f.client.user_id);
    assert_eq!(appointment.therapist.name.as_deref(), Some("Dr. Rao"));
}

#[tokio::test]
async fn test_accept_validates_before_writing() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();
    let writes = f.store.write_count();

    let start = test_epoch() + Duration::hours(3);
    assert_matches!(
        f.workflow.accept_request(&f.therapist, &request_id, start, start).await,
        Err(AppointmentError::InvalidTime(_))
    );

    f.clock.advance(Duration::hours(4));
    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
            .await,
        Err(AppointmentError::InvalidTime(_))
    );

    let stranger = TestUser::therapist("Dr. Iyer", UserType::Slp);
    let later = test_epoch() + Duration::days(2);
    assert_matches!(
        f.workflow
            .accept_request(&stranger, &request_id, later, later + Duration::hours(1))
            .await,
        Err(AppointmentError::Unauthorized)
    );

    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, "notifications-999999", later, later + Duration::hours(1))
            .await,
        Err(AppointmentError::NotFound(_))
    );

    assert_eq!(f.store.write_count(), writes);
}

#[tokio::test]
async fn test_partial_accept_reports_steps_and_resumes() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    f.store.fail_creates_in(
        Collection::Appointments,
        Some(AppError::PermissionDenied("appointments are read-only".into())),
    );

    let start = test_epoch() + Duration::days(1);
    let error = f
        .workflow
        .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
        .await
        .unwrap_err();

    assert_matches!(
        &error,
        AppointmentError::PartialWrite { completed, failed: WriteStep::CreateAppointment, .. }
            if completed == &vec![WriteStep::MarkRequest, WriteStep::NotifyClient]
    );
    assert!(error.is_permission());
    assert!(f.store.documents(Collection::Appointments).is_empty());

    f.store.fail_creates_in(Collection::Appointments, None);
    let writes = f.store.write_count();

    // Arguments differ, the slot recorded on the request wins.
    let outcome = f
        .workflow
        .accept_request(&f.therapist, &request_id, start + Duration::days(7), start + Duration::days(8))
        .await
        .unwrap();

    assert!(outcome.resumed);
    assert_eq!(f.store.write_count(), writes + 1);
    let appointments = f.store.documents(Collection::Appointments);
    assert_eq!(appointments.len(), 1);
    let appointment: Appointment = appointments[0].clone().into_typed().unwrap();
    assert_eq!(appointment.scheduled_time, start);

    let accepted_notifications = f
        .store
        .documents(Collection::Notifications)
        .into_iter()
        .filter(|doc| doc.data["type"] == "appointment_accepted")
        .count();
    assert_eq!(accepted_notifications, 1);
}

#[tokio::test]
async fn test_persistent_network_failure_is_reported() {
    let f = fixture();
    let profile = TestUser::profile_of(&f.therapist);

    f.store
        .fail_creates_in(Collection::Notifications, Some(AppError::Network("offline".into())));
    let result = f
        .workflow
        .submit_request(&f.client, &profile, &TherapistStatus::None)
        .await;

    assert_matches!(result, Err(AppointmentError::Store(AppError::Network(_))));
    assert!(f.store.documents(Collection::Notifications).is_empty());
}

#[tokio::test]
async fn test_reject_requires_reason_and_marks_request() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    assert_matches!(
        f.workflow.reject_request(&f.therapist, &request_id, "   ").await,
        Err(AppointmentError::ValidationError(_))
    );

    let outcome = f
        .workflow
        .reject_request(&f.therapist, &request_id, "Not taking new clients")
        .await
        .unwrap();

    let request = load_notification(&f.store, &request_id).await;
    assert_eq!(request.request_status, Some(RequestStatus::Rejected));
    assert_eq!(request.rejection_reason.as_deref(), Some("Not taking new clients"));

    let rejected = load_notification(&f.store, &outcome.notification_id).await;
    assert_eq!(rejected.notification_type, NotificationType::AppointmentRejected);
    assert_eq!(rejected.recipient_id, f.client.user_id);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Not taking new clients"));

    // Resolved the other way already.
    let start = test_epoch() + Duration::days(1);
    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
            .await,
        Err(AppointmentError::AlreadyResolved(RequestStatus::Rejected))
    );

    // Repeating the rejection writes nothing new.
    let writes = f.store.write_count();
    let again = f
        .workflow
        .reject_request(&f.therapist, &request_id, "ignored")
        .await
        .unwrap();
    assert!(again.resumed);
    assert_eq!(again.notification_id, outcome.notification_id);
    assert_eq!(f.store.write_count(), writes);
}

#[tokio::test]
async fn test_counter_notifications_cannot_be_accepted() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();
    let outcome = f
        .workflow
        .reject_request(&f.therapist, &request_id, "Fully booked")
        .await
        .unwrap();

    let start = test_epoch() + Duration::days(1);
    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, &outcome.notification_id, start, start + Duration::hours(1))
            .await,
        Err(AppointmentError::NotAppointmentRequest(_))
    );
}

#[tokio::test]
async fn test_submit_succeeds_after_a_transient_failure() {
    let f = fixture();
    let (store, workflow) = scripted_workflow(&f);
    store.failing_creates.store(1, Ordering::SeqCst);

    let request_id = workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    assert_eq!(store.creates.load(Ordering::SeqCst), 2);
    let requests = request_documents(&f.store);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id, request_id);
}

#[tokio::test]
async fn test_late_create_reply_does_not_duplicate_request() {
    let f = fixture();
    let (store, workflow) = scripted_workflow(&f);
    store.late_creates.store(1, Ordering::SeqCst);

    let request_id = workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    // The timed-out create landed, the retry finds it instead of writing again.
    assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    let requests = request_documents(&f.store);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id, request_id);
}

#[tokio::test]
async fn test_invalid_arguments_are_refused_while_offline() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();
    let writes = f.store.write_count();
    f.store.fail_queries(Some(AppError::Network("offline".into())));

    let start = test_epoch() + Duration::days(1);
    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, &request_id, start, start - Duration::hours(1))
            .await,
        Err(AppointmentError::InvalidTime(_))
    );
    assert_matches!(
        f.workflow
            .accept_request(
                &f.therapist,
                &request_id,
                test_epoch() - Duration::hours(2),
                test_epoch() - Duration::hours(1)
            )
            .await,
        Err(AppointmentError::InvalidTime(_))
    );
    assert_matches!(
        f.workflow.reject_request(&f.therapist, &request_id, "  ").await,
        Err(AppointmentError::ValidationError(_))
    );

    // Valid arguments do reach the store.
    assert_matches!(
        f.workflow
            .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
            .await,
        Err(AppointmentError::Store(AppError::Network(_)))
    );
    assert_eq!(f.store.write_count(), writes);
}

#[tokio::test]
async fn test_failed_first_step_is_a_plain_store_error() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();
    let writes = f.store.write_count();

    f.store.fail_updates_in(
        Collection::Notifications,
        Some(AppError::PermissionDenied("notifications are read-only".into())),
    );

    let start = test_epoch() + Duration::days(1);
    let error = f
        .workflow
        .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
        .await
        .unwrap_err();

    assert_matches!(&error, AppointmentError::Store(AppError::PermissionDenied(_)));
    assert!(error.is_permission());
    assert_eq!(f.store.write_count(), writes);
    let request = load_notification(&f.store, &request_id).await;
    assert!(request.request_status.is_none());

    // Once writable again the request is still open for a fresh accept.
    f.store.fail_updates_in(Collection::Notifications, None);
    let outcome = f
        .workflow
        .accept_request(&f.therapist, &request_id, start, start + Duration::hours(1))
        .await
        .unwrap();
    assert!(!outcome.resumed);
}

#[tokio::test]
async fn test_partial_reject_reports_step_and_resumes() {
    let f = fixture();
    let request_id = f
        .workflow
        .submit_request(&f.client, &TestUser::profile_of(&f.therapist), &TherapistStatus::None)
        .await
        .unwrap();

    f.store.fail_creates_in(
        Collection::Notifications,
        Some(AppError::PermissionDenied("notifications are read-only".into())),
    );

    let error = f
        .workflow
        .reject_request(&f.therapist, &request_id, "Fully booked")
        .await
        .unwrap_err();

    assert_matches!(
        &error,
        AppointmentError::PartialWrite { completed, failed: WriteStep::NotifyClient, .. }
            if completed == &vec![WriteStep::MarkRequest]
    );
    let request = load_notification(&f.store, &request_id).await;
    assert_eq!(request.request_status, Some(RequestStatus::Rejected));

    f.store.fail_creates_in(Collection::Notifications, None);
    let writes = f.store.write_count();

    // The reason recorded on the request wins over the new one.
    let outcome = f
        .workflow
        .reject_request(&f.therapist, &request_id, "Try again next month")
        .await
        .unwrap();

    assert!(outcome.resumed);
    assert_eq!(f.store.write_count(), writes + 1);
    let rejected = load_notification(&f.store, &outcome.notification_id).await;
    assert_eq!(rejected.notification_type, NotificationType::AppointmentRejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Fully booked"));
    assert_eq!(rejected.original_request_id.as_deref(), Some(request_id.as_str()));
}
