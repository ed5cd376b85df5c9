//! End-to-end booking flows across a client device and a therapist device
//! sharing one store.

use assert_matches::assert_matches;
use chrono::Duration;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tempfile::TempDir;

use appointment_cell::{AppointmentDirectory, AppointmentError, BookingCoordinator};
use notification_cell::NotificationFeed;
use shared_config::AppConfig;
use shared_database::{Collection, InMemoryStore};
use shared_models::{
    NotificationType, RequestStatus, Session, StatusKind, TherapistProfile, TherapistStatus, UserType,
};
use shared_utils::test_utils::{test_clock, test_epoch, TestConfig, TestUser};
use shared_utils::ManualClock;
use status_cache_cell::{FileKeyValueStore, StatusCache};

struct Device {
    session: Session,
    coordinator: BookingCoordinator,
    feed: NotificationFeed,
    cache: StatusCache,
    _cache_dir: TempDir,
}

struct World {
    store: InMemoryStore,
    clock: ManualClock,
    config: AppConfig,
}

impl World {
    fn new() -> Self {
        let clock = test_clock();
        Self {
            store: InMemoryStore::new(Arc::new(clock.clone())),
            clock,
            config: TestConfig::default().to_app_config(),
        }
    }

    async fn device(&self, session: Session) -> Device {
        let cache_dir = TempDir::new().unwrap();
        let cache = StatusCache::new(Arc::new(FileKeyValueStore::new(cache_dir.path())));
        let coordinator = BookingCoordinator::new(
            session.clone(),
            Arc::new(self.store.clone()),
            cache.clone(),
            Arc::new(self.clock.clone()),
            &self.config,
        );
        let feed = NotificationFeed::subscribe(
            Arc::new(self.store.clone()),
            Arc::new(self.clock.clone()),
            session.clone(),
            &self.config,
        )
        .await
        .unwrap();

        Device {
            session,
            coordinator,
            feed,
            cache,
            _cache_dir: cache_dir,
        }
    }
}

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(100)).await;
}

fn directory_entry(therapist: &Session) -> TherapistProfile {
    TestUser::profile_of(therapist)
}

#[tokio::test]
async fn test_request_accept_and_expiry_on_both_devices() {
    let world = World::new();
    let client = world.device(TestUser::client("Sam")).await;
    let therapist = world.device(TestUser::therapist("Dr. Rao", UserType::Slp)).await;
    let therapist_id = therapist.session.user_id.clone();
    let client_id = client.session.user_id.clone();

    // Client applies.
    let request_id = client
        .coordinator
        .submit_request(&directory_entry(&therapist.session))
        .await
        .unwrap();
    assert_eq!(client.coordinator.status(&therapist_id).await.kind(), StatusKind::Pending);

    // The therapist sees the request in their feed.
    settle().await;
    let inbox = therapist.feed.notifications().await;
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].id, request_id);
    assert_eq!(inbox[0].client.name.as_deref(), Some("Sam"));
    assert_eq!(therapist.feed.unread_count().await, 1);

    therapist.coordinator.refresh().await.unwrap();
    assert_eq!(therapist.coordinator.status(&client_id).await.kind(), StatusKind::Pending);

    // Therapist accepts for tomorrow.
    let start = test_epoch() + Duration::days(1);
    let end = start + Duration::hours(1);
    let outcome = therapist
        .coordinator
        .accept_request(&request_id, start, end)
        .await
        .unwrap();
    assert!(!outcome.resumed);

    // Client side: feed shows the acceptance, status is a confirmed booking.
    settle().await;
    let client_inbox = client.feed.notifications().await;
    assert_eq!(client_inbox.len(), 1);
    assert_eq!(client_inbox[0].notification_type, NotificationType::AppointmentAccepted);
    assert_eq!(client_inbox[0].original_request_id.as_deref(), Some(request_id.as_str()));

    client.coordinator.refresh().await.unwrap();
    assert_matches!(
        client.coordinator.status(&therapist_id).await,
        TherapistStatus::Accepted(a) if a.confirmed && a.appointment_time == start && a.end_time == end
    );
    assert_eq!(therapist.coordinator.status(&client_id).await.kind(), StatusKind::Accepted);

    // A second request is refused while the appointment is active.
    assert_matches!(
        client
            .coordinator
            .submit_request(&directory_entry(&therapist.session))
            .await,
        Err(AppointmentError::DuplicateRequest(StatusKind::Accepted))
    );

    let directory = AppointmentDirectory::new(Arc::new(world.store.clone()), Arc::new(world.clock.clone()));
    assert_eq!(directory.upcoming(&client.session).await.unwrap().len(), 1);
    assert_eq!(directory.upcoming(&therapist.session).await.unwrap().len(), 1);

    // The cache holds the accepted state across restarts.
    let cached = client.cache.load(&client_id).await;
    assert_eq!(cached.status_of(&therapist_id).kind(), StatusKind::Accepted);

    // After the slot is over both devices fall back to no relationship.
    world.clock.advance(Duration::days(2));
    client.coordinator.refresh().await.unwrap();
    therapist.coordinator.refresh().await.unwrap();

    assert_eq!(client.coordinator.status(&therapist_id).await, TherapistStatus::None);
    assert_eq!(therapist.coordinator.status(&client_id).await, TherapistStatus::None);
    assert!(directory.upcoming(&client.session).await.unwrap().is_empty());
    assert!(client.cache.load(&client_id).await.is_empty());
}

#[tokio::test]
async fn test_rejection_then_reapply_keeps_history() {
    let world = World::new();
    let client = world.device(TestUser::client("Sam")).await;
    let therapist = world.device(TestUser::therapist("Dr. Iyer", UserType::Audiologist)).await;
    let therapist_id = therapist.session.user_id.clone();
    let entry = directory_entry(&therapist.session);

    let watch = client.coordinator.watch().await.unwrap();

    let first = client.coordinator.submit_request(&entry).await.unwrap();
    therapist
        .coordinator
        .reject_request(&first, "Not taking new clients this month")
        .await
        .unwrap();

    // The listener picks up the rejection without an explicit refresh.
    let mut rejected = false;
    for _ in 0..100 {
        if let TherapistStatus::Rejected(r) = client.coordinator.status(&therapist_id).await {
            assert_eq!(r.reason, "Not taking new clients this month");
            rejected = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    assert!(rejected, "client never saw the rejection");

    // Rejection does not block a new request.
    world.clock.advance(Duration::minutes(10));
    let second = client.coordinator.submit_request(&entry).await.unwrap();
    assert_ne!(first, second);
    settle().await;
    assert_matches!(
        client.coordinator.status(&therapist_id).await,
        TherapistStatus::Pending(p) if p.request_id == second
    );

    // The first lifecycle is kept as history.
    let notifications = world.store.documents(Collection::Notifications);
    assert_eq!(notifications.len(), 3);
    let first_request = notifications.iter().find(|doc| doc.id == first).unwrap();
    assert_eq!(first_request.data["requestStatus"], RequestStatus::Rejected.to_string());

    // Therapist inbox: only the two requests, newest first.
    settle().await;
    let inbox: Vec<String> = therapist.feed.notifications().await.into_iter().map(|n| n.id).collect();
    assert_eq!(inbox, vec![second.clone(), first.clone()]);
    assert_eq!(therapist.feed.mark_all_as_read().await.unwrap(), 1);
    assert_eq!(therapist.feed.unread_count().await, 0);

    // The second request can be accepted normally.
    let start = test_epoch() + Duration::days(3);
    therapist
        .coordinator
        .accept_request(&second, start, start + Duration::hours(1))
        .await
        .unwrap();
    settle().await;
    assert_eq!(client.coordinator.status(&therapist_id).await.kind(), StatusKind::Accepted);

    watch.stop();
}
