use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared_config::AppConfig;
use shared_database::{Document, DocumentStore, Snapshot};
use shared_models::{AppError, PendingRequest, Session, StatusMap, TherapistProfile, TherapistStatus};
use shared_utils::Clock;
use status_cache_cell::StatusCache;

use crate::models::{AcceptOutcome, AppointmentError, RejectOutcome};
use crate::services::overlay::PendingOverlay;
use crate::services::reconciliation::ReconciliationEngine;
use crate::services::workflow::AppointmentRequestWorkflow;

#[derive(Default)]
struct CoordinatorState {
    reconciled: StatusMap,
    overlay: PendingOverlay,
}

struct CoordinatorInner {
    session: Session,
    store: Arc<dyn DocumentStore>,
    cache: StatusCache,
    clock: Arc<dyn Clock>,
    engine: ReconciliationEngine,
    workflow: AppointmentRequestWorkflow,
    recheck_delay: Duration,
    state: RwLock<CoordinatorState>,
    submitting: Mutex<()>,
    changes: watch::Sender<StatusMap>,
}

/// What the screens talk to. Owns the status map of one signed-in user and
/// keeps it in step with the store, the optimistic overlay and the cache.
#[derive(Clone)]
pub struct BookingCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl BookingCoordinator {
    pub fn new(
        session: Session,
        store: Arc<dyn DocumentStore>,
        cache: StatusCache,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        let (changes, _) = watch::channel(StatusMap::default());
        let engine = ReconciliationEngine::new(store.clone(), clock.clone());
        let workflow = AppointmentRequestWorkflow::new(store.clone(), clock.clone(), config);

        Self {
            inner: Arc::new(CoordinatorInner {
                session,
                store,
                cache,
                clock,
                engine,
                workflow,
                recheck_delay: config.reconcile_recheck_delay(),
                state: RwLock::new(CoordinatorState::default()),
                submitting: Mutex::new(()),
                changes,
            }),
        }
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Seeds the map from the cache so something can be shown before the
    /// first round-trip.
    pub async fn restore_cached(&self) -> StatusMap {
        let cached = self.inner.cache.load(&self.inner.session.user_id).await;
        let merged = {
            let mut state = self.inner.state.write().await;
            state.reconciled = cached;
            state.overlay.apply(&state.reconciled)
        };
        self.inner.changes.send_replace(merged.clone());
        merged
    }

    /// Status of one counterparty, optimistic entries included.
    pub async fn status(&self, counterparty_id: &str) -> TherapistStatus {
        let state = self.inner.state.read().await;
        state.overlay.apply(&state.reconciled).status_of(counterparty_id)
    }

    pub async fn status_map(&self) -> StatusMap {
        let state = self.inner.state.read().await;
        state.overlay.apply(&state.reconciled)
    }

    /// Latest merged map after every change.
    pub fn changes(&self) -> watch::Receiver<StatusMap> {
        self.inner.changes.subscribe()
    }

    pub async fn submit_request(&self, therapist: &TherapistProfile) -> Result<String, AppointmentError> {
        // One submit at a time so two taps cannot both pass the duplicate check.
        let _guard = self.inner.submitting.lock().await;

        let current = self.status(&therapist.id).await;
        let request_id = self
            .inner
            .workflow
            .submit_request(&self.inner.session, therapist, &current)
            .await?;

        let merged = {
            let mut state = self.inner.state.write().await;
            state.overlay.insert(
                &therapist.id,
                PendingRequest {
                    request_id: request_id.clone(),
                    timestamp: self.inner.clock.now(),
                    therapist_name: therapist
                        .name
                        .clone()
                        .unwrap_or_else(|| "Therapist".to_string()),
                },
            );
            state.overlay.apply(&state.reconciled)
        };
        self.publish(merged).await;
        self.schedule_recheck();

        Ok(request_id)
    }

    pub async fn accept_request(
        &self,
        request_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<AcceptOutcome, AppointmentError> {
        let outcome = self
            .inner
            .workflow
            .accept_request(&self.inner.session, request_id, start, end)
            .await?;
        self.refresh_quietly().await;
        Ok(outcome)
    }

    pub async fn reject_request(&self, request_id: &str, reason: &str) -> Result<RejectOutcome, AppointmentError> {
        let outcome = self
            .inner
            .workflow
            .reject_request(&self.inner.session, request_id, reason)
            .await?;
        self.refresh_quietly().await;
        Ok(outcome)
    }

    /// One reconciliation pass against the store. On failure the previous map
    /// stays in place and the error is returned.
    pub async fn refresh(&self) -> Result<StatusMap, AppError> {
        let mark = self.inner.state.read().await.overlay.generation();

        let reconciled = match self.inner.engine.reconcile(&self.inner.session).await {
            Ok(map) => map,
            Err(e) => {
                warn!("Reconciliation for {} failed, keeping previous statuses: {}", self.inner.session.user_id, e);
                return Err(e);
            }
        };

        let merged = {
            let mut state = self.inner.state.write().await;
            state.reconciled = reconciled;
            state.overlay.retire_through(mark);
            state.overlay.apply(&state.reconciled)
        };
        self.publish(merged.clone()).await;
        Ok(merged)
    }

    async fn refresh_quietly(&self) {
        if let Err(e) = self.refresh().await {
            debug!("Background refresh skipped: {}", e);
        }
    }

    /// Listens to both collections and recomputes on every change until the
    /// returned handle is dropped.
    pub async fn watch(&self) -> Result<StatusWatch, AppError> {
        let session = &self.inner.session;
        let mut notifications = self
            .inner
            .store
            .subscribe(ReconciliationEngine::notification_query(session))
            .await?;
        let mut appointments = self
            .inner
            .store
            .subscribe(ReconciliationEngine::appointment_query(session))
            .await?;

        let weak = Arc::downgrade(&self.inner);
        info!("Watching booking status for {}", session.user_id);

        let task = tokio::spawn(async move {
            let mut latest_notifications: Option<Vec<Document>> = None;
            let mut latest_appointments: Option<Vec<Document>> = None;

            loop {
                tokio::select! {
                    next = notifications.next_snapshot() => match next {
                        Some(snapshot) => fold_snapshot(&mut latest_notifications, snapshot),
                        None => break,
                    },
                    next = appointments.next_snapshot() => match next {
                        Some(snapshot) => fold_snapshot(&mut latest_appointments, snapshot),
                        None => break,
                    },
                }

                // Events already queued are folded into this pass.
                while let Some(snapshot) = notifications.try_next_snapshot() {
                    fold_snapshot(&mut latest_notifications, snapshot);
                }
                while let Some(snapshot) = appointments.try_next_snapshot() {
                    fold_snapshot(&mut latest_appointments, snapshot);
                }

                let (Some(notification_docs), Some(appointment_docs)) =
                    (&latest_notifications, &latest_appointments)
                else {
                    continue;
                };

                let Some(coordinator) = BookingCoordinator::upgrade(&weak) else {
                    break;
                };
                coordinator
                    .apply_snapshots(notification_docs.clone(), appointment_docs.clone())
                    .await;
            }
            debug!("Status watch ended");
        });

        Ok(StatusWatch { task })
    }

    async fn apply_snapshots(&self, notification_docs: Vec<Document>, appointment_docs: Vec<Document>) {
        let seen: HashSet<String> = notification_docs.iter().map(|doc| doc.id.clone()).collect();
        let reconciled = self
            .inner
            .engine
            .derive_from_documents(&self.inner.session, notification_docs, appointment_docs);

        let merged = {
            let mut state = self.inner.state.write().await;
            state.reconciled = reconciled;
            state.overlay.retire_seen(&seen);
            state.overlay.apply(&state.reconciled)
        };
        self.publish(merged).await;
    }

    async fn publish(&self, merged: StatusMap) {
        self.inner.cache.save(&self.inner.session.user_id, &merged).await;
        self.inner.changes.send_replace(merged);
    }

    fn schedule_recheck(&self) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.recheck_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(coordinator) = BookingCoordinator::upgrade(&weak) {
                if let Err(e) = coordinator.refresh().await {
                    warn!("Deferred reconciliation failed: {}", e);
                }
            }
        });
    }

    fn upgrade(weak: &Weak<CoordinatorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

fn fold_snapshot(latest: &mut Option<Vec<Document>>, snapshot: Snapshot) {
    match snapshot {
        Ok(documents) => *latest = Some(documents),
        Err(e) => warn!("Listener error, keeping last snapshot: {}", e),
    }
}

/// Live status updates. Dropping it stops the listeners.
pub struct StatusWatch {
    task: JoinHandle<()>,
}

impl StatusWatch {
    pub fn stop(self) {}

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for StatusWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
