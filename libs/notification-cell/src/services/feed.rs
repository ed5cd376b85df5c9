use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared_config::AppConfig;
use shared_database::{
    Collection, Direction, Document, DocumentStore, Fields, Filter, Query, RetryPolicy, Subscription,
};
use shared_models::{AppError, Notification, ReadStatus, Session};
use shared_utils::Clock;

/// Live list of the notifications addressed to one user, newest first.
pub struct NotificationFeed {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    session: Session,
    retry: RetryPolicy,
    notifications: Arc<RwLock<Vec<Notification>>>,
    changes: watch::Sender<Vec<Notification>>,
    listener: JoinHandle<()>,
}

impl NotificationFeed {
    pub fn query_for(session: &Session) -> Query {
        Query::new(Collection::Notifications)
            .filter(Filter::eq("recipientId", session.user_id.as_str()))
            .order_by("createdAt", Direction::Descending)
    }

    /// Opens the listener and waits for the first result set.
    pub async fn subscribe(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        session: Session,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let mut subscription = store.subscribe(Self::query_for(&session)).await?;

        let initial = match subscription.next_snapshot().await {
            Some(Ok(documents)) => sort_newest_first(parse_notifications(documents), clock.as_ref()),
            Some(Err(e)) => return Err(e),
            None => Vec::new(),
        };
        info!("Notification feed for {} opened with {} entries", session.user_id, initial.len());

        let notifications = Arc::new(RwLock::new(initial.clone()));
        let (changes, _) = watch::channel(initial);

        let listener = tokio::spawn(listen(
            subscription,
            notifications.clone(),
            changes.clone(),
            clock.clone(),
        ));

        Ok(Self {
            store,
            clock,
            session,
            retry: RetryPolicy::from_config(config),
            notifications,
            changes,
            listener,
        })
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    pub async fn unread_count(&self) -> usize {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| n.is_unread())
            .count()
    }

    pub fn changes(&self) -> watch::Receiver<Vec<Notification>> {
        self.changes.subscribe()
    }

    pub async fn mark_as_read(&self, notification_id: &str) -> Result<(), AppError> {
        let fields = Fields::new()
            .set("status", "read")
            .server_timestamp("updatedAt");
        self.retry
            .run("mark notification read", || {
                self.store
                    .update(Collection::Notifications, notification_id, fields.clone())
            })
            .await?;

        let mut notifications = self.notifications.write().await;
        if let Some(notification) = notifications.iter_mut().find(|n| n.id == notification_id) {
            notification.status = ReadStatus::Read;
        }
        self.changes.send_replace(notifications.clone());
        Ok(())
    }

    /// Marks every unread entry read. All entries are attempted, the first
    /// failure is returned after that.
    pub async fn mark_all_as_read(&self) -> Result<usize, AppError> {
        let unread: Vec<String> = self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.is_unread())
            .map(|n| n.id.clone())
            .collect();

        let mut marked = 0;
        let mut first_error = None;
        for id in &unread {
            match self.mark_as_read(id).await {
                Ok(()) => marked += 1,
                Err(e) => {
                    warn!("Failed to mark notification {} read: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Marked {} notifications read for {}", marked, self.session.user_id);
                Ok(marked)
            }
        }
    }

    /// One-shot re-query. The last list stays in place on failure.
    pub async fn refresh(&self) -> Result<Vec<Notification>, AppError> {
        let documents = self.store.query(&Self::query_for(&self.session)).await?;
        let fresh = sort_newest_first(parse_notifications(documents), self.clock.as_ref());

        *self.notifications.write().await = fresh.clone();
        self.changes.send_replace(fresh.clone());
        Ok(fresh)
    }

    /// Releases the listener.
    pub fn unsubscribe(self) {}
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    mut subscription: Subscription,
    notifications: Arc<RwLock<Vec<Notification>>>,
    changes: watch::Sender<Vec<Notification>>,
    clock: Arc<dyn Clock>,
) {
    while let Some(snapshot) = subscription.next_snapshot().await {
        match snapshot {
            Ok(documents) => {
                let fresh = sort_newest_first(parse_notifications(documents), clock.as_ref());
                *notifications.write().await = fresh.clone();
                changes.send_replace(fresh);
            }
            Err(e) => warn!("Notification listener error, keeping last list: {}", e),
        }
    }
}

fn parse_notifications(documents: Vec<Document>) -> Vec<Notification> {
    documents
        .into_iter()
        .filter_map(|doc| {
            let id = doc.id.clone();
            match doc.into_typed::<Notification>() {
                Ok(notification) => Some(notification),
                Err(e) => {
                    debug!("Skipping notification {} the feed cannot show: {}", id, e);
                    None
                }
            }
        })
        .collect()
}

/// `createdAt` descending, then id descending. Entries still waiting for a
/// server timestamp sort as the newest.
fn sort_newest_first(mut notifications: Vec<Notification>, clock: &dyn Clock) -> Vec<Notification> {
    let now = clock.now();
    notifications.sort_by(|a, b| {
        (b.effective_created_at(now), &b.id).cmp(&(a.effective_created_at(now), &a.id))
    });
    notifications
}
