use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shared_models::AppError;
use shared_utils::clock::Clock;

use crate::store::{
    Collection, Document, DocumentStore, Fields, Query, Snapshot, StoreResult, Subscription,
};

struct Listener {
    query: Query,
    sender: mpsc::UnboundedSender<Snapshot>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<Collection, BTreeMap<String, Map<String, Value>>>,
    next_id: u64,
    listeners: HashMap<u64, Listener>,
    next_listener_id: u64,
    writes: u64,
    query_failure: Option<AppError>,
    create_failures: HashMap<Collection, AppError>,
    update_failures: HashMap<Collection, AppError>,
}

impl StoreState {
    fn snapshot(&self, query: &Query) -> Vec<Document> {
        let documents = self
            .collections
            .get(&query.collection)
            .into_iter()
            .flat_map(|docs| docs.iter())
            .map(|(id, data)| Document::new(id.clone(), data.clone()));
        query.apply(documents)
    }

    fn notify(&mut self, collection: Collection) {
        let mut closed = Vec::new();
        for (id, listener) in &self.listeners {
            if listener.query.collection != collection {
                continue;
            }
            if listener.sender.send(Ok(self.snapshot(&listener.query))).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }
}

/// Document store kept in process memory. Serves as the local backend and as
/// the store double in tests, with switchable failures per operation.
#[derive(Clone)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            clock,
        }
    }

    fn state(&self) -> StoreResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("in-memory store lock poisoned".to_string()))
    }

    /// Make every query (and new subscription) fail with `error` until cleared.
    pub fn fail_queries(&self, error: Option<AppError>) {
        if let Ok(mut state) = self.state() {
            state.query_failure = error;
        }
    }

    pub fn fail_creates_in(&self, collection: Collection, error: Option<AppError>) {
        if let Ok(mut state) = self.state() {
            match error {
                Some(error) => state.create_failures.insert(collection, error),
                None => state.create_failures.remove(&collection),
            };
        }
    }

    pub fn fail_updates_in(&self, collection: Collection, error: Option<AppError>) {
        if let Ok(mut state) = self.state() {
            match error {
                Some(error) => state.update_failures.insert(collection, error),
                None => state.update_failures.remove(&collection),
            };
        }
    }

    /// Number of successful creates and updates so far.
    pub fn write_count(&self) -> u64 {
        self.state().map(|s| s.writes).unwrap_or_default()
    }

    pub fn listener_count(&self) -> usize {
        self.state().map(|s| s.listeners.len()).unwrap_or_default()
    }

    pub fn documents(&self, collection: Collection) -> Vec<Document> {
        self.state()
            .map(|s| s.snapshot(&Query::new(collection)))
            .unwrap_or_default()
    }

    fn release_listener(state: &Weak<Mutex<StoreState>>, id: u64) {
        if let Some(state) = state.upgrade() {
            if let Ok(mut state) = state.lock() {
                state.listeners.remove(&id);
                debug!("Released in-memory listener {}", id);
            }
        }
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let state = self.state()?;
        if let Some(error) = &state.query_failure {
            return Err(error.clone());
        }
        Ok(state.snapshot(query))
    }

    async fn subscribe(&self, query: Query) -> StoreResult<Subscription> {
        let mut state = self.state()?;
        if let Some(error) = &state.query_failure {
            return Err(error.clone());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // Listeners fire once with the current result right away.
        let _ = sender.send(Ok(state.snapshot(&query)));

        let id = state.next_listener_id;
        state.next_listener_id += 1;
        state.listeners.insert(id, Listener { query, sender });

        let weak = Arc::downgrade(&self.state);
        Ok(Subscription::new(receiver, move || {
            InMemoryStore::release_listener(&weak, id)
        }))
    }

    async fn create(&self, collection: Collection, fields: Fields) -> StoreResult<String> {
        let now = self.clock.now();
        let mut state = self.state()?;
        if let Some(error) = state.create_failures.get(&collection) {
            warn!("Injected create failure on {}: {}", collection, error);
            return Err(error.clone());
        }

        state.next_id += 1;
        let id = format!("{}-{:06}", collection.as_str(), state.next_id);
        state
            .collections
            .entry(collection)
            .or_default()
            .insert(id.clone(), fields.resolve(now));
        state.writes += 1;
        state.notify(collection);

        debug!("Created {}/{}", collection, id);
        Ok(id)
    }

    async fn update(&self, collection: Collection, id: &str, fields: Fields) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state()?;
        if let Some(error) = state.update_failures.get(&collection) {
            warn!("Injected update failure on {}: {}", collection, error);
            return Err(error.clone());
        }

        let document = state
            .collections
            .get_mut(&collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| AppError::NotFound(format!("{}/{}", collection, id)))?;
        document.extend(fields.resolve(now));

        state.writes += 1;
        state.notify(collection);

        debug!("Updated {}/{}", collection, id);
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> StoreResult<Option<Document>> {
        let state = self.state()?;
        if let Some(error) = &state.query_failure {
            return Err(error.clone());
        }
        Ok(state
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .map(|data| Document::new(id, data.clone())))
    }
}
