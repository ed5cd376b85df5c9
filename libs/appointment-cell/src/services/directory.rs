use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use shared_database::{Collection, Direction, Document, DocumentStore, Filter, Query};
use shared_models::{AppError, Appointment, Session, TherapistProfile, UserType};
use shared_utils::Clock;

use crate::models::Perspective;

const EXPERTISE_FIELDS: [&str; 3] = ["expertise", "expertiseSLP", "expertiseAudiologist"];
const DISORDER_TYPE_FIELDS: [&str; 2] = ["childDisorderTypes", "adultDisorderTypes"];

/// `childLanguageDisorder` -> `Child Language Disorder`.
pub fn humanize_flag(flag: &str) -> String {
    let mut label = String::with_capacity(flag.len() + 4);
    for (i, c) in flag.chars().enumerate() {
        if i == 0 {
            label.extend(c.to_uppercase());
        } else if c.is_uppercase() {
            label.push(' ');
            label.push(c);
        } else {
            label.push(c);
        }
    }
    label
}

fn push_unique(labels: &mut Vec<String>, label: String) {
    if !label.trim().is_empty() && !labels.contains(&label) {
        labels.push(label);
    }
}

/// Disorder types come either as a list of names or as a map of flags or
/// free-text values.
fn collect_disorder_types(value: &Value, labels: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items.iter().filter_map(Value::as_str) {
                push_unique(labels, item.to_string());
            }
        }
        Value::Object(entries) => {
            for (key, entry) in entries {
                match entry {
                    Value::Bool(true) => push_unique(labels, key.clone()),
                    Value::String(text) => push_unique(labels, text.trim().to_string()),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

/// Flattens the expertise flag maps of a `users` document into labels.
pub fn expertise_labels(data: &Map<String, Value>) -> Vec<String> {
    let mut labels = Vec::new();

    for field in EXPERTISE_FIELDS {
        let Some(Value::Object(flags)) = data.get(field) else {
            continue;
        };
        for (key, value) in flags {
            if DISORDER_TYPE_FIELDS.contains(&key.as_str()) {
                collect_disorder_types(value, &mut labels);
            } else if value == &Value::Bool(true) {
                push_unique(&mut labels, humanize_flag(key));
            }
        }
    }

    labels
}

fn therapist_from_document(document: &Document) -> Option<TherapistProfile> {
    let user_type = match document
        .data
        .get("userType")
        .cloned()
        .map(serde_json::from_value::<UserType>)
    {
        Some(Ok(user_type)) if user_type.is_therapist() => user_type,
        _ => {
            warn!("Skipping user {} without a therapist type", document.id);
            return None;
        }
    };

    let text = |field: &str| {
        document
            .data
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    Some(TherapistProfile {
        id: document.id.clone(),
        name: text("name"),
        user_type,
        gender: text("gender"),
        expertise: expertise_labels(&document.data),
        profile_image_url: text("profileImageUrl"),
    })
}

/// Therapists a client can send requests to.
#[derive(Clone)]
pub struct TherapistDirectory {
    store: Arc<dyn DocumentStore>,
}

impl TherapistDirectory {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, user_type: UserType) -> Result<Vec<TherapistProfile>, AppError> {
        let query = Query::new(Collection::Users).filter(Filter::eq("userType", user_type.as_str()));

        let documents = self.store.query(&query).await.map_err(|e| {
            if e.is_permission() {
                error!("Permission denied listing {} therapists: {}", user_type, e);
            } else {
                warn!("Failed to list {} therapists: {}", user_type, e);
            }
            e
        })?;

        let therapists: Vec<TherapistProfile> = documents.iter().filter_map(therapist_from_document).collect();
        debug!("Found {} {} therapists", therapists.len(), user_type);
        Ok(therapists)
    }

    /// Every therapist type, in `SLP`, `AUDIOLOGIST`, `BOTH` order.
    pub async fn list_all(&self) -> Result<Vec<TherapistProfile>, AppError> {
        let mut all = Vec::new();
        for user_type in UserType::therapist_types() {
            all.extend(self.list(user_type).await?);
        }
        Ok(all)
    }
}

/// Appointments of the signed-in user that have not ended yet.
#[derive(Clone)]
pub struct AppointmentDirectory {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl AppointmentDirectory {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn upcoming(&self, session: &Session) -> Result<Vec<Appointment>, AppError> {
        let query = Query::new(Collection::Appointments)
            .filter(Filter::eq(
                Perspective::of(session).own_field(),
                session.user_id.as_str(),
            ))
            .order_by("scheduledTime", Direction::Ascending);

        let now = self.clock.now();
        let appointments = self
            .store
            .query(&query)
            .await?
            .into_iter()
            .filter_map(|doc| {
                let id = doc.id.clone();
                doc.into_typed::<Appointment>()
                    .map_err(|e| warn!("Skipping malformed appointment {}: {}", id, e))
                    .ok()
            })
            .filter(|appointment| appointment.is_active(now))
            .collect();

        Ok(appointments)
    }
}
