use std::sync::Arc;
use anyhow::{anyhow, Context};
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appointment_cell::{AppointmentDirectory, BookingCoordinator, TherapistDirectory};
use notification_cell::NotificationFeed;
use shared_config::AppConfig;
use shared_database::{DocumentStore, InMemoryStore, SupabaseStore};
use shared_models::{Session, StatusMap, UserProfile, UserType};
use shared_utils::system_clock;
use status_cache_cell::StatusCache;

/// The signed-in user is handed over by the host app through the environment.
fn session_from_env() -> anyhow::Result<Session> {
    let user_id = std::env::var("BOOKING_USER_ID").context("BOOKING_USER_ID must be set")?;
    let user_type = std::env::var("BOOKING_USER_TYPE")
        .unwrap_or_else(|_| "CLIENT".to_string())
        .parse::<UserType>()
        .map_err(|e| anyhow!(e))?;

    Ok(Session::new(
        user_id,
        user_type,
        UserProfile {
            name: std::env::var("BOOKING_USER_NAME").ok(),
            ..UserProfile::default()
        },
    ))
}

fn log_statuses(map: &StatusMap) {
    info!(
        "{} pending, {} accepted, {} rejected",
        map.pending_requests.len(),
        map.accepted_requests.len(),
        map.rejected_therapists.len()
    );
    for (id, accepted) in &map.accepted_requests {
        info!(
            "  {} ({}): appointment at {}{}",
            accepted.therapist_name,
            id,
            accepted.appointment_time.to_rfc3339(),
            if accepted.confirmed { "" } else { " (awaiting confirmation)" }
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting booking client");

    // Load configuration
    let config = AppConfig::from_env();
    let session = session_from_env()?;
    let clock = system_clock();

    let store: Arc<dyn DocumentStore> = if config.is_configured() {
        Arc::new(SupabaseStore::new(&config))
    } else {
        warn!("Backend not configured, running against an in-memory store");
        Arc::new(InMemoryStore::new(clock.clone()))
    };
    let cache = StatusCache::from_config(&config).await;

    let coordinator = BookingCoordinator::new(
        session.clone(),
        store.clone(),
        cache,
        clock.clone(),
        &config,
    );

    let cached = coordinator.restore_cached().await;
    info!("Restored {} cached statuses for {}", cached.len(), session.user_id);

    match coordinator.refresh().await {
        Ok(map) => log_statuses(&map),
        Err(e) => warn!("Initial reconciliation failed, showing cached statuses: {}", e),
    }

    if session.is_client() {
        match TherapistDirectory::new(store.clone()).list_all().await {
            Ok(therapists) => {
                for therapist in therapists {
                    let status = coordinator.status(&therapist.id).await;
                    info!(
                        "  {} [{}] {}: {}",
                        therapist.name.as_deref().unwrap_or("Therapist"),
                        therapist.user_type,
                        therapist.expertise_text(),
                        status.kind()
                    );
                }
            }
            Err(e) => warn!("Could not load therapists: {}", e),
        }
    }

    match AppointmentDirectory::new(store.clone(), clock.clone())
        .upcoming(&session)
        .await
    {
        Ok(appointments) => info!("{} upcoming appointments", appointments.len()),
        Err(e) => warn!("Could not load appointments: {}", e),
    }

    let feed = NotificationFeed::subscribe(store.clone(), clock.clone(), session.clone(), &config)
        .await
        .context("opening notification feed")?;
    info!("{} unread notifications", feed.unread_count().await);

    let watch = coordinator.watch().await.context("watching booking status")?;
    let mut changes = coordinator.changes();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let map = changes.borrow_and_update().clone();
                log_statuses(&map);
            }
        }
    }

    watch.stop();
    feed.unsubscribe();
    Ok(())
}
