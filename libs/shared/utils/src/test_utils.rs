use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::{Session, TherapistProfile, UserProfile, UserType};

use crate::clock::ManualClock;

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub access_token: Option<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            access_token: Some("test-access-token".to_string()),
        }
    }
}

impl TestConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            supabase_url: url.into(),
            ..Self::default()
        }
    }

    /// Short delays so deferred passes and polling finish inside a test.
    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_access_token: self.access_token.clone(),
            redis_url: None,
            status_cache_dir: std::env::temp_dir()
                .join(format!("booking-cache-{}", Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            listener_poll_interval_ms: 20,
            reconcile_recheck_ms: 50,
            store_write_timeout_ms: 1000,
            store_write_max_attempts: 2,
        }
    }
}

/// Fixed starting instant for deterministic scenarios.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub fn test_clock() -> ManualClock {
    ManualClock::new(test_epoch())
}

pub struct TestUser;

impl TestUser {
    pub fn client(name: &str) -> Session {
        Session::new(
            format!("client-{}", Uuid::new_v4()),
            UserType::Client,
            UserProfile {
                name: Some(name.to_string()),
                age: Some("34".to_string()),
                gender: Some("Female".to_string()),
                complaint: Some("Stuttering".to_string()),
                profile_image_url: None,
            },
        )
    }

    pub fn therapist(name: &str, user_type: UserType) -> Session {
        Session::new(
            format!("therapist-{}", Uuid::new_v4()),
            user_type,
            UserProfile {
                name: Some(name.to_string()),
                ..UserProfile::default()
            },
        )
    }

    /// Directory entry matching a therapist session.
    pub fn profile_of(therapist: &Session) -> TherapistProfile {
        TherapistProfile {
            id: therapist.user_id.clone(),
            name: therapist.profile.name.clone(),
            user_type: therapist.user_type,
            gender: Some("Male".to_string()),
            expertise: vec!["Child Language Disorder".to_string()],
            profile_image_url: None,
        }
    }
}

pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn notification_row(id: &str, kind: &str, client_id: &str, therapist_id: &str, created_at: &str) -> serde_json::Value {
        json!({
            "id": id,
            "type": kind,
            "senderId": client_id,
            "recipientId": therapist_id,
            "therapistId": therapist_id,
            "clientId": client_id,
            "status": "unread",
            "therapistName": "Dr. Rao",
            "clientName": "Sam",
            "createdAt": created_at
        })
    }

    pub fn therapist_row(id: &str, user_type: &str) -> serde_json::Value {
        json!({
            "id": id,
            "name": "Dr. Rao",
            "userType": user_type,
            "gender": "Male",
            "expertiseSLP": {
                "childLanguageDisorder": true,
                "adultLanguageDisorder": false
            },
            "profileImageUrl": null
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code
        })
    }
}
