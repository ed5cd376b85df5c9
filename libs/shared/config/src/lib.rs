use std::env;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_access_token: Option<String>,
    pub redis_url: Option<String>,
    pub status_cache_dir: String,
    pub listener_poll_interval_ms: u64,
    pub reconcile_recheck_ms: u64,
    pub store_write_timeout_ms: u64,
    pub store_write_max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_access_token: None,
            redis_url: None,
            status_cache_dir: ".booking-cache".to_string(),
            listener_poll_interval_ms: 3000,
            reconcile_recheck_ms: 2000,
            store_write_timeout_ms: 5000,
            store_write_max_attempts: 3,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_access_token: env::var("SUPABASE_ACCESS_TOKEN").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            status_cache_dir: env::var("STATUS_CACHE_DIR")
                .unwrap_or_else(|_| defaults.status_cache_dir.clone()),
            listener_poll_interval_ms: parse_or_default(
                "LISTENER_POLL_INTERVAL_MS",
                defaults.listener_poll_interval_ms,
            ),
            reconcile_recheck_ms: parse_or_default(
                "RECONCILE_RECHECK_MS",
                defaults.reconcile_recheck_ms,
            ),
            store_write_timeout_ms: parse_or_default(
                "STORE_WRITE_TIMEOUT_MS",
                defaults.store_write_timeout_ms,
            ),
            store_write_max_attempts: parse_or_default(
                "STORE_WRITE_MAX_ATTEMPTS",
                defaults.store_write_max_attempts,
            ),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn listener_poll_interval(&self) -> Duration {
        Duration::from_millis(self.listener_poll_interval_ms)
    }

    pub fn reconcile_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_recheck_ms)
    }

    pub fn store_write_timeout(&self) -> Duration {
        Duration::from_millis(self.store_write_timeout_ms)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
