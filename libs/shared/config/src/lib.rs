use std::env;
use std::str::FromStr;
use tracing::warn;

const DEFAULT_REALTIME_HEARTBEAT_SECS: u64 = 25;
const DEFAULT_QUEUE_NUMBER_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_CACHE_MAX_ENTRIES: usize = 512;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    /// Offset of the clinic's wall clock from UTC. `None` uses the server's local offset.
    pub clinic_utc_offset_minutes: Option<i32>,
    pub realtime_heartbeat_secs: u64,
    pub queue_number_max_attempts: u32,
    /// Upper bound on cached reads held by the process.
    pub cache_max_entries: usize,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            clinic_utc_offset_minutes: None,
            realtime_heartbeat_secs: DEFAULT_REALTIME_HEARTBEAT_SECS,
            queue_number_max_attempts: DEFAULT_QUEUE_NUMBER_MAX_ATTEMPTS,
            cache_max_entries: DEFAULT_CACHE_MAX_ENTRIES,
            port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
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
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            clinic_utc_offset_minutes: parse_var("CLINIC_UTC_OFFSET_MINUTES"),
            realtime_heartbeat_secs: parse_var("REALTIME_HEARTBEAT_SECS")
                .unwrap_or(DEFAULT_REALTIME_HEARTBEAT_SECS),
            queue_number_max_attempts: parse_var("QUEUE_NUMBER_MAX_ATTEMPTS")
                .unwrap_or(DEFAULT_QUEUE_NUMBER_MAX_ATTEMPTS),
            cache_max_entries: parse_var("CACHE_MAX_ENTRIES").unwrap_or(DEFAULT_CACHE_MAX_ENTRIES),
            port: parse_var("PORT").unwrap_or(DEFAULT_PORT),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Websocket endpoint of the Supabase realtime service.
    pub fn realtime_url(&self) -> String {
        let base = self.supabase_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };

        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.supabase_anon_key
        )
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("{} has an invalid value '{}', using default", name, raw);
            None
        }
    }
}
