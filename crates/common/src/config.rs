use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Recipients fetched per fan-out batch (default: 1000)
    pub fanout_batch_size: usize,

    /// Upper bound for a single channel `send` call, in seconds (default: 30)
    pub channel_send_timeout_secs: u64,

    /// APNs signing key identifier
    pub apns_key_id: Option<String>,

    /// Apple developer team identifier
    pub apns_team_id: Option<String>,

    /// Path to the APNs `.p8` signing key
    pub apns_key_path: Option<String>,

    /// APNs topic (the app bundle identifier)
    pub apns_topic: Option<String>,

    /// Use the APNs sandbox gateway instead of production
    pub apns_sandbox: bool,

    /// GCM/FCM legacy server key
    pub gcm_server_key: Option<String>,

    /// GCM/FCM legacy send endpoint
    pub gcm_endpoint: String,
}

/// Everything needed to build an APNs sender.
#[derive(Debug, Clone)]
pub struct ApnsSettings {
    pub key_id: String,
    pub team_id: String,
    pub key_path: String,
    pub topic: String,
    pub sandbox: bool,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            fanout_batch_size: std::env::var("FANOUT_BATCH_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("FANOUT_BATCH_SIZE must be a valid usize"))?,
            channel_send_timeout_secs: std::env::var("CHANNEL_SEND_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CHANNEL_SEND_TIMEOUT_SECS must be a valid u64"))?,
            apns_key_id: std::env::var("APNS_KEY_ID").ok(),
            apns_team_id: std::env::var("APNS_TEAM_ID").ok(),
            apns_key_path: std::env::var("APNS_KEY_PATH").ok(),
            apns_topic: std::env::var("APNS_TOPIC").ok(),
            apns_sandbox: std::env::var("APNS_SANDBOX")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("APNS_SANDBOX must be true or false"))?,
            gcm_server_key: std::env::var("GCM_SERVER_KEY").ok(),
            gcm_endpoint: std::env::var("GCM_ENDPOINT")
                .unwrap_or_else(|_| "https://fcm.googleapis.com/fcm/send".to_string()),
        })
    }

    /// APNs settings, if every required variable is present.
    pub fn apns(&self) -> Option<ApnsSettings> {
        Some(ApnsSettings {
            key_id: self.apns_key_id.clone()?,
            team_id: self.apns_team_id.clone()?,
            key_path: self.apns_key_path.clone()?,
            topic: self.apns_topic.clone()?,
            sandbox: self.apns_sandbox,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://unused".to_string(),
            db_max_connections: 5,
            fanout_batch_size: 1000,
            channel_send_timeout_secs: 30,
            apns_key_id: Some("KEY123".to_string()),
            apns_team_id: Some("TEAM456".to_string()),
            apns_key_path: Some("/keys/apns.p8".to_string()),
            apns_topic: Some("org.example.app".to_string()),
            apns_sandbox: true,
            gcm_server_key: None,
            gcm_endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
        }
    }

    #[test]
    fn test_apns_settings_complete() {
        let settings = base_config().apns().unwrap();
        assert_eq!(settings.key_id, "KEY123");
        assert_eq!(settings.topic, "org.example.app");
        assert!(settings.sandbox);
    }

    #[test]
    fn test_apns_settings_missing_field() {
        let mut config = base_config();
        config.apns_topic = None;
        assert!(config.apns().is_none());
    }
}
