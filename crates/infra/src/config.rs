use huddle_domain::chat::ChatSettings;
use huddle_domain::idempotency::IdempotencyConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub app_env: String,
    pub port: u16,
    pub log_level: String,
    pub data_backend: String,
    pub idempotency_backend: String,
    pub redis_url: String,
    pub idempotency_prefix: String,
    pub idempotency_in_progress_ttl_secs: u64,
    pub idempotency_completed_ttl_secs: u64,
    pub jwt_secret: String,
    pub request_timeout_secs: u64,
    pub chat_read_receipt_window: usize,
    pub chat_delete_batch_size: usize,
    pub chat_min_user_id_len: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();
        let cfg = config::Config::builder()
            .set_default("app_env", "development")?
            .set_default("port", 3000)?
            .set_default("log_level", "info")?
            .set_default("data_backend", "memory")?
            .set_default("idempotency_backend", "memory")?
            .set_default("redis_url", "redis://127.0.0.1:6379")?
            .set_default("idempotency_prefix", "huddle:idemp")?
            .set_default("idempotency_in_progress_ttl_secs", 60)?
            .set_default("idempotency_completed_ttl_secs", 86_400)?
            .set_default("jwt_secret", "dev-secret")?
            .set_default("request_timeout_secs", 15)?
            .set_default("chat_read_receipt_window", 50)?
            .set_default("chat_delete_batch_size", 400)?
            .set_default("chat_min_user_id_len", 8)?
            .add_source(config::Environment::default().separator("__"))
            .build()?;
        cfg.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app_env.eq_ignore_ascii_case("production")
    }

    pub fn chat_settings(&self) -> ChatSettings {
        ChatSettings {
            read_receipt_window: self.chat_read_receipt_window,
            delete_batch_size: self.chat_delete_batch_size,
            min_user_id_len: self.chat_min_user_id_len,
        }
        .normalized()
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            in_progress_ttl: Duration::from_secs(self.idempotency_in_progress_ttl_secs),
            completed_ttl: Duration::from_secs(self.idempotency_completed_ttl_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> AppConfig {
    AppConfig {
        app_env: "test".to_string(),
        port: 0,
        log_level: "debug".to_string(),
        data_backend: "memory".to_string(),
        idempotency_backend: "memory".to_string(),
        redis_url: "redis://127.0.0.1:6379".to_string(),
        idempotency_prefix: "test".to_string(),
        idempotency_in_progress_ttl_secs: 60,
        idempotency_completed_ttl_secs: 60,
        jwt_secret: "test-secret".to_string(),
        request_timeout_secs: 5,
        chat_read_receipt_window: 50,
        chat_delete_batch_size: 400,
        chat_min_user_id_len: 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_settings_are_clamped() {
        let config = AppConfig {
            chat_delete_batch_size: 10_000,
            chat_read_receipt_window: 0,
            ..test_config()
        };
        let settings = config.chat_settings();
        assert_eq!(settings.delete_batch_size, 500);
        assert_eq!(settings.read_receipt_window, 1);
        assert_eq!(settings.min_user_id_len, 8);

        let config = AppConfig {
            chat_read_receipt_window: 400,
            ..test_config()
        };
        assert_eq!(config.chat_settings().read_receipt_window, 50);
    }
}
