//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Stripe
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,

    // External services
    pub accounting_base_url: String,
    pub directory_base_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),

            // Stripe
            stripe_secret_key: env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ConfigError::Missing("STRIPE_SECRET_KEY"))?,
            stripe_webhook_secret: env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| ConfigError::Missing("STRIPE_WEBHOOK_SECRET"))?,

            // External services
            accounting_base_url: env::var("ACCOUNTING_BASE_URL")
                .map_err(|_| ConfigError::Missing("ACCOUNTING_BASE_URL"))?,
            directory_base_url: env::var("DIRECTORY_BASE_URL")
                .map_err(|_| ConfigError::Missing("DIRECTORY_BASE_URL"))?,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn set_required_vars() {
        env::set_var("DATABASE_URL", "postgres://localhost/vlabs_test");
        env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test_123");
        env::set_var("ACCOUNTING_BASE_URL", "http://localhost:8100");
        env::set_var("DIRECTORY_BASE_URL", "http://localhost:8200");
    }

    #[test]
    fn test_from_env_with_required_vars() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required_vars();
        env::remove_var("BIND_ADDRESS");
        env::remove_var("DATABASE_MAX_CONNECTIONS");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.database_max_connections, 20);
        assert!(config.run_migrations);
    }

    #[test]
    fn test_from_env_missing_database_url() {
        let _guard = ENV_LOCK.lock().unwrap();
        set_required_vars();
        env::remove_var("DATABASE_URL");

        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }
}
