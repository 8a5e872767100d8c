use std::time::Duration;
use tracing::Level;
use voice_worker_core::llm_client::GEMINI_OPENAI_API_BASE;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:4003";
pub const DEFAULT_AGENT_NAME: &str = "my-agent";
pub const DEFAULT_SARVAM_API_BASE: &str = "https://api.sarvam.ai";

/// LiveKit server connection parameters.
#[derive(Clone)]
pub struct LiveKitSettings {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for LiveKitSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveKitSettings")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub livekit: LiveKitSettings,
    pub backend_url: String,
    pub worker_secret: String,
    pub agent_name: String,
    pub backend_timeout: Duration,
    pub llm_api_base: String,
    pub sarvam_api_base: String,
    pub max_retries: u32,
    pub log_level: Level,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("livekit", &self.livekit)
            .field("backend_url", &self.backend_url)
            .field("worker_secret", &"[REDACTED]")
            .field("agent_name", &self.agent_name)
            .field("backend_timeout", &self.backend_timeout)
            .field("llm_api_base", &self.llm_api_base)
            .field("sarvam_api_base", &self.sarvam_api_base)
            .field("max_retries", &self.max_retries)
            .field("log_level", &self.log_level)
            .finish()
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let livekit = LiveKitSettings {
            url: required("LIVEKIT_URL")?,
            api_key: required("LIVEKIT_API_KEY")?,
            api_secret: required("LIVEKIT_API_SECRET")?,
        };

        let backend_url =
            std::env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string());
        let worker_secret = std::env::var("WORKER_SECRET").unwrap_or_default();
        let agent_name =
            std::env::var("AGENT_NAME").unwrap_or_else(|_| DEFAULT_AGENT_NAME.to_string());

        let backend_timeout = Duration::from_secs(parse_or("BACKEND_TIMEOUT_SECS", 10u64)?);

        let llm_api_base =
            std::env::var("LLM_API_BASE").unwrap_or_else(|_| GEMINI_OPENAI_API_BASE.to_string());
        let sarvam_api_base = std::env::var("SARVAM_API_BASE")
            .unwrap_or_else(|_| DEFAULT_SARVAM_API_BASE.to_string());

        let max_retries = parse_or("WORKER_MAX_RETRIES", 16u32)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            livekit,
            backend_url,
            worker_secret,
            agent_name,
            backend_timeout,
            llm_api_base,
            sarvam_api_base,
            max_retries,
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("LIVEKIT_URL");
            env::remove_var("LIVEKIT_API_KEY");
            env::remove_var("LIVEKIT_API_SECRET");
            env::remove_var("BACKEND_URL");
            env::remove_var("WORKER_SECRET");
            env::remove_var("AGENT_NAME");
            env::remove_var("BACKEND_TIMEOUT_SECS");
            env::remove_var("LLM_API_BASE");
            env::remove_var("SARVAM_API_BASE");
            env::remove_var("WORKER_MAX_RETRIES");
            env::remove_var("RUST_LOG");
        }
    }

    fn set_minimal_env() {
        unsafe {
            env::set_var("LIVEKIT_URL", "wss://example.livekit.cloud");
            env::set_var("LIVEKIT_API_KEY", "APIkey");
            env::set_var("LIVEKIT_API_SECRET", "secret");
        }
    }

    #[test]
    fn test_config_error_display() {
        let missing_var = ConfigError::MissingVar("TEST_VAR".to_string());
        assert_eq!(
            format!("{}", missing_var),
            "Missing environment variable: TEST_VAR"
        );

        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        set_minimal_env();

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.livekit.url, "wss://example.livekit.cloud");
        assert_eq!(config.livekit.api_key, "APIkey");
        assert_eq!(config.livekit.api_secret, "secret");
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.worker_secret, "");
        assert_eq!(config.agent_name, "my-agent");
        assert_eq!(config.backend_timeout, Duration::from_secs(10));
        assert_eq!(config.llm_api_base, GEMINI_OPENAI_API_BASE);
        assert_eq!(config.sarvam_api_base, DEFAULT_SARVAM_API_BASE);
        assert_eq!(config.max_retries, 16);
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BACKEND_URL", "http://backend:9000");
            env::set_var("WORKER_SECRET", "worker-secret");
            env::set_var("AGENT_NAME", "support-agent");
            env::set_var("BACKEND_TIMEOUT_SECS", "3");
            env::set_var("LLM_API_BASE", "http://llm.local/v1");
            env::set_var("SARVAM_API_BASE", "http://sarvam.local");
            env::set_var("WORKER_MAX_RETRIES", "2");
            env::set_var("RUST_LOG", "debug");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.backend_url, "http://backend:9000");
        assert_eq!(config.worker_secret, "worker-secret");
        assert_eq!(config.agent_name, "support-agent");
        assert_eq!(config.backend_timeout, Duration::from_secs(3));
        assert_eq!(config.llm_api_base, "http://llm.local/v1");
        assert_eq!(config.sarvam_api_base, "http://sarvam.local");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    #[serial]
    fn test_config_missing_livekit_url() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::remove_var("LIVEKIT_URL");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "LIVEKIT_URL"),
            _ => panic!("Expected MissingVar for LIVEKIT_URL"),
        }
    }

    #[test]
    #[serial]
    fn test_config_empty_secret_counts_as_missing() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("LIVEKIT_API_SECRET", "");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(var) => assert_eq!(var, "LIVEKIT_API_SECRET"),
            _ => panic!("Expected MissingVar for LIVEKIT_API_SECRET"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_timeout() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("BACKEND_TIMEOUT_SECS", "ten");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "BACKEND_TIMEOUT_SECS"),
            _ => panic!("Expected InvalidValue for BACKEND_TIMEOUT_SECS"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
    }

    #[test]
    #[serial]
    fn test_debug_redacts_secrets() {
        clear_env_vars();
        set_minimal_env();
        unsafe {
            env::set_var("WORKER_SECRET", "top-secret-value");
        }

        let config = Config::from_env().unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("top-secret-value"));
        assert!(!debug.contains("\"secret\""));
    }
}
