use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};

/// Length of a WeCom `EncodingAESKey` (base64 of 32 bytes, padding dropped).
const ENCODING_AES_KEY_LEN: usize = 43;

const LOG_FILE_NAME: &str = "app.log";

/// Main configuration structure for the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub wecom: WeComConfig,
    pub engine: EngineConfig,
    pub token: TokenConfig,
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub callback_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeComConfig {
    /// Callback token used in the message signature
    pub token: String,
    pub encoding_aes_key: String,
    pub corp_id: String,
    pub app_secret: String,
    pub api_base_url: String,
    pub duplicate_check_interval: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub app_key: String,
    pub sse_url: String,
    /// Absolute deadline for one streaming session
    pub session_timeout_secs: u64,
    /// Capacity of the per-session segment channel
    pub segment_buffer: usize,
    pub streaming_throttle: u32,
    #[serde(default)]
    pub system_role: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Where log output goes; stdout unless `dir` is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Refresh this many seconds before the reported expiry
    pub safety_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_base: f64,
    pub jitter_factor: f64,
}

impl Config {
    /// Load configuration from file with environment variable overrides
    /// ALWAYS returns a config - call `validate` before serving
    pub fn load() -> Self {
        let env_paths = [".env", "../.env"];

        let mut env_loaded = false;
        for path in &env_paths {
            if dotenvy::from_path(path).is_ok() {
                tracing::info!("Loaded .env from: {}", path);
                env_loaded = true;
                break;
            }
        }

        if !env_loaded {
            tracing::debug!("No .env file found - continuing with env vars only");
        }

        let config_path =
            env::var("RELAY_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match serde_yaml::from_str::<Config>(&contents) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from {}", config_path);
                        config
                    }
                    Err(e) => {
                        tracing::error!(
                            "Failed to parse config file {}: {} - using defaults",
                            config_path,
                            e
                        );
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::error!(
                        "Failed to read config file {}: {} - using defaults",
                        config_path,
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("Config file not found at {} - using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(bind) = lookup("RELAY_HTTP_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = lookup("RELAY_CALLBACK_PATH") {
            self.server.callback_path = path;
        }

        // WeCom overrides
        if let Some(token) = lookup("WX_TOKEN") {
            self.wecom.token = token;
        }
        if let Some(key) = lookup("WX_ENCODING_AES_KEY") {
            self.wecom.encoding_aes_key = key;
        }
        if let Some(corp_id) = lookup("WX_CORP_ID") {
            self.wecom.corp_id = corp_id;
        }
        if let Some(secret) = lookup("WX_APP_SECRET") {
            self.wecom.app_secret = secret;
        }
        if let Some(url) = lookup("WX_API_BASE_URL") {
            self.wecom.api_base_url = url;
        }

        // Chat engine overrides
        if let Some(app_key) = lookup("TENCENT_CLOUD_LKE_APP_KEY") {
            self.engine.app_key = app_key;
        }
        if let Some(url) = lookup("LKE_SSE_URL") {
            self.engine.sse_url = url;
        }
        if let Some(dir) = lookup("RELAY_LOG_DIR") {
            let dir = dir.trim();
            self.logging.dir = (!dir.is_empty()).then(|| dir.to_string());
        }

        if let Some(timeout) = lookup("LKE_SESSION_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse() {
                self.engine.session_timeout_secs = secs;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("WX_TOKEN", &self.wecom.token),
            ("WX_ENCODING_AES_KEY", &self.wecom.encoding_aes_key),
            ("WX_CORP_ID", &self.wecom.corp_id),
            ("WX_APP_SECRET", &self.wecom.app_secret),
            ("TENCENT_CLOUD_LKE_APP_KEY", &self.engine.app_key),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(RelayError::Config(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }

        if self.wecom.encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
            return Err(RelayError::Config(format!(
                "WX_ENCODING_AES_KEY must be {ENCODING_AES_KEY_LEN} characters"
            )));
        }

        if self.engine.session_timeout_secs == 0 {
            return Err(RelayError::Config(
                "engine.session_timeout_secs cannot be 0".into(),
            ));
        }
        if self.engine.segment_buffer == 0 {
            return Err(RelayError::Config("engine.segment_buffer cannot be 0".into()));
        }

        if self.retry.jitter_factor < 0.0 || self.retry.jitter_factor > 1.0 {
            return Err(RelayError::Config(
                "Retry jitter factor must be between 0.0 and 1.0".into(),
            ));
        }
        if self.retry.initial_delay_ms == 0 || self.retry.max_delay_ms < self.retry.initial_delay_ms
        {
            return Err(RelayError::Config(
                "Retry delays must be non-zero and max_delay_ms >= initial_delay_ms".into(),
            ));
        }

        Ok(())
    }

    /// Get the streaming session deadline as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.session_timeout_secs)
    }

    /// Log file path when file logging is configured
    pub fn log_file(&self) -> Option<PathBuf> {
        self.logging
            .dir
            .as_deref()
            .map(|dir| Path::new(dir).join(LOG_FILE_NAME))
    }

    /// Get the token refresh safety margin as Duration
    pub fn token_safety_margin(&self) -> Duration {
        Duration::from_secs(self.token.safety_margin_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "0.0.0.0:80".to_string(),
                callback_path: "/".to_string(),
            },
            wecom: WeComConfig {
                token: String::new(),
                encoding_aes_key: String::new(),
                corp_id: String::new(),
                app_secret: String::new(),
                api_base_url: "https://qyapi.weixin.qq.com".to_string(),
                duplicate_check_interval: 1800,
            },
            engine: EngineConfig {
                app_key: String::new(),
                sse_url: "https://wss.lke.cloud.tencent.com/v1/qbot/chat/sse".to_string(),
                session_timeout_secs: 600,
                segment_buffer: 10,
                streaming_throttle: 1,
                system_role: None,
                request_timeout_secs: None,
            },
            token: TokenConfig {
                safety_margin_secs: 10,
            },
            retry: RetryConfig {
                initial_delay_ms: 1000,
                max_delay_ms: 60_000,
                backoff_base: 2.0,
                jitter_factor: 0.1,
            },
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        let mut cfg = Config::default();
        cfg.wecom.token = "token".to_string();
        cfg.wecom.encoding_aes_key = "a".repeat(ENCODING_AES_KEY_LEN);
        cfg.wecom.corp_id = "ww0123456789".to_string();
        cfg.wecom.app_secret = "secret".to_string();
        cfg.engine.app_key = "app-key".to_string();
        cfg
    }

    #[test]
    fn test_default_config_requires_credentials() {
        let err = Config::default().validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("WX_TOKEN"));
        assert!(msg.contains("TENCENT_CLOUD_LKE_APP_KEY"));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_short_aes_key() {
        let mut cfg = valid_config();
        cfg.wecom.encoding_aes_key = "short".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WX_TOKEN", "tok"),
            ("WX_CORP_ID", "corp"),
            ("TENCENT_CLOUD_LKE_APP_KEY", "lke"),
            ("LKE_SESSION_TIMEOUT_SECS", "30"),
            ("RELAY_HTTP_BIND", "127.0.0.1:9000"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.wecom.token, "tok");
        assert_eq!(cfg.wecom.corp_id, "corp");
        assert_eq!(cfg.engine.app_key, "lke");
        assert_eq!(cfg.session_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        // untouched
        assert_eq!(cfg.wecom.duplicate_check_interval, 1800);
    }

    #[test]
    fn test_log_dir_override() {
        let mut cfg = Config::default();
        assert!(cfg.log_file().is_none());

        cfg.apply_overrides(|k| (k == "RELAY_LOG_DIR").then(|| "/var/log/relay".to_string()));
        assert_eq!(cfg.logging.dir.as_deref(), Some("/var/log/relay"));
        assert_eq!(
            cfg.log_file(),
            Some(PathBuf::from("/var/log/relay/app.log"))
        );

        cfg.apply_overrides(|k| (k == "RELAY_LOG_DIR").then(|| "  ".to_string()));
        assert!(cfg.log_file().is_none());
    }

    #[test]
    fn test_unparsable_numeric_override_is_ignored() {
        let mut cfg = Config::default();
        cfg.apply_overrides(|k| (k == "LKE_SESSION_TIMEOUT_SECS").then(|| "soon".to_string()));
        assert_eq!(cfg.engine.session_timeout_secs, 600);
    }

    #[test]
    fn test_yaml_round_trip_keeps_optional_engine_fields() {
        let yaml = r#"
server: { bind: "127.0.0.1:8080", callback_path: "/wecom" }
wecom:
  token: t
  encoding_aes_key: k
  corp_id: c
  app_secret: s
  api_base_url: "http://localhost"
  duplicate_check_interval: 600
engine:
  app_key: a
  sse_url: "http://localhost/sse"
  session_timeout_secs: 60
  segment_buffer: 4
  streaming_throttle: 1
token: { safety_margin_secs: 30 }
retry: { initial_delay_ms: 10, max_delay_ms: 100, backoff_base: 2.0, jitter_factor: 0.0 }
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.server.callback_path, "/wecom");
        assert!(cfg.engine.system_role.is_none());
        assert_eq!(cfg.token_safety_margin(), Duration::from_secs(30));
        assert!(cfg.logging.dir.is_none());

        let with_logging = format!("{yaml}logging: {{ dir: \"/tmp/relay-logs\" }}\n");
        let cfg: Config = serde_yaml::from_str(&with_logging).unwrap();
        assert_eq!(cfg.logging.dir.as_deref(), Some("/tmp/relay-logs"));
    }
}
