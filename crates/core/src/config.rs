use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub outlet_store: OutletStoreConfig,
    pub session: SessionConfig,
    pub catalog: CatalogConfig,
    pub planner: PlannerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Total wall-clock budget for one chat request, tools included.
    pub request_deadline_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub rate_limit_per_minute: u32,
    pub rate_limit_max_wait_secs: u64,
}

#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct OutletStoreConfig {
    pub url: String,
    pub api_key: Option<SecretString>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub window: usize,
    pub ttl_minutes: u64,
    pub max_sessions: usize,
}

#[derive(Clone, Debug)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct PlannerConfig {
    /// City/state names the entity extractor treats as locations.
    pub known_locations: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub llm_api_key: Option<String>,
    pub sql_url: Option<String>,
    pub sql_key: Option<String>,
    pub port: Option<u16>,
    pub cors_origins: Option<Vec<String>>,
    pub session_window: Option<usize>,
    pub session_ttl_min: Option<u64>,
    pub catalog_path: Option<PathBuf>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8000,
                cors_origins: vec!["http://localhost:3000".to_string()],
                request_deadline_secs: 30,
            },
            llm: LlmConfig {
                api_key: None,
                base_url: "https://api.groq.com/openai/v1".to_string(),
                model: "llama-3.3-70b-versatile".to_string(),
                timeout_secs: 20,
                rate_limit_per_minute: 30,
                rate_limit_max_wait_secs: 10,
            },
            embedding: EmbeddingConfig {
                base_url: "http://localhost:11434/v1".to_string(),
                model: "nomic-embed-text".to_string(),
                dimension: 768,
                timeout_secs: 10,
            },
            outlet_store: OutletStoreConfig {
                url: "sqlite://kopi.db".to_string(),
                api_key: None,
                max_connections: 10,
                connect_timeout_secs: 30,
                query_timeout_secs: 5,
            },
            session: SessionConfig { window: 3, ttl_minutes: 60, max_sessions: 10_000 },
            catalog: CatalogConfig { path: PathBuf::from("data/products_drinkware.jsonl") },
            planner: PlannerConfig { known_locations: default_known_locations() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn default_known_locations() -> Vec<String> {
    [
        "kuala lumpur",
        "selangor",
        "shah alam",
        "petaling jaya",
        "subang jaya",
        "subang",
        "klang",
        "ampang",
        "cheras",
        "kepong",
        "bangsar",
        "damansara",
        "puchong",
        "kl",
        "pj",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("kopi.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(cors_origins) = server.cors_origins {
                self.server.cors_origins = cors_origins;
            }
            if let Some(request_deadline_secs) = server.request_deadline_secs {
                self.server.request_deadline_secs = request_deadline_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = base_url;
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(rate_limit_per_minute) = llm.rate_limit_per_minute {
                self.llm.rate_limit_per_minute = rate_limit_per_minute;
            }
            if let Some(rate_limit_max_wait_secs) = llm.rate_limit_max_wait_secs {
                self.llm.rate_limit_max_wait_secs = rate_limit_max_wait_secs;
            }
        }

        if let Some(embedding) = patch.embedding {
            if let Some(base_url) = embedding.base_url {
                self.embedding.base_url = base_url;
            }
            if let Some(model) = embedding.model {
                self.embedding.model = model;
            }
            if let Some(dimension) = embedding.dimension {
                self.embedding.dimension = dimension;
            }
            if let Some(timeout_secs) = embedding.timeout_secs {
                self.embedding.timeout_secs = timeout_secs;
            }
        }

        if let Some(outlet_store) = patch.outlet_store {
            if let Some(url) = outlet_store.url {
                self.outlet_store.url = url;
            }
            if let Some(sql_key_value) = outlet_store.api_key {
                self.outlet_store.api_key = Some(secret_value(sql_key_value));
            }
            if let Some(max_connections) = outlet_store.max_connections {
                self.outlet_store.max_connections = max_connections;
            }
            if let Some(connect_timeout_secs) = outlet_store.connect_timeout_secs {
                self.outlet_store.connect_timeout_secs = connect_timeout_secs;
            }
            if let Some(query_timeout_secs) = outlet_store.query_timeout_secs {
                self.outlet_store.query_timeout_secs = query_timeout_secs;
            }
        }

        if let Some(session) = patch.session {
            if let Some(window) = session.window {
                self.session.window = window;
            }
            if let Some(ttl_minutes) = session.ttl_minutes {
                self.session.ttl_minutes = ttl_minutes;
            }
            if let Some(max_sessions) = session.max_sessions {
                self.session.max_sessions = max_sessions;
            }
        }

        if let Some(catalog) = patch.catalog {
            if let Some(path) = catalog.path {
                self.catalog.path = path;
            }
        }

        if let Some(planner) = patch.planner {
            if let Some(known_locations) = planner.known_locations {
                self.planner.known_locations =
                    known_locations.into_iter().map(|entry| entry.to_lowercase()).collect();
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LLM_BASE_URL") {
            self.llm.base_url = value;
        }
        if let Some(value) = read_env("LLM_MODEL") {
            self.llm.model = value;
        }

        if let Some(value) = read_env("EMBEDDING_BASE_URL") {
            self.embedding.base_url = value;
        }
        if let Some(value) = read_env("EMBEDDING_MODEL") {
            self.embedding.model = value;
        }
        if let Some(value) = read_env("EMBEDDING_DIMENSION") {
            self.embedding.dimension = parse_usize("EMBEDDING_DIMENSION", &value)?;
        }

        if let Some(value) = read_env("SQL_URL") {
            self.outlet_store.url = value;
        }
        if let Some(value) = read_env("SQL_KEY") {
            self.outlet_store.api_key = Some(secret_value(value));
        }

        if let Some(value) = read_env("PORT") {
            self.server.port = parse_u16("PORT", &value)?;
        }
        if let Some(value) = read_env("CORS_ORIGINS") {
            self.server.cors_origins =
                value.split(',').map(|origin| origin.trim().to_string()).collect();
        }
        if let Some(value) = read_env("REQUEST_DEADLINE_SECS") {
            self.server.request_deadline_secs = parse_u64("REQUEST_DEADLINE_SECS", &value)?;
        }

        if let Some(value) = read_env("SESSION_WINDOW") {
            self.session.window = parse_usize("SESSION_WINDOW", &value)?;
        }
        if let Some(value) = read_env("SESSION_TTL_MIN") {
            self.session.ttl_minutes = parse_u64("SESSION_TTL_MIN", &value)?;
        }

        if let Some(value) = read_env("CATALOG_PATH") {
            self.catalog.path = PathBuf::from(value);
        }

        if let Some(value) = read_env("KOPI_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("KOPI_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(sql_url) = overrides.sql_url {
            self.outlet_store.url = sql_url;
        }
        if let Some(sql_key) = overrides.sql_key {
            self.outlet_store.api_key = Some(secret_value(sql_key));
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(cors_origins) = overrides.cors_origins {
            self.server.cors_origins = cors_origins;
        }
        if let Some(window) = overrides.session_window {
            self.session.window = window;
        }
        if let Some(ttl) = overrides.session_ttl_min {
            self.session.ttl_minutes = ttl;
        }
        if let Some(catalog_path) = overrides.catalog_path {
            self.catalog.path = catalog_path;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_server(&self.server)?;
        validate_llm(&self.llm)?;
        validate_embedding(&self.embedding)?;
        validate_outlet_store(&self.outlet_store)?;
        validate_session(&self.session)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("kopi.toml"), PathBuf::from("config/kopi.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }
    if server.cors_origins.iter().any(|origin| origin.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "server.cors_origins must not contain empty entries".to_string(),
        ));
    }
    if server.request_deadline_secs == 0 || server.request_deadline_secs > 300 {
        return Err(ConfigError::Validation(
            "server.request_deadline_secs must be in range 1..=300".to_string(),
        ));
    }
    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    let missing =
        llm.api_key.as_ref().map(|value| value.expose_secret().trim().is_empty()).unwrap_or(true);
    if missing {
        return Err(ConfigError::Validation(
            "llm.api_key is required. Set LLM_API_KEY in the environment.".to_string(),
        ));
    }

    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation("llm.timeout_secs must be in range 1..=300".to_string()));
    }
    if llm.rate_limit_per_minute == 0 {
        return Err(ConfigError::Validation(
            "llm.rate_limit_per_minute must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_embedding(embedding: &EmbeddingConfig) -> Result<(), ConfigError> {
    if embedding.dimension == 0 {
        return Err(ConfigError::Validation(
            "embedding.dimension must be greater than zero".to_string(),
        ));
    }
    if embedding.timeout_secs == 0 || embedding.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "embedding.timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    Ok(())
}

fn validate_outlet_store(store: &OutletStoreConfig) -> Result<(), ConfigError> {
    let url = store.url.trim();
    if !url.starts_with("sqlite:") && url != ":memory:" {
        return Err(ConfigError::Validation(
            "outlet_store.url must be a sqlite URL (`sqlite://...`, `sqlite::memory:`, or `:memory:`)"
                .to_string(),
        ));
    }

    if store.max_connections == 0 {
        return Err(ConfigError::Validation(
            "outlet_store.max_connections must be greater than zero".to_string(),
        ));
    }
    if store.query_timeout_secs == 0 || store.query_timeout_secs > 60 {
        return Err(ConfigError::Validation(
            "outlet_store.query_timeout_secs must be in range 1..=60".to_string(),
        ));
    }
    Ok(())
}

fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.window > 50 {
        return Err(ConfigError::Validation("session.window must be at most 50".to_string()));
    }
    if session.ttl_minutes == 0 || session.ttl_minutes > 1_440 {
        return Err(ConfigError::Validation(
            "session.ttl_minutes must be in range 1..=1440".to_string(),
        ));
    }
    if session.max_sessions == 0 {
        return Err(ConfigError::Validation(
            "session.max_sessions must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    llm: Option<LlmPatch>,
    embedding: Option<EmbeddingPatch>,
    outlet_store: Option<OutletStorePatch>,
    session: Option<SessionPatch>,
    catalog: Option<CatalogPatch>,
    planner: Option<PlannerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    cors_origins: Option<Vec<String>>,
    request_deadline_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    rate_limit_per_minute: Option<u32>,
    rate_limit_max_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EmbeddingPatch {
    base_url: Option<String>,
    model: Option<String>,
    dimension: Option<usize>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct OutletStorePatch {
    url: Option<String>,
    api_key: Option<String>,
    max_connections: Option<u32>,
    connect_timeout_secs: Option<u64>,
    query_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    window: Option<usize>,
    ttl_minutes: Option<u64>,
    max_sessions: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogPatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PlannerPatch {
    known_locations: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn spec_env_vars_are_recognized() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LLM_API_KEY", "gsk-test");
        env::set_var("SQL_URL", "sqlite://outlets-env.db");
        env::set_var("PORT", "9000");
        env::set_var("CORS_ORIGINS", "http://a.test, http://b.test");
        env::set_var("SESSION_WINDOW", "5");
        env::set_var("SESSION_TTL_MIN", "15");
        env::set_var("REQUEST_DEADLINE_SECS", "45");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.server.port == 9000, "PORT should set the bind port")?;
            ensure(
                config.server.cors_origins == vec!["http://a.test", "http://b.test"],
                "CORS_ORIGINS should split and trim",
            )?;
            ensure(config.session.window == 5, "SESSION_WINDOW should set the window")?;
            ensure(config.session.ttl_minutes == 15, "SESSION_TTL_MIN should set the ttl")?;
            ensure(
                config.outlet_store.url == "sqlite://outlets-env.db",
                "SQL_URL should set the store url",
            )?;
            ensure(
                config.server.request_deadline_secs == 45,
                "REQUEST_DEADLINE_SECS should set the request budget",
            )?;
            Ok(())
        })();

        clear_vars(&[
            "LLM_API_KEY",
            "SQL_URL",
            "PORT",
            "CORS_ORIGINS",
            "SESSION_WINDOW",
            "SESSION_TTL_MIN",
            "REQUEST_DEADLINE_SECS",
        ]);
        result
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_KOPI_LLM_KEY", "gsk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("kopi.toml");
            fs::write(
                &path,
                r#"
[llm]
api_key = "${TEST_KOPI_LLM_KEY}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let key = config.llm.api_key.as_ref().ok_or("api key should be set")?;
            ensure(
                key.expose_secret() == "gsk-from-env",
                "api key should be interpolated from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_KOPI_LLM_KEY"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LLM_API_KEY", "gsk-from-env");
        env::set_var("SQL_URL", "sqlite://from-env.db");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("kopi.toml");
            fs::write(
                &path,
                r#"
[outlet_store]
url = "sqlite://from-file.db"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    sql_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.outlet_store.url == "sqlite://from-override.db",
                "programmatic override should win over env and file",
            )?;
            ensure(config.logging.level == "debug", "override log level should win")?;
            Ok(())
        })();

        clear_vars(&["LLM_API_KEY", "SQL_URL"]);
        result
    }

    #[test]
    fn validation_requires_an_llm_credential() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["LLM_API_KEY"]);

        let error = match AppConfig::load(LoadOptions::default()) {
            Ok(_) => return Err("expected validation failure without LLM_API_KEY".to_string()),
            Err(error) => error,
        };
        let mentions_key = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("llm.api_key")
        );
        ensure(mentions_key, "validation failure should mention llm.api_key")
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LLM_API_KEY", "gsk-secret-value");
        env::set_var("SQL_KEY", "sbp-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("gsk-secret-value"), "debug output should not contain llm key")?;
            ensure(!debug.contains("sbp-secret-value"), "debug output should not contain sql key")?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&["LLM_API_KEY", "SQL_KEY"]);
        result
    }

    #[test]
    fn session_window_zero_is_accepted_for_stateless_chat() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("LLM_API_KEY", "gsk-test");
        env::set_var("SESSION_WINDOW", "0");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.session.window == 0, "window zero should be allowed")
        })();

        clear_vars(&["LLM_API_KEY", "SESSION_WINDOW"]);
        result
    }
}
