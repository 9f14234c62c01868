use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Clear-HTTP provider proxy port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// HTTPS-CONNECT interception port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Dashboard / management API port.
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Per-provider default base URLs. Keys are provider names
    /// (`openai`, `anthropic`, `ollama`, ...).
    #[serde(default = "default_provider_urls")]
    pub provider_urls: HashMap<String, String>,
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,
    #[serde(default = "default_ca_cert")]
    pub ca_cert: String,
    #[serde(default = "default_ca_key")]
    pub ca_key: String,
    #[serde(default = "default_server_cert")]
    pub server_cert: String,
    #[serde(default = "default_server_key")]
    pub server_key: String,
    /// Named system prompts, inline text keyed by name.
    #[serde(default)]
    pub prompts: HashMap<String, String>,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_vec_db_path")]
    pub vec_db_path: PathBuf,
    #[serde(default = "default_model_base_path")]
    pub model_base_path: PathBuf,
    /// Cosine similarity floor below which a package lookup is "unknown".
    #[serde(default = "default_vec_similarity_floor")]
    pub vec_similarity_floor: f32,
    /// Optional secret-signature catalog (YAML). Built-in catalog otherwise.
    #[serde(default)]
    pub signatures_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_port() -> u16 {
    8989
}
fn default_proxy_port() -> u16 {
    8990
}
fn default_api_port() -> u16 {
    9090
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
fn default_certs_dir() -> PathBuf {
    PathBuf::from("./codegate_volume/certs")
}
fn default_ca_cert() -> String {
    "ca.crt".to_string()
}
fn default_ca_key() -> String {
    "ca.key".to_string()
}
fn default_server_cert() -> String {
    "server.crt".to_string()
}
fn default_server_key() -> String {
    "server.key".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("./codegate_volume/db/codegate.db")
}
fn default_vec_db_path() -> PathBuf {
    PathBuf::from("./codegate_volume/vectordb.db")
}
fn default_model_base_path() -> PathBuf {
    PathBuf::from("./codegate_volume/models")
}
fn default_vec_similarity_floor() -> f32 {
    0.85
}

fn default_provider_urls() -> HashMap<String, String> {
    [
        ("openai", "https://api.openai.com"),
        ("anthropic", "https://api.anthropic.com"),
        ("ollama", "http://localhost:11434"),
        ("llamacpp", "http://localhost:8080"),
        ("vllm", "http://localhost:8000"),
        ("openrouter", "https://openrouter.ai/api"),
        ("lm_studio", "http://localhost:1234"),
        ("copilot", "https://api.githubcopilot.com"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: default_port(),
            proxy_port: default_proxy_port(),
            api_port: default_api_port(),
            host: default_host(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            provider_urls: default_provider_urls(),
            certs_dir: default_certs_dir(),
            ca_cert: default_ca_cert(),
            ca_key: default_ca_key(),
            server_cert: default_server_cert(),
            server_key: default_server_key(),
            prompts: HashMap::new(),
            db_path: default_db_path(),
            vec_db_path: default_vec_db_path(),
            model_base_path: default_model_base_path(),
            vec_similarity_floor: default_vec_similarity_floor(),
            signatures_path: None,
        }
    }
}

impl Config {
    /// Load a config file. Search order when no explicit path is given:
    /// `./codegate.yaml`, `./codegate.yml`, `~/.config/codegate/codegate.yaml`.
    /// A missing file is fine (defaults); a malformed file is a
    /// `ConfigError` so startup fails fast instead of running misconfigured.
    pub fn load(path: Option<&str>) -> Result<Self, GatewayError> {
        let candidates = match path {
            Some(p) => vec![PathBuf::from(p)],
            None => vec![
                PathBuf::from("codegate.yaml"),
                PathBuf::from("codegate.yml"),
                dirs_next::home_dir()
                    .map(|h| h.join(".config").join("codegate").join("codegate.yaml"))
                    .unwrap_or_default(),
            ],
        };

        let explicit = path.is_some();
        for candidate in &candidates {
            if !candidate.exists() {
                if explicit {
                    return Err(GatewayError::Config(format!(
                        "config file not found: {}",
                        candidate.display()
                    )));
                }
                continue;
            }
            let contents = std::fs::read_to_string(candidate).map_err(|e| {
                GatewayError::Config(format!("cannot read {}: {e}", candidate.display()))
            })?;
            let mut config: Config = serde_yaml::from_str(&contents).map_err(|e| {
                GatewayError::Config(format!("cannot parse {}: {e}", candidate.display()))
            })?;
            tracing::info!("loaded config from {}", candidate.display());
            config.apply_env();
            config.validate()?;
            return Ok(config);
        }

        tracing::info!("no config file found, using defaults");
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `CODEGATE_*` environment overrides sit between the YAML file and the
    /// CLI flags.
    fn apply_env(&mut self) {
        if let Some(v) = env_u16("CODEGATE_PORT") {
            self.port = v;
        }
        if let Some(v) = env_u16("CODEGATE_PROXY_PORT") {
            self.proxy_port = v;
        }
        if let Some(v) = env_u16("CODEGATE_API_PORT") {
            self.api_port = v;
        }
        if let Ok(v) = std::env::var("CODEGATE_HOST") {
            self.host = v;
        }
        if let Ok(v) = std::env::var("CODEGATE_LOG_LEVEL") {
            if let Ok(level) = serde_yaml::from_str(&v) {
                self.log_level = level;
            }
        }
        if let Ok(v) = std::env::var("CODEGATE_LOG_FORMAT") {
            if let Ok(format) = serde_yaml::from_str(&v) {
                self.log_format = format;
            }
        }
        if let Ok(v) = std::env::var("CODEGATE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CODEGATE_VEC_DB_PATH") {
            self.vec_db_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CODEGATE_CERTS_DIR") {
            self.certs_dir = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.port == 0 {
            return Err(GatewayError::Config("port must be in 1-65535".into()));
        }
        let mut ports = [self.port, self.proxy_port, self.api_port];
        ports.sort_unstable();
        if ports.windows(2).any(|w| w[0] == w[1]) {
            return Err(GatewayError::Config(
                "port, proxy_port and api_port must be distinct".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.vec_similarity_floor) {
            return Err(GatewayError::Config(
                "vec_similarity_floor must be in 0.0-1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir.join(&self.ca_cert)
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.certs_dir.join(&self.ca_key)
    }

    /// Default base URL for a provider name, if configured.
    pub fn provider_url(&self, name: &str) -> Option<&str> {
        self.provider_urls.get(name).map(|s| s.as_str())
    }
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
