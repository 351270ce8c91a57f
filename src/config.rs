//! Configuration loading: a TOML file on disk, overridden by a small
//! set of credential environment variables.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;

fn default_idle_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_poll_interval() -> u64 {
    300
}

/// IMAP connection configuration.
///
/// Credentials are read from `MAILMAP_IMAP_USERNAME` /
/// `MAILMAP_IMAP_PASSWORD` and override whatever the TOML file has.
#[derive(Clone, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    #[serde(default = "default_idle_folders")]
    pub idle_folders: Vec<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

const fn default_imap_port() -> u16 {
    993
}

impl ImapConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(username) = env::var("MAILMAP_IMAP_USERNAME") {
            self.username = username;
        }
        if let Ok(password) = env::var("MAILMAP_IMAP_PASSWORD") {
            self.password = password;
        }
    }
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("idle_folders", &self.idle_folders)
            .field("poll_interval_seconds", &self.poll_interval_seconds)
            .finish()
    }
}

/// LLM backend configuration (an Ollama-compatible `/api/generate` endpoint).
#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "qwen2.5:7b".to_string()
}
const fn default_llm_timeout() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            timeout_seconds: default_llm_timeout(),
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_categories_file")]
    pub categories_file: String,
}

fn default_store_path() -> String {
    "mailmap.db".to_string()
}
fn default_categories_file() -> String {
    "categories.txt".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            categories_file: default_categories_file(),
        }
    }
}

/// Local mbox-cache source configuration (Thunderbird-style profiles).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalCacheConfig {
    pub profile_path: Option<String>,
    pub server_filter: Option<String>,
    pub folder_filter: Option<String>,
    #[serde(default = "default_samples_per_folder")]
    pub samples_per_folder: usize,
    #[serde(default)]
    pub random_sample: bool,
    /// Cap on messages imported per folder during bulk bootstrap.
    /// `None` means no cap.
    pub import_limit: Option<usize>,
    /// Cap on messages sampled per folder when building the initial
    /// classification taxonomy. `None` means no cap.
    pub init_sample_limit: Option<usize>,
    /// Explicit source selection override (`"local"`, `"imap"`, or a
    /// qualified account id). `None` lets [`crate::source::select_source`]
    /// pick based on what else is configured.
    pub source_type: Option<String>,
}

const fn default_samples_per_folder() -> usize {
    20
}

/// Duplex-channel server configuration.
///
/// The auth token can be set via `MAILMAP_DUPLEX_TOKEN`, overriding the
/// TOML file.
#[derive(Clone, Deserialize)]
pub struct DuplexConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_duplex_host")]
    pub host: String,
    #[serde(default = "default_duplex_port")]
    pub port: u16,
    #[serde(default, skip_serializing)]
    pub auth_token: String,
}

impl std::fmt::Debug for DuplexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth_token", &"***")
            .finish()
    }
}

fn default_duplex_host() -> String {
    "127.0.0.1".to_string()
}
const fn default_duplex_port() -> u16 {
    9753
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_duplex_host(),
            port: default_duplex_port(),
            auth_token: String::new(),
        }
    }
}

impl DuplexConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("MAILMAP_DUPLEX_TOKEN") {
            self.auth_token = token;
        }
    }
}

/// Junk-folder rule engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct JunkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_skip_folders")]
    pub skip_folders: Vec<String>,
    #[serde(default = "default_spam_rules")]
    pub rules: Vec<String>,
}

const fn default_true() -> bool {
    true
}

fn default_skip_folders() -> Vec<String> {
    ["Junk", "Spam", "Deleted", "Deleted Items", "Trash"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

/// Header rules covering the common vendor spam filters, used when a
/// deployment doesn't supply its own `[junk] rules`.
pub fn default_spam_rules() -> Vec<String> {
    [
        "X-MS-Exchange-Organization-SCL >= 5",
        r"X-Microsoft-Antispam /BCL:(\d+)/ >= 7",
        "X-Spam-Flag == YES",
        "X-Spam-Status prefix Yes",
        "X-Spam-Score >= 5.0",
        "X-Rspamd-Action in reject|add header|greylist",
        "X-Rspamd-Score >= 6.0",
        "X-Barracuda-Spam-Status == Yes",
        "X-Barracuda-Spam-Score >= 3.5",
        "X-SpamExperts-Class == spam",
        "X-SpamExperts-Outgoing-Class == spam",
        "X-Spampanel-Outgoing-Class == spam",
        "X-Proofpoint-Spam-Details contains rule=spam",
        "X-IronPort-Anti-Spam-Result contains spam",
        "X-TM-AS-Result == spam",
        "X-TMASE-Result == spam",
        "X-Mimecast-Spam-Score >= 4",
        "X-Ovh-Spam-Reason exists",
        "X-VR-SpamCause exists",
        "X-Spam == Yes",
        "X-IP-Spam-Verdict == spam",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for JunkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_folders: default_skip_folders(),
            rules: default_spam_rules(),
        }
    }
}

/// The full runtime configuration, loaded from a TOML file and
/// overridden with environment-variable credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub imap: ImapConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub local_cache: LocalCacheConfig,
    #[serde(default)]
    pub duplex: DuplexConfig,
    #[serde(default)]
    pub junk: JunkConfig,
}

impl Config {
    /// Load configuration from a TOML file, applying credential
    /// environment-variable overrides afterward.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse
    /// as valid configuration TOML.
    pub fn load(path: &Path) -> Result<Self> {
        dotenvy::dotenv().ok();
        let text = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&text)?;
        config.imap.apply_env_overrides();
        config.duplex.apply_env_overrides();
        if config.imap.username.is_empty() {
            return Err(Error::Config(
                "IMAP username not set (MAILMAP_IMAP_USERNAME or config file)".to_string(),
            ));
        }
        Ok(config)
    }
}
