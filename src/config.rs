//! Configuration types, built from environment variables.
//!
//! Every component receives its settings explicitly; nothing reads the
//! environment after `AppConfig::from_env()` returns.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig};
use crate::store::model::OrderMode;

/// Default subject substring that marks an email as a postcard order.
pub const DEFAULT_SUBJECT_FILTER: &str = "Fammail Postcard";

/// Default print-mail API base URL.
pub const DEFAULT_PROVIDER_URL: &str = "https://api.postgrid.com/print-mail/v1";

/// IMAP mailbox connection settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub tls: bool,
    pub mailbox: String,
    pub timeout: Duration,
}

/// What to do with mail already sitting in the inbox at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatchUpMode {
    /// Skip the backlog; only record where new mail starts.
    #[default]
    None,
    /// Run the full pipeline over the backlog.
    Process,
    /// Evaluate gating over the backlog without creating records or calling out.
    DryRun,
}

impl FromStr for CatchUpMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "process" => Ok(Self::Process),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            other => Err(ConfigError::InvalidValue {
                key: "FAMMAIL_CATCH_UP".into(),
                message: format!("expected none, process or dry-run, got '{other}'"),
            }),
        }
    }
}

/// Mailbox watcher scheduling.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    pub initial_sync_days: u32,
    pub catch_up: CatchUpMode,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            initial_sync_days: 7,
            catch_up: CatchUpMode::None,
        }
    }
}

/// Per-message gating and parsing settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Case-insensitive substring the subject must contain.
    pub subject_filter: String,
    /// Skip messages without an image attachment.
    pub require_image: bool,
    /// Sender allowlist (`*`, `@domain`, `domain`, or full address).
    pub allowed_senders: Vec<String>,
    /// Country code used when an address omits it.
    pub default_country: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            subject_filter: DEFAULT_SUBJECT_FILTER.to_string(),
            require_image: false,
            allowed_senders: vec!["*".to_string()],
            default_country: "US".to_string(),
        }
    }
}

/// Print-mail provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub test_api_key: SecretString,
    pub live_api_key: SecretString,
    /// Mode the operator asked for.
    pub mode: OrderMode,
    /// Overrides `mode` to test when set.
    pub force_test_mode: bool,
    pub postcard_size: String,
    pub timeout: Duration,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mailbox: MailboxConfig,
    pub watch: WatchConfig,
    pub pipeline: PipelineSettings,
    pub provider: ProviderConfig,
    pub llm: Option<LlmConfig>,
    pub db_path: PathBuf,
}

impl AppConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let host = env
            .string("FAMMAIL_IMAP_HOST")
            .ok_or_else(|| ConfigError::MissingEnvVar("FAMMAIL_IMAP_HOST".into()))?;

        let mailbox = MailboxConfig {
            host,
            port: env.parse("FAMMAIL_IMAP_PORT", 993)?,
            username: env.string("FAMMAIL_IMAP_USERNAME").unwrap_or_default(),
            password: SecretString::from(env.string("FAMMAIL_IMAP_PASSWORD").unwrap_or_default()),
            tls: env.bool("FAMMAIL_IMAP_TLS", true)?,
            mailbox: env
                .string("FAMMAIL_MAILBOX")
                .unwrap_or_else(|| "INBOX".to_string()),
            timeout: Duration::from_secs(env.parse("FAMMAIL_IMAP_TIMEOUT_SECS", 30)?),
        };

        let watch = WatchConfig {
            poll_interval: Duration::from_secs(env.parse("FAMMAIL_POLL_INTERVAL_SECS", 60)?),
            initial_sync_days: env.parse("FAMMAIL_INITIAL_SYNC_DAYS", 7)?,
            catch_up: env
                .string("FAMMAIL_CATCH_UP")
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or_default(),
        };
        if watch.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "FAMMAIL_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }

        let allowed_senders = match env.string("FAMMAIL_ALLOWED_SENDERS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => vec!["*".to_string()],
        };

        let pipeline = PipelineSettings {
            subject_filter: env
                .string("FAMMAIL_SUBJECT_FILTER")
                .unwrap_or_else(|| DEFAULT_SUBJECT_FILTER.to_string()),
            require_image: env.bool("FAMMAIL_REQUIRE_IMAGE", false)?,
            allowed_senders,
            default_country: env
                .string("FAMMAIL_DEFAULT_COUNTRY")
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_else(|| "US".to_string()),
        };

        let provider = ProviderConfig {
            base_url: env
                .string("FAMMAIL_PROVIDER_URL")
                .unwrap_or_else(|| DEFAULT_PROVIDER_URL.to_string()),
            test_api_key: SecretString::from(env.string("FAMMAIL_PROVIDER_TEST_KEY").unwrap_or_default()),
            live_api_key: SecretString::from(env.string("FAMMAIL_PROVIDER_LIVE_KEY").unwrap_or_default()),
            mode: env
                .string("FAMMAIL_PROVIDER_MODE")
                .map(|s| {
                    s.parse().map_err(|_| ConfigError::InvalidValue {
                        key: "FAMMAIL_PROVIDER_MODE".into(),
                        message: format!("expected test or live, got '{s}'"),
                    })
                })
                .transpose()?
                .unwrap_or(OrderMode::Test),
            force_test_mode: env.bool("FAMMAIL_FORCE_TEST_MODE", false)?,
            postcard_size: env
                .string("FAMMAIL_POSTCARD_SIZE")
                .unwrap_or_else(|| "6x4".to_string()),
            timeout: Duration::from_secs(env.parse("FAMMAIL_PROVIDER_TIMEOUT_SECS", 30)?),
        };

        let llm = match env.string("FAMMAIL_LLM_API_KEY") {
            Some(api_key) => {
                let backend = match env
                    .string("FAMMAIL_LLM_BACKEND")
                    .map(|b| b.trim().to_ascii_lowercase())
                    .as_deref()
                {
                    None | Some("anthropic") => LlmBackend::Anthropic,
                    Some("openai") => LlmBackend::OpenAi,
                    Some(other) => {
                        return Err(ConfigError::InvalidValue {
                            key: "FAMMAIL_LLM_BACKEND".into(),
                            message: format!("unknown backend '{other}'"),
                        });
                    }
                };
                let model = env
                    .string("FAMMAIL_LLM_MODEL")
                    .unwrap_or_else(|| backend.default_model().to_string());
                Some(LlmConfig {
                    backend,
                    api_key: SecretString::from(api_key),
                    model,
                })
            }
            None => None,
        };

        let db_path = env
            .string("FAMMAIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/fammail.db"));

        Ok(Self {
            mailbox,
            watch,
            pipeline,
            provider,
            llm,
            db_path,
        })
    }
}

/// Typed accessors over a string lookup.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected a boolean, got '{raw}'"),
            }),
            None => Ok(default),
        }
    }
}

/// Strict boolean parsing: anything outside the accepted spellings is rejected.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
