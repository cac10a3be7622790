use std::path::PathBuf;
use std::time::Duration;

use payclass_adapters::{OpenAiConfig, ProviderKind};
use payclass_storage::{BackoffPolicy, HttpClientConfig};

use crate::machine::StallPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` keeps everything in memory.
    pub database_url: Option<String>,
    pub provider: ProviderKind,
    pub openai: OpenAiConfig,
    pub cache_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub artifacts_base_url: String,
    pub keyword_rules_path: PathBuf,
    pub poll_interval: Duration,
    pub expansion_chunk_size: usize,
    pub stall: StallPolicy,
    pub retention: chrono::Duration,
    pub store_backoff: BackoffPolicy,
    pub provider_backoff: BackoffPolicy,
    pub scheduler_enabled: bool,
    pub cleanup_cron: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            provider: ProviderKind::Fixture,
            openai: OpenAiConfig::default(),
            cache_dir: PathBuf::from("./cache"),
            artifacts_dir: PathBuf::from("./artifacts"),
            artifacts_base_url: "/artifacts".to_string(),
            keyword_rules_path: PathBuf::from("rules/keywords.yaml"),
            poll_interval: Duration::from_secs(30),
            expansion_chunk_size: 1_000,
            stall: StallPolicy::default(),
            retention: chrono::Duration::days(30),
            store_backoff: BackoffPolicy::default(),
            provider_backoff: BackoffPolicy::default(),
            scheduler_enabled: false,
            cleanup_cron: "0 */30 * * * *".to_string(),
            web_port: 8000,
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let stall_defaults = defaults.stall;

        let openai = OpenAiConfig {
            api_base: env_string("PAYCLASS_OPENAI_BASE").unwrap_or(defaults.openai.api_base),
            api_key: env_string("OPENAI_API_KEY").unwrap_or_default(),
            model: env_string("PAYCLASS_MODEL").unwrap_or(defaults.openai.model),
            completion_window: defaults.openai.completion_window,
            http: HttpClientConfig {
                timeout: env_parse("PAYCLASS_HTTP_TIMEOUT_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.openai.http.timeout),
                user_agent: env_string("PAYCLASS_USER_AGENT")
                    .or(Some("payclass/0.1".to_string())),
            },
        };

        let hours = |name: &str, fallback: chrono::Duration| {
            env_parse::<i64>(name)
                .map(chrono::Duration::hours)
                .unwrap_or(fallback)
        };

        Self {
            database_url: env_string("DATABASE_URL"),
            provider: env_string("PAYCLASS_PROVIDER")
                .and_then(|v| ProviderKind::parse(&v))
                .unwrap_or(ProviderKind::OpenAi),
            openai,
            cache_dir: env_string("PAYCLASS_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            artifacts_dir: env_string("PAYCLASS_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            artifacts_base_url: env_string("PAYCLASS_ARTIFACTS_BASE_URL")
                .unwrap_or(defaults.artifacts_base_url),
            keyword_rules_path: env_string("PAYCLASS_KEYWORD_RULES")
                .map(PathBuf::from)
                .unwrap_or(defaults.keyword_rules_path),
            poll_interval: env_parse("PAYCLASS_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            expansion_chunk_size: env_parse("PAYCLASS_EXPANSION_CHUNK")
                .unwrap_or(defaults.expansion_chunk_size),
            stall: StallPolicy {
                queue_timeout: hours("PAYCLASS_QUEUE_TIMEOUT_HOURS", stall_defaults.queue_timeout),
                stall_timeout: hours("PAYCLASS_STALL_TIMEOUT_HOURS", stall_defaults.stall_timeout),
                hard_ceiling: hours("PAYCLASS_HARD_CEILING_HOURS", stall_defaults.hard_ceiling),
                auto_cancel_enabled: env_flag("PAYCLASS_AUTO_CANCEL")
                    .unwrap_or(stall_defaults.auto_cancel_enabled),
                ..stall_defaults
            },
            retention: env_parse::<i64>("PAYCLASS_RETENTION_DAYS")
                .map(chrono::Duration::days)
                .unwrap_or(defaults.retention),
            store_backoff: defaults.store_backoff,
            provider_backoff: defaults.provider_backoff,
            scheduler_enabled: env_flag("PAYCLASS_SCHEDULER_ENABLED")
                .unwrap_or(defaults.scheduler_enabled),
            cleanup_cron: env_string("CLEANUP_CRON").unwrap_or(defaults.cleanup_cron),
            web_port: env_parse("PAYCLASS_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}
