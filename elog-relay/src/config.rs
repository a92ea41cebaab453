//! Relay configuration.
//!
//! One TOML file: a `[META]` table with process-wide settings, and one table
//! per relayed logbook. See `config.example.toml` for every key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::ledger::validate_table_name;
use crate::publisher::PublisherConfig;
use crate::render::{Renderer, DEFAULT_SUBJECT_TEMPLATE};
use crate::types::{Credentials, FetchConfig, RenderTemplates, Section};

pub const META_TABLE: &str = "META";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[{section}] {message}")]
    Invalid { section: String, message: String },
}

fn invalid(section: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section: section.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaConfig {
    #[serde(default = "default_database")]
    pub database: String,
    /// Zulip credentials; required unless running dry.
    pub zulip_rc: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_rotation: LogRotation,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
}

fn default_database() -> String {
    "sqlite://elog-relay.db".to_string()
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_poll_interval() -> u64 {
    60
}

fn default_http_timeout() -> u64 {
    30
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            zulip_rc: None,
            log_file: None,
            log_level: default_log_level(),
            log_rotation: LogRotation::default(),
            poll_interval_secs: default_poll_interval(),
            http_timeout_secs: default_http_timeout(),
            publish_attempts: default_publish_attempts(),
        }
    }
}

impl MetaConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            timeout_seconds: self.http_timeout_secs,
            ..FetchConfig::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            max_attempts: self.publish_attempts,
            call_timeout: Duration::from_secs(self.http_timeout_secs * 2),
            ..PublisherConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawSection {
    elog_url: String,
    #[serde(default)]
    elog_credentials: Option<(String, String)>,
    zulip_stream: String,
    #[serde(default)]
    zulip_topic: String,
    db_table: String,
    #[serde(default)]
    elog_subject: Option<String>,
    #[serde(default)]
    elog_prefix: String,
    #[serde(default = "default_true")]
    quote: bool,
    #[serde(default)]
    show_header: bool,
    #[serde(default)]
    only_latest: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "META", default)]
    meta: MetaConfig,
    #[serde(flatten)]
    sections: BTreeMap<String, RawSection>,
}

/// Validated configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub meta: MetaConfig,
    /// Sections in table-name order.
    pub sections: Vec<Section>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;

        if raw.meta.poll_interval_secs == 0 {
            return Err(invalid(META_TABLE, "poll-interval-secs must be positive"));
        }
        if raw.meta.publish_attempts == 0 {
            return Err(invalid(META_TABLE, "publish-attempts must be positive"));
        }
        if raw.sections.is_empty() {
            return Err(invalid(META_TABLE, "no sections configured"));
        }

        let renderer = Renderer::new();
        let sections = raw
            .sections
            .into_iter()
            .map(|(id, section)| build_section(&renderer, id, section))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            meta: raw.meta,
            sections,
        })
    }
}

fn build_section(renderer: &Renderer, id: String, raw: RawSection) -> Result<Section, ConfigError> {
    // Entry permalinks are joined onto the logbook URL, which needs a trailing slash.
    let mut url = raw.elog_url.trim().to_string();
    if !url.ends_with('/') {
        url.push('/');
    }
    let source_url = Url::parse(&url).map_err(|e| invalid(&id, format!("elog-url {url:?}: {e}")))?;
    if !matches!(source_url.scheme(), "http" | "https") {
        return Err(invalid(&id, format!("elog-url {url:?} is not http(s)")));
    }

    if raw.zulip_stream.trim().is_empty() {
        return Err(invalid(&id, "zulip-stream is empty"));
    }
    validate_table_name(&raw.db_table).map_err(|e| invalid(&id, e.to_string()))?;

    let templates = RenderTemplates {
        prefix: raw.elog_prefix,
        subject: raw.elog_subject.unwrap_or_else(|| DEFAULT_SUBJECT_TEMPLATE.to_string()),
        topic: raw.zulip_topic,
    };
    for (key, template) in [
        ("elog-prefix", &templates.prefix),
        ("elog-subject", &templates.subject),
        ("zulip-topic", &templates.topic),
    ] {
        renderer
            .validate(template)
            .map_err(|e| invalid(&id, format!("{key}: {e}")))?;
    }

    Ok(Section {
        source_url,
        credentials: raw
            .elog_credentials
            .map(|(user, password)| Credentials { user, password }),
        chat_stream: raw.zulip_stream,
        ledger_table: raw.db_table,
        templates,
        quote: raw.quote,
        show_header: raw.show_header,
        only_latest: raw.only_latest,
        id,
    })
}
