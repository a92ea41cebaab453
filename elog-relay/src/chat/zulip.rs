//! Zulip REST API backend.
//!
//! Only the two calls the relay needs are implemented: posting a stream
//! message and uploading a file. Zulip has no native reply threading inside a
//! topic, so a reply is anchored by a link to the parent message on its first
//! line.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use interfaces::{ChatBackend, ChatMessageId, OutgoingMessage, PublishError};
use reqwest::header::RETRY_AFTER;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::ConfigError;
use crate::types::FetchConfig;

/// Credentials read from a `zuliprc` file.
#[derive(Clone, PartialEq, Eq)]
pub struct ZulipConfig {
    pub email: String,
    pub api_key: String,
    pub site: Url,
}

impl std::fmt::Debug for ZulipConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZulipConfig")
            .field("email", &self.email)
            .field("api_key", &"***")
            .field("site", &self.site.as_str())
            .finish()
    }
}

impl ZulipConfig {
    pub fn from_zuliprc(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_zuliprc(&text)
    }

    /// Parses the `[api]` table of a zuliprc (`email`, `key`, `site`).
    pub fn parse_zuliprc(text: &str) -> Result<Self, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            section: "zuliprc".to_string(),
            message,
        };

        let mut in_api = false;
        let (mut email, mut key, mut site) = (None, None, None);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                in_api = line[1..line.len() - 1].trim() == "api";
                continue;
            }
            if !in_api {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(invalid(format!("malformed line {line:?}")));
            };
            let value = value.trim().to_string();
            match name.trim() {
                "email" => email = Some(value),
                "key" => key = Some(value),
                "site" => site = Some(value),
                _ => {}
            }
        }

        let email = email.ok_or_else(|| invalid("missing api.email".to_string()))?;
        let api_key = key.ok_or_else(|| invalid("missing api.key".to_string()))?;
        let site = site.ok_or_else(|| invalid("missing api.site".to_string()))?;
        let mut site = Url::parse(&site).map_err(|e| invalid(format!("api.site {site:?}: {e}")))?;
        if !site.path().ends_with('/') {
            let path = format!("{}/", site.path());
            site.set_path(&path);
        }

        Ok(Self { email, api_key, site })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZulipResponse {
    #[serde(default)]
    result: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

pub struct ZulipBackend {
    client: Client,
    config: ZulipConfig,
}

impl ZulipBackend {
    pub fn new(config: ZulipConfig, fetch_config: &FetchConfig) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(&fetch_config.user_agent)
            .timeout(Duration::from_secs(fetch_config.timeout_seconds))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> Result<Url, PublishError> {
        self.config
            .site
            .join(path)
            .map_err(|e| PublishError::PermissionDenied(format!("bad Zulip site URL: {e}")))
    }

    /// Permalink of a message, used as the reply anchor line.
    pub fn message_link(&self, id: ChatMessageId) -> String {
        format!("{}#narrow/near/{}", self.config.site, id)
    }

    async fn read_response(response: Response, stream: &str) -> Result<ZulipResponse, PublishError> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);

        let body = response.text().await.map_err(transport_error)?;
        let parsed: ZulipResponse = serde_json::from_str(&body).unwrap_or_else(|_| ZulipResponse {
            msg: body.chars().take(200).collect(),
            ..Default::default()
        });

        if status.is_success() && parsed.result == "success" {
            return Ok(parsed);
        }
        Err(classify_failure(status, parsed.code.as_deref(), &parsed.msg, retry_after, stream))
    }
}

#[async_trait]
impl ChatBackend for ZulipBackend {
    async fn send_message(&self, message: &OutgoingMessage) -> Result<ChatMessageId, PublishError> {
        let content = match message.reply_to {
            Some(parent) => format!("[in reply to]({})\n{}", self.message_link(parent), message.content),
            None => message.content.clone(),
        };
        let url = self.endpoint("api/v1/messages")?;
        debug!("POST {} ({} / {})", url, message.stream, message.topic);

        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .form(&[
                ("type", "stream"),
                ("to", message.stream.as_str()),
                ("topic", message.topic.as_str()),
                ("content", content.as_str()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let parsed = Self::read_response(response, &message.stream).await?;
        parsed
            .id
            .map(ChatMessageId)
            .ok_or_else(|| PublishError::TransientNetworkError("response without message id".to_string()))
    }

    async fn upload_file(&self, name: &str, data: Vec<u8>) -> Result<String, PublishError> {
        let url = self.endpoint("api/v1/user_uploads")?;
        debug!("POST {} ({}, {} bytes)", url, name, data.len());

        let form = Form::new().part("file", Part::bytes(data).file_name(name.to_string()));
        let response = self
            .client
            .post(url)
            .basic_auth(&self.config.email, Some(&self.config.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        let parsed = Self::read_response(response, "").await?;
        parsed.url.or(parsed.uri).ok_or_else(|| {
            warn!("Upload of {} returned no URI", name);
            PublishError::TransientNetworkError("upload response without uri".to_string())
        })
    }
}

fn transport_error(error: reqwest::Error) -> PublishError {
    PublishError::TransientNetworkError(error.to_string())
}

/// Error codes Zulip uses for credential and account problems.
const AUTH_CODES: &[&str] = &["UNAUTHORIZED", "INVALID_API_KEY", "USER_DEACTIVATED", "REALM_DEACTIVATED"];

/// Maps a failed Zulip API answer onto the publish error taxonomy. Only
/// credential problems and a missing stream concern the whole section; any
/// other 4xx refers to the one message that was sent.
pub fn classify_failure(
    status: StatusCode,
    code: Option<&str>,
    msg: &str,
    retry_after: Option<Duration>,
    stream: &str,
) -> PublishError {
    if status == StatusCode::TOO_MANY_REQUESTS || code == Some("RATE_LIMIT_HIT") {
        return PublishError::RateLimited { retry_after };
    }
    if code == Some("STREAM_DOES_NOT_EXIST") {
        return PublishError::StreamNotFound {
            stream: stream.to_string(),
        };
    }
    if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || code.is_some_and(|code| AUTH_CODES.contains(&code))
    {
        return PublishError::PermissionDenied(format!("HTTP {status}: {msg}"));
    }
    if status.is_server_error() {
        return PublishError::TransientNetworkError(format!("HTTP {status}: {msg}"));
    }
    PublishError::Rejected(format!("HTTP {status}: {msg}"))
}
