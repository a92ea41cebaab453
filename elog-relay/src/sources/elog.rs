use crate::fetcher::Fetcher;
use crate::parser::{self, Encoding};
use crate::render::{wrap_lines, WRAP_COLUMNS};
use crate::types::{Credentials, FetchConfig, Section};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use interfaces::{Attachment, Entry, EntryId, EntrySource, EntryStream, SourceError};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

/// One elog logbook read over HTTP.
pub struct ElogSource {
    section_id: String,
    url: Url,
    cookie: Option<String>,
    only_latest: bool,
    fetcher: Fetcher,
}

impl ElogSource {
    pub fn new(section: &Section, fetch_config: FetchConfig) -> reqwest::Result<Self> {
        Ok(Self {
            section_id: section.id.clone(),
            url: section.source_url.clone(),
            cookie: section.credentials.as_ref().map(auth_cookie),
            only_latest: section.only_latest,
            fetcher: Fetcher::new(fetch_config)?,
        })
    }

    /// All entry ids currently listed by the logbook, ascending.
    async fn list_entry_ids(&self) -> Result<Vec<EntryId>, SourceError> {
        let mut url = self.url.clone();
        url.set_query(Some("mode=summary&reverse=1&npp=1000000"));

        let page = self.fetcher.get_text(&url, self.cookie.as_deref()).await?;
        if parser::looks_like_login_page(&page) {
            return Err(SourceError::AuthenticationFailed { url: self.url.to_string() });
        }
        Ok(parser::extract_entry_ids(&page))
    }

    async fn read_entry(&self, id: EntryId) -> Result<Entry, SourceError> {
        let permalink = self.entry_url(id)?;
        let mut url = permalink.clone();
        url.set_query(Some("cmd=download"));

        let text = self.fetcher.get_text(&url, self.cookie.as_deref()).await?;
        if parser::looks_like_login_page(&text) {
            return Err(SourceError::AuthenticationFailed { url: self.url.to_string() });
        }

        let raw = parser::parse_download(&text).map_err(|reason| SourceError::MalformedPage { entry: id, reason })?;
        if raw.id != id {
            return Err(SourceError::MalformedPage {
                entry: id,
                reason: format!("export reports entry {}", raw.id),
            });
        }

        let mut attachments = Vec::new();
        for stored in &raw.attachments {
            self.push_attachment(&mut attachments, &parser::attachment_path(stored), parser::attachment_name(stored));
        }

        let body = match raw.encoding {
            Encoding::Html => {
                for src in parser::inline_image_refs(&raw.body) {
                    let name = parser::attachment_name(&src);
                    self.push_attachment(&mut attachments, &src, name);
                }
                parser::html_to_markdown(&raw.body)
            }
            Encoding::Plain | Encoding::ElCode => raw.body,
        };
        let body = wrap_lines(&body, WRAP_COLUMNS);

        debug!("[{}] read entry {} ({} attachments)", self.section_id, id, attachments.len());
        Ok(Entry {
            id,
            parent_id: raw.parent_id,
            attributes: raw.attributes,
            body,
            attachments,
            source_url: permalink.to_string(),
        })
    }

    /// Resolves `reference` against the logbook URL; inline images that are
    /// also listed as attachments are kept once.
    fn push_attachment(&self, attachments: &mut Vec<Attachment>, reference: &str, name: String) {
        let blob_ref = match self.url.join(reference) {
            Ok(url) => url.to_string(),
            Err(e) => {
                warn!("[{}] unresolvable attachment {:?}: {}", self.section_id, reference, e);
                return;
            }
        };
        if attachments.iter().all(|a| a.blob_ref != blob_ref) {
            attachments.push(Attachment { name, blob_ref });
        }
    }

    fn entry_url(&self, id: EntryId) -> Result<Url, SourceError> {
        self.url
            .join(&id.to_string())
            .map_err(|e| SourceError::MalformedPage { entry: id, reason: e.to_string() })
    }
}

#[async_trait]
impl EntrySource for ElogSource {
    fn source_name(&self) -> String {
        format!("elog {}", self.url)
    }

    async fn fetch_since<'a>(&'a self, marker: Option<EntryId>) -> Result<EntryStream<'a>, SourceError> {
        let mut ids = self.list_entry_ids().await?;
        if self.only_latest {
            ids = ids.last().copied().into_iter().collect();
        }
        ids.retain(|id| marker.map_or(true, |m| *id > m));

        info!(
            "[{}] {} entries listed after marker {:?}",
            self.section_id,
            ids.len(),
            marker
        );
        Ok(stream::iter(ids).then(move |id| self.read_entry(id)).boxed())
    }

    async fn download_attachment(&self, attachment: &Attachment) -> Result<Vec<u8>, SourceError> {
        let url = Url::parse(&attachment.blob_ref)
            .map_err(|e| SourceError::SourceUnreachable(format!("{}: {}", attachment.blob_ref, e)))?;
        self.fetcher.get_bytes(&url, self.cookie.as_deref()).await
    }
}

/// Elog accepts the user name and the SHA-256 of the password as cookies.
fn auth_cookie(credentials: &Credentials) -> String {
    let digest = Sha256::digest(credentials.password.as_bytes());
    format!("unm={}; upwd={}", credentials.user, hex::encode(digest))
}
