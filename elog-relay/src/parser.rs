//! Parsing of the two elog representations the relay reads: the summary
//! listing page (HTML) and the per-entry `?cmd=download` text export.
//!
//! The export looks like
//!
//! ```text
//! $@MID@$: 12
//! Date: Mon, 02 Oct 2023 10:10:10 +0200
//! In reply to: 11
//! Author: John
//! Subject: Pump check
//! Attachment: 231002_101010_pump.png
//! Encoding: HTML
//! ========================================
//! <p>body</p>
//! ```

use std::collections::BTreeSet;
use std::sync::LazyLock;

use interfaces::{Attributes, EntryId};
use regex::Regex;
use tracing::debug;

pub const ID_ATTRIBUTE: &str = "$@MID@$";
pub const PARENT_ATTRIBUTE: &str = "In reply to";
pub const CHILDREN_ATTRIBUTE: &str = "Reply to";
pub const ATTACHMENT_ATTRIBUTE: &str = "Attachment";
pub const ENCODING_ATTRIBUTE: &str = "Encoding";

static ENTRY_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="(?:[^"]*/)?(\d+)(?:[?#][^"]*)?""#).unwrap());
static IMAGE_SRC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<img\b[^>]*\bsrc\s*=\s*"([^"]+)""#).unwrap());
static STORED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{6})_(\d{6}_(.+))$").unwrap());
static BACKSLASH_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\([!-/:-@\[-`{-~])").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Html,
    Plain,
    ElCode,
}

impl Encoding {
    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "html" => Encoding::Html,
            "elcode" => Encoding::ElCode,
            _ => Encoding::Plain,
        }
    }
}

/// One entry as exported by the logbook, before URLs are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    pub id: EntryId,
    pub parent_id: Option<EntryId>,
    /// User-facing attributes; the structural ones above are removed.
    pub attributes: Attributes,
    /// Attachment storage names relative to the logbook URL.
    pub attachments: Vec<String>,
    pub encoding: Encoding,
    pub body: String,
}

/// Entry ids linked from a summary listing, ascending and deduplicated.
/// Draft rows have no numeric link and are not returned.
pub fn extract_entry_ids(listing: &str) -> Vec<EntryId> {
    let ids: BTreeSet<EntryId> = ENTRY_LINK
        .captures_iter(listing)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    ids.into_iter().collect()
}

/// Elog answers unauthenticated requests with its login form and HTTP 200.
pub fn looks_like_login_page(page: &str) -> bool {
    page.contains(r#"name="upassword""#) || page.contains(r#"name="uname""#)
}

pub fn parse_download(text: &str) -> Result<RawEntry, String> {
    let mut lines = text.split_inclusive('\n');
    let mut header = Vec::new();
    let mut separated = false;

    for line in lines.by_ref() {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.len() >= 10 && trimmed.chars().all(|c| c == '=') {
            separated = true;
            break;
        }
        if !trimmed.is_empty() {
            header.push(trimmed);
        }
    }
    if !separated {
        return Err("missing header separator".to_string());
    }
    let body: String = lines.collect();

    let mut attributes = Attributes::new();
    let mut id = None;
    let mut parent_id = None;
    let mut attachments = Vec::new();
    let mut encoding = Encoding::Plain;

    for line in header {
        let Some((name, value)) = line.split_once(':') else {
            debug!("Ignoring header line without separator: {:?}", line);
            continue;
        };
        let value = value.trim();
        match name.trim() {
            ID_ATTRIBUTE => {
                id = Some(value.parse::<EntryId>().map_err(|_| format!("invalid entry id {value:?}"))?);
            }
            PARENT_ATTRIBUTE => {
                parent_id = value.parse::<EntryId>().ok().filter(|parent| *parent > 0);
            }
            CHILDREN_ATTRIBUTE => {}
            ATTACHMENT_ATTRIBUTE => {
                attachments.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|a| !a.is_empty())
                        .map(str::to_string),
                );
            }
            ENCODING_ATTRIBUTE => encoding = Encoding::parse(value),
            other => attributes.insert(other, value),
        }
    }

    let id = id.ok_or_else(|| format!("missing {ID_ATTRIBUTE} header"))?;
    Ok(RawEntry {
        id,
        parent_id,
        attributes,
        attachments,
        encoding,
        body: body.trim_end().to_string(),
    })
}

/// Elog stores `231002_101010_pump.png` under `231002/101010_pump.png`.
pub fn attachment_path(stored: &str) -> String {
    match STORED_NAME.captures(stored) {
        Some(caps) => format!("{}/{}", &caps[1], &caps[2]),
        None => stored.to_string(),
    }
}

/// File name without the logbook's timestamp prefix.
pub fn attachment_name(stored: &str) -> String {
    let file = stored.rsplit('/').next().unwrap_or(stored);
    match STORED_NAME.captures(file) {
        Some(caps) => caps[3].to_string(),
        None => file.to_string(),
    }
}

/// `src` values of inline images, in document order.
pub fn inline_image_refs(html: &str) -> Vec<String> {
    IMAGE_SRC
        .captures_iter(html)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Converts an HTML body to Markdown, without the backslash escapes the
/// converter puts in front of punctuation.
pub fn html_to_markdown(html: &str) -> String {
    let markdown = fast_html2md::parse_html(html, false);
    unescape_markdown(markdown.trim())
}

/// Drops the backslash in front of escaped ASCII punctuation.
pub fn unescape_markdown(text: &str) -> String {
    BACKSLASH_ESCAPE.replace_all(text, "$1").into_owned()
}
