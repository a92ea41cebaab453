//! Turns an entry into chat message text.
//!
//! Templates use minijinja (`{{ Author }}`, `{{ Type | lower }}`, ...) over
//! the entry's attributes. Undefined names render as empty strings, so one
//! entry with an unusual attribute set never blocks a batch. Rendering reads
//! nothing but its arguments: no clock, no environment.

use std::collections::BTreeMap;

use interfaces::Entry;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};

use crate::types::Section;

/// Longest message the chat backend accepts, in characters.
pub const MAX_MESSAGE_CHARS: usize = 9_999;
pub const MAX_TOPIC_CHARS: usize = 60;
/// Room kept free in the first message of a reply for the backend's anchor
/// line.
pub const REPLY_ANCHOR_RESERVE: usize = 200;
/// Column at which converted entry bodies are re-wrapped.
pub const WRAP_COLUMNS: usize = 80;
pub const FALLBACK_TOPIC: &str = "no topic";
pub const DEFAULT_SUBJECT_TEMPLATE: &str = r#"[{{ Subject | default("no subject") }}]({{ EntryUrl }}):"#;

const QUOTE_OPEN: &str = "```quote\n";
const QUOTE_CLOSE: &str = "\n```";

#[derive(Debug, thiserror::Error)]
#[error("template error: {0}")]
pub struct TemplateError(#[from] minijinja::Error);

/// Everything needed to post one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub topic: String,
    /// Message bodies in posting order; the first carries the subject line.
    pub chunks: Vec<String>,
}

pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.add_filter("length", length);
        env.add_filter("count", length);
        Self { env }
    }

    /// Checks template syntax without rendering anything.
    pub fn validate(&self, template: &str) -> Result<(), TemplateError> {
        self.env.template_from_str(template)?;
        Ok(())
    }

    pub fn render(&self, template: &str, entry: &Entry) -> Result<String, TemplateError> {
        Ok(self.env.render_str(template, template_context(entry))?)
    }

    pub fn render_message(&self, section: &Section, entry: &Entry) -> Result<RenderedMessage, TemplateError> {
        let templates = &section.templates;
        let subject = self.render(&templates.subject, entry)?;
        let prefix = self.render(&templates.prefix, entry)?;
        let topic = normalize_topic(&self.render(&templates.topic, entry)?);

        let mut lead = Vec::new();
        if section.show_header {
            lead.push(header_table(entry));
        }
        lead.push(subject);
        if !prefix.trim().is_empty() {
            lead.push(prefix);
        }
        let lead = lead.join("\n");

        let budget = if section.quote {
            MAX_MESSAGE_CHARS - QUOTE_OPEN.len() - QUOTE_CLOSE.len()
        } else {
            MAX_MESSAGE_CHARS
        };
        let mut bodies: Vec<String> = assemble_chunks(split_lines(&entry.body, budget), budget)
            .into_iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .map(|chunk| if section.quote { quote_block(&chunk) } else { chunk })
            .collect();

        let first_limit = if entry.is_reply() {
            MAX_MESSAGE_CHARS - REPLY_ANCHOR_RESERVE
        } else {
            MAX_MESSAGE_CHARS
        };

        let mut chunks = Vec::with_capacity(bodies.len() + 1);
        if !bodies.is_empty() && char_len(&lead) + 1 + char_len(&bodies[0]) <= first_limit {
            let first = bodies.remove(0);
            chunks.push(format!("{lead}\n{first}"));
        } else if char_len(&lead) <= first_limit {
            chunks.push(lead);
        } else {
            chunks.extend(assemble_chunks(split_lines(&lead, first_limit), first_limit));
        }
        chunks.extend(bodies);

        Ok(RenderedMessage { topic, chunks })
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// Attributes by name, plus `EntryId`, `EntryUrl` and an `attrs` mapping for
/// attribute names that are not valid identifiers.
fn template_context(entry: &Entry) -> BTreeMap<String, Value> {
    let attrs: BTreeMap<&str, &str> = entry.attributes.iter().collect();

    let mut ctx: BTreeMap<String, Value> = entry
        .attributes
        .iter()
        .map(|(name, value)| (name.to_string(), Value::from(value)))
        .collect();
    ctx.insert("EntryId".to_string(), Value::from(entry.id));
    ctx.insert("EntryUrl".to_string(), Value::from(entry.source_url.as_str()));
    ctx.insert("attrs".to_string(), Value::from_serialize(&attrs));
    ctx
}

/// `length` that counts a missing attribute as empty instead of failing.
fn length(value: Value) -> Result<usize, minijinja::Error> {
    if value.is_undefined() || value.is_none() {
        return Ok(0);
    }
    value
        .len()
        .ok_or_else(|| minijinja::Error::new(ErrorKind::InvalidOperation, "value has no length"))
}

/// Collapses whitespace and drops control characters, which chat topics
/// cannot hold.
pub fn normalize_topic(rendered: &str) -> String {
    let printable: String = rendered
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let flat = printable.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.is_empty() {
        return FALLBACK_TOPIC.to_string();
    }
    flat.chars().take(MAX_TOPIC_CHARS).collect()
}

/// Re-wraps prose lines longer than `width` on word boundaries. Table rows
/// (`|...|`) and fenced code blocks are kept as they are; a wrapped line's
/// indentation is repeated on its continuation lines.
pub fn wrap_lines(text: &str, width: usize) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut fenced = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            fenced = !fenced;
            out.push(line.to_string());
            continue;
        }
        let table_row = trimmed.starts_with('|') && trimmed.trim_end().ends_with('|');
        if fenced || table_row || char_len(line) <= width {
            out.push(line.to_string());
            continue;
        }

        let indent = &line[..line.len() - trimmed.len()];
        let mut current = indent.to_string();
        let mut current_len = char_len(indent);
        let mut has_word = false;
        for word in trimmed.split_whitespace() {
            let word_len = char_len(word);
            if has_word && current_len + 1 + word_len > width {
                out.push(std::mem::replace(&mut current, indent.to_string()));
                current_len = char_len(indent);
                has_word = false;
            }
            if has_word {
                current.push(' ');
                current_len += 1;
            }
            current.push_str(word);
            current_len += word_len;
            has_word = true;
        }
        if has_word {
            out.push(current);
        }
    }
    out.join("\n")
}

/// Markdown table of the entry's attributes.
pub fn header_table(entry: &Entry) -> String {
    let mut table = String::from("| Attribute | Value |\n|---|---|\n");
    for (name, value) in entry.attributes.iter() {
        table.push_str(&format!("| {} | {} |\n", escape_cell(name), escape_cell(value)));
    }
    table
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace(['\r', '\n'], " ")
}

pub fn quote_block(text: &str) -> String {
    format!("{QUOTE_OPEN}{}{QUOTE_CLOSE}", text.trim_end())
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Splits `text` into blocks of whole lines, each at most `max_chars` long.
/// A single line longer than the limit is cut at character boundaries.
pub fn split_lines(text: &str, max_chars: usize) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut block = String::new();
    let mut block_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = char_len(line);
        if block_len + line_len > max_chars && !block.is_empty() {
            blocks.push(std::mem::take(&mut block));
            block_len = 0;
        }
        if line_len > max_chars {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max_chars) {
                blocks.push(piece.iter().collect());
            }
            continue;
        }
        block.push_str(line);
        block_len += line_len;
    }
    if !block.is_empty() {
        blocks.push(block);
    }
    blocks
}

/// Greedily joins consecutive blocks while they fit in `max_chars`.
pub fn assemble_chunks(blocks: Vec<String>, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for block in blocks {
        if current.is_empty() {
            current = block;
        } else if char_len(&current) + char_len(&block) <= max_chars {
            current.push_str(&block);
        } else {
            chunks.push(std::mem::replace(&mut current, block));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
