pub mod types;
pub mod config;
pub mod logging;
pub mod fetcher;
pub mod parser;
pub mod sources;
pub mod chat;
pub mod publisher;
pub mod render;
pub mod ledger;
pub mod pipeline;

pub use types::*;
pub use config::{Config, ConfigError, MetaConfig};
pub use fetcher::Fetcher;
pub use sources::ElogSource;
pub use chat::{DryRunBackend, ZulipBackend, ZulipConfig};
pub use publisher::{AttachmentBlob, ChatPublisher, PublisherConfig};
pub use render::{RenderedMessage, Renderer, TemplateError};
pub use ledger::{Ledger, LedgerError, MemoryLedger, PublishedRecord, SqlLedger};
pub use pipeline::{CycleOutcome, CycleReport, Orchestrator, SectionWorker};
