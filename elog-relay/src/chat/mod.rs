pub mod dry_run;
pub mod zulip;

pub use dry_run::DryRunBackend;
pub use zulip::{ZulipBackend, ZulipConfig};
