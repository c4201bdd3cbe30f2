use nerpipe_core::{Error, Result};
use std::time::Duration;

pub mod cache;
pub mod controller;
pub mod dictfile;
pub mod dictionary;
pub mod elastic;
pub mod filter;
pub mod html;
pub mod leadmine;
pub mod pattern;
pub mod redis_cache;
pub mod textprep;

pub use cache::MemoryCache;
pub use controller::{jobs, recognise, recognise_snippets, Engine, Job, Registry, UnknownRecogniser};
pub use dictionary::{DictionaryOptions, DictionaryRecogniser};
pub use filter::{filter_submatches, is_submatch, Blocklist};
pub use html::{read_snippets, visible_text, SnippetReader};
pub use leadmine::LeadmineRecogniser;
pub use pattern::PatternRecogniser;

/// Shared HTTP client for recognisers and the document-index cache.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("nerpipe/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Transport(e.to_string()))
}
