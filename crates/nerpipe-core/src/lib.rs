use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("input read failed: {0}")]
    InputRead(String),
    #[error("html parse failed: {0}")]
    Parse(String),
    #[error("cache error: {0}")]
    Cache(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A contiguous fragment of visible text and the element it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    /// Filled in by token normalisation; empty until then.
    #[serde(skip)]
    pub normalised_text: String,
    /// Byte position for reader output; snippet offset plus a code-point delta for tokens.
    pub offset: usize,
    pub xpath: String,
}

impl Snippet {
    pub fn new(text: impl Into<String>, offset: usize, xpath: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            normalised_text: String::new(),
            offset,
            xpath: xpath.into(),
        }
    }
}

/// A snippet holding a single lexical unit.
pub type Token = Snippet;

/// Cache value stored under a normalised key.
///
/// Wire form: `{"dictionary": str, "identifiers": {str: str}, "metadata": <json>}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub dictionary: String,
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Lookup {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub position: usize,
    pub xpath: String,
    pub recogniser: String,
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Entity {
    /// Entity for a snippet-shaped match with no dictionary payload.
    pub fn at(snippet: &Snippet, recogniser: &str) -> Self {
        Self {
            name: snippet.text.clone(),
            position: snippet.offset,
            xpath: snippet.xpath.clone(),
            recogniser: recogniser.to_string(),
            identifiers: BTreeMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_lookup(mut self, lookup: &Lookup) -> Self {
        self.identifiers = lookup.identifiers.clone();
        self.metadata = lookup.metadata.clone();
        self
    }
}

/// Arena index identifying one lookup attempt within a request.
pub type LookupHandle = usize;

#[async_trait::async_trait]
pub trait GetPipeline: Send {
    /// Queue one lookup for `key`; the result is reported against `handle`.
    fn get(&mut self, handle: LookupHandle, key: String);
    fn size(&self) -> usize;
    /// Dispatch every queued lookup in one round trip and drain the queue.
    ///
    /// Result order is unspecified. `None` means the key is known to be absent.
    async fn exec(&mut self) -> Result<Vec<(LookupHandle, Option<Lookup>)>>;
}

#[async_trait::async_trait]
pub trait SetPipeline: Send {
    fn set(&mut self, key: String, value: Vec<u8>);
    fn size(&self) -> usize;
    async fn exec(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    fn name(&self) -> &'static str;
    fn new_get_pipeline(&self, capacity: usize) -> Box<dyn GetPipeline>;
    fn new_set_pipeline(&self, capacity: usize) -> Box<dyn SetPipeline>;
    async fn ready(&self) -> bool;
}

/// One item on a recogniser's input channel.
#[derive(Debug, Clone)]
pub enum SnippetEvent {
    Snippet(Snippet),
    /// The snippet source failed; no further snippets follow.
    Failed(Error),
    End,
}

pub type SnippetReceiver = tokio::sync::mpsc::Receiver<SnippetEvent>;
pub type SnippetSender = tokio::sync::mpsc::Sender<SnippetEvent>;

/// Per-request recogniser options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecogniseOptions {
    /// Glue punctuated compounds into one token instead of splitting on word boundaries.
    #[serde(default)]
    pub exact_match: bool,
    /// Extra parameters forwarded to HTTP recognisers.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[async_trait::async_trait]
pub trait Recogniser: Send + Sync {
    fn name(&self) -> &str;
    /// Consume the snippet stream until `End` (or channel close) and return the entities found.
    async fn recognise(
        &self,
        input: SnippetReceiver,
        options: RecogniseOptions,
    ) -> Result<Vec<Entity>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_round_trips_through_the_cache_wire_form() {
        let raw = br#"{"dictionary":"pubchem","identifiers":{"pubchem":"5460341"},"metadata":{"source":"x"}}"#;
        let lookup = Lookup::from_slice(raw).unwrap();
        assert_eq!(lookup.dictionary, "pubchem");
        assert_eq!(lookup.identifiers["pubchem"], "5460341");
        assert_eq!(lookup.metadata["source"], "x");

        let again = Lookup::from_slice(&lookup.to_vec().unwrap()).unwrap();
        assert_eq!(again, lookup);
    }

    #[test]
    fn lookup_tolerates_missing_optional_fields() {
        let lookup = Lookup::from_slice(br#"{"dictionary":"d"}"#).unwrap();
        assert!(lookup.identifiers.is_empty());
        assert!(lookup.metadata.is_null());
    }

    #[test]
    fn malformed_lookup_is_a_decode_error() {
        let err = Lookup::from_slice(b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn snippet_serialises_without_normalised_text() {
        let mut s = Snippet::new("Calcium", 3, "/p");
        s.normalised_text = "calcium".to_string();
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v, serde_json::json!({"text": "Calcium", "offset": 3, "xpath": "/p"}));
    }

    #[test]
    fn entity_from_snippet_and_lookup() {
        let mut ids = BTreeMap::new();
        ids.insert("chebi".to_string(), "CHEBI:29108".to_string());
        let lookup = Lookup {
            dictionary: "chebi".to_string(),
            identifiers: ids,
            metadata: serde_json::json!({"k": 1}),
        };
        let e = Entity::at(&Snippet::new("calcium", 10, "/html/*[2]"), "dict").with_lookup(&lookup);
        assert_eq!(e.name, "calcium");
        assert_eq!(e.position, 10);
        assert_eq!(e.xpath, "/html/*[2]");
        assert_eq!(e.recogniser, "dict");
        assert_eq!(e.identifiers["chebi"], "CHEBI:29108");
        assert_eq!(e.metadata["k"], 1);
    }
}
