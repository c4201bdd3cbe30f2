//! Compound-token dictionary matching against a cache backend.
//!
//! Every token extends a sliding window of at most `compound_token_length` tokens; each window
//! suffix (a compound) is looked up under its space-joined normalised text. Remote lookups are
//! batched through a [`GetPipeline`] and de-duplicated per request.

use crate::cache::MemoryCache;
use crate::textprep::{normalise_snippet, tokenize};
use lru::LruCache;
use nerpipe_core::{
    Cache, Entity, Error, GetPipeline, Lookup, LookupHandle, RecogniseOptions, Recogniser, Result,
    Snippet, SnippetEvent, SnippetReceiver, Token,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictionaryOptions {
    pub compound_token_length: usize,
    pub pipeline_size: usize,
    /// Entries in the shared write-through front cache; 0 disables it.
    pub local_cache_size: usize,
}

impl Default for DictionaryOptions {
    fn default() -> Self {
        Self {
            compound_token_length: 5,
            pipeline_size: 10_000,
            local_cache_size: 100_000,
        }
    }
}

/// The last few normalised tokens of the stream.
#[derive(Debug, Clone)]
pub struct Window {
    tokens: VecDeque<Token>,
    capacity: usize,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        Self {
            tokens: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a normalised token and return every compound ending at it, shortest first.
    pub fn push(&mut self, token: Token) -> Vec<Snippet> {
        if self.tokens.len() == self.capacity {
            self.tokens.pop_front();
        }
        self.tokens.push_back(token);

        let mut compounds = Vec::with_capacity(self.tokens.len());
        let mut text = String::new();
        for first in self.tokens.iter().rev() {
            text = if text.is_empty() {
                first.normalised_text.clone()
            } else {
                format!("{} {}", first.normalised_text, text)
            };
            let mut compound = Snippet::new(text.clone(), first.offset, first.xpath.clone());
            compound.normalised_text = text.clone();
            compounds.push(compound);
        }
        compounds
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Resolution state of one queued compound lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupState {
    Pending,
    Present(Lookup),
    KnownAbsent,
}

#[derive(Debug)]
struct Compound {
    snippet: Snippet,
    state: LookupState,
}

type FrontCache = Arc<Mutex<LruCache<String, Option<Lookup>>>>;

#[derive(Clone)]
pub enum DictionaryBackend {
    /// In-process map, looked up synchronously.
    Local(MemoryCache),
    /// Pipelined remote store.
    Remote(Arc<dyn Cache>),
}

pub struct DictionaryRecogniser {
    name: String,
    backend: DictionaryBackend,
    options: DictionaryOptions,
    front: Option<FrontCache>,
}

impl DictionaryRecogniser {
    pub fn new(name: impl Into<String>, backend: DictionaryBackend, options: DictionaryOptions) -> Self {
        let front = match &backend {
            DictionaryBackend::Remote(_) => NonZeroUsize::new(options.local_cache_size)
                .map(|n| Arc::new(Mutex::new(LruCache::new(n)))),
            DictionaryBackend::Local(_) => None,
        };
        Self {
            name: name.into(),
            backend,
            options,
            front,
        }
    }

    pub fn local(name: impl Into<String>, cache: MemoryCache, options: DictionaryOptions) -> Self {
        Self::new(name, DictionaryBackend::Local(cache), options)
    }

    pub fn remote(name: impl Into<String>, cache: Arc<dyn Cache>, options: DictionaryOptions) -> Self {
        Self::new(name, DictionaryBackend::Remote(cache), options)
    }
}

impl std::fmt::Debug for DictionaryRecogniser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            DictionaryBackend::Local(_) => "local",
            DictionaryBackend::Remote(c) => c.name(),
        };
        f.debug_struct("DictionaryRecogniser")
            .field("name", &self.name)
            .field("backend", &backend)
            .field("options", &self.options)
            .finish()
    }
}

/// Per-request matching state.
struct Session<'a> {
    recogniser: &'a DictionaryRecogniser,
    window: Window,
    arena: Vec<Compound>,
    /// Keys already answered in this request.
    resolved: HashMap<String, Option<Lookup>>,
    /// Keys queued in the pipeline and the handles waiting on them.
    in_flight: HashMap<String, Vec<LookupHandle>>,
    pipe: Option<Box<dyn GetPipeline>>,
    entities: Vec<Entity>,
}

impl<'a> Session<'a> {
    fn new(recogniser: &'a DictionaryRecogniser) -> Self {
        let pipe = match &recogniser.backend {
            DictionaryBackend::Remote(cache) => {
                Some(cache.new_get_pipeline(recogniser.options.pipeline_size))
            }
            DictionaryBackend::Local(_) => None,
        };
        Self {
            recogniser,
            window: Window::new(recogniser.options.compound_token_length),
            arena: Vec::new(),
            resolved: HashMap::new(),
            in_flight: HashMap::new(),
            pipe,
            entities: Vec::new(),
        }
    }

    /// Record a hit. Remote stores are shared by every dictionary, so a remote hit only
    /// counts when it was imported under this recogniser's name.
    fn emit(&mut self, compound: &Snippet, lookup: &Lookup) {
        let recogniser = self.recogniser;
        if matches!(recogniser.backend, DictionaryBackend::Remote(_))
            && lookup.dictionary != recogniser.name
        {
            return;
        }
        self.entities
            .push(Entity::at(compound, &self.recogniser.name).with_lookup(lookup));
    }

    async fn snippet(&mut self, snippet: &Snippet, exact_match: bool) -> Result<()> {
        let mut tokens = Vec::new();
        tokenize(snippet, exact_match, |t| tokens.push(t));
        for token in tokens {
            self.token(token).await?;
        }
        Ok(())
    }

    async fn token(&mut self, mut token: Token) -> Result<()> {
        let sentence_end = normalise_snippet(&mut token);
        if token.normalised_text.is_empty() {
            return Ok(());
        }
        for compound in self.window.push(token) {
            self.resolve(compound)?;
        }
        if sentence_end {
            self.window.clear();
        }
        let full = self
            .pipe
            .as_ref()
            .is_some_and(|p| p.size() >= self.recogniser.options.pipeline_size);
        if full {
            self.flush().await?;
        }
        Ok(())
    }

    fn resolve(&mut self, compound: Snippet) -> Result<()> {
        let recogniser = self.recogniser;
        let key = compound.normalised_text.clone();
        match &recogniser.backend {
            DictionaryBackend::Local(cache) => {
                if let Some(lookup) = cache.lookup(&key)? {
                    self.emit(&compound, &lookup);
                }
                return Ok(());
            }
            DictionaryBackend::Remote(_) => {}
        }

        if let Some(front) = &recogniser.front {
            let hit = front
                .lock()
                .map_err(|e| Error::Cache(e.to_string()))?
                .get(&key)
                .cloned();
            if let Some(hit) = hit {
                if let Some(lookup) = hit {
                    self.emit(&compound, &lookup);
                }
                return Ok(());
            }
        }
        if let Some(hit) = self.resolved.get(&key).cloned() {
            if let Some(lookup) = hit {
                self.emit(&compound, &lookup);
            }
            return Ok(());
        }

        let handle = self.arena.len();
        self.arena.push(Compound {
            snippet: compound,
            state: LookupState::Pending,
        });
        match self.in_flight.entry(key) {
            Entry::Occupied(mut waiting) => waiting.get_mut().push(handle),
            Entry::Vacant(slot) => {
                let pipe = self
                    .pipe
                    .as_mut()
                    .ok_or_else(|| Error::Invariant("remote lookup without a pipeline".to_string()))?;
                pipe.get(handle, slot.key().clone());
                slot.insert(vec![handle]);
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let Some(pipe) = self.pipe.as_mut() else {
            return Ok(());
        };
        let queued = pipe.size();
        if queued == 0 {
            return Ok(());
        }
        let results = pipe.exec().await?;
        let hits = results.iter().filter(|(_, l)| l.is_some()).count();
        tracing::debug!(
            recogniser = %self.recogniser.name,
            queued,
            hits,
            "flushed dictionary pipeline"
        );
        for (handle, lookup) in results {
            self.complete(handle, lookup)?;
        }
        Ok(())
    }

    fn complete(&mut self, handle: LookupHandle, lookup: Option<Lookup>) -> Result<()> {
        let recogniser = self.recogniser;
        let key = self
            .arena
            .get(handle)
            .ok_or_else(|| Error::Invariant(format!("unknown lookup handle {handle}")))?
            .snippet
            .normalised_text
            .clone();
        let waiters = self.in_flight.remove(&key).unwrap_or_else(|| vec![handle]);
        for waiter in waiters {
            let compound = &mut self.arena[waiter];
            if compound.state != LookupState::Pending {
                return Err(Error::Invariant(format!(
                    "lookup {waiter} for {key:?} resolved twice"
                )));
            }
            compound.state = match &lookup {
                Some(l) => LookupState::Present(l.clone()),
                None => LookupState::KnownAbsent,
            };
            if let Some(l) = &lookup {
                let snippet = compound.snippet.clone();
                self.emit(&snippet, l);
            }
        }
        if let Some(front) = &recogniser.front {
            front
                .lock()
                .map_err(|e| Error::Cache(e.to_string()))?
                .put(key.clone(), lookup.clone());
        }
        self.resolved.insert(key, lookup);
        Ok(())
    }

    async fn finish(mut self) -> Result<Vec<Entity>> {
        self.flush().await?;
        let pending = self
            .arena
            .iter()
            .filter(|c| c.state == LookupState::Pending)
            .count();
        if pending > 0 {
            return Err(Error::Invariant(format!(
                "{pending} dictionary lookups were never answered"
            )));
        }
        Ok(self.entities)
    }
}

#[async_trait::async_trait]
impl Recogniser for DictionaryRecogniser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognise(
        &self,
        mut input: SnippetReceiver,
        options: RecogniseOptions,
    ) -> Result<Vec<Entity>> {
        let mut session = Session::new(self);
        while let Some(event) = input.recv().await {
            match event {
                SnippetEvent::Snippet(snippet) => {
                    session.snippet(&snippet, options.exact_match).await?
                }
                SnippetEvent::Failed(err) => return Err(err),
                SnippetEvent::End => break,
            }
        }
        session.finish().await
    }
}
