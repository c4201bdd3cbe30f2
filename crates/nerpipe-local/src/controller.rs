//! Fan-out of one snippet stream to many recognisers, fan-in of their entities.

use crate::filter::Blocklist;
use crate::html::SnippetReader;
use nerpipe_core::{
    Entity, Error, RecogniseOptions, Recogniser, Result, Snippet, SnippetEvent, SnippetSender,
};
use std::io::Read;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown recogniser: {0}")]
pub struct UnknownRecogniser(pub String);

/// Recognisers in registration order.
#[derive(Clone, Default)]
pub struct Registry {
    recognisers: Vec<Arc<dyn Recogniser>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, recogniser: Arc<dyn Recogniser>) -> Result<()> {
        if self.get(recogniser.name()).is_some() {
            return Err(Error::Config(format!(
                "recogniser {:?} registered twice",
                recogniser.name()
            )));
        }
        self.recognisers.push(recogniser);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Recogniser>> {
        self.recognisers.iter().find(|r| r.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.recognisers.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.recognisers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recognisers.is_empty()
    }

    pub fn all(&self) -> Vec<Arc<dyn Recogniser>> {
        self.recognisers.clone()
    }

    /// The named recognisers, in registration order regardless of the order asked for.
    pub fn select<S: AsRef<str>>(
        &self,
        names: &[S],
    ) -> std::result::Result<Vec<Arc<dyn Recogniser>>, UnknownRecogniser> {
        for name in names {
            if self.get(name.as_ref()).is_none() {
                return Err(UnknownRecogniser(name.as_ref().to_string()));
            }
        }
        Ok(self
            .recognisers
            .iter()
            .filter(|r| names.iter().any(|n| n.as_ref() == r.name()))
            .cloned()
            .collect())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// A recogniser with the options it runs under for one request.
pub type Job = (Arc<dyn Recogniser>, RecogniseOptions);

/// Pair every recogniser with the same options.
pub fn jobs(recognisers: Vec<Arc<dyn Recogniser>>, options: &RecogniseOptions) -> Vec<Job> {
    recognisers
        .into_iter()
        .map(|r| (r, options.clone()))
        .collect()
}

/// Send `event` to every live channel in order, waiting for each to accept it.
///
/// Channels whose worker has exited are dropped from later sends.
async fn broadcast(senders: &mut [Option<SnippetSender>], event: SnippetEvent) {
    for slot in senders.iter_mut() {
        if let Some(tx) = slot.as_ref() {
            if tx.send(event.clone()).await.is_err() {
                *slot = None;
            }
        }
    }
}

async fn fan_out(
    mut source: mpsc::Receiver<Result<Snippet>>,
    jobs: &[Job],
) -> Result<Vec<Entity>> {
    let mut senders = Vec::with_capacity(jobs.len());
    let mut workers = Vec::with_capacity(jobs.len());
    for (recogniser, options) in jobs {
        let (tx, rx) = mpsc::channel(1);
        let recogniser = recogniser.clone();
        let options = options.clone();
        workers.push(tokio::spawn(async move {
            recogniser.recognise(rx, options).await
        }));
        senders.push(Some(tx));
    }

    let mut snippets = 0usize;
    while let Some(item) = source.recv().await {
        match item {
            Ok(snippet) => {
                snippets += 1;
                broadcast(&mut senders, SnippetEvent::Snippet(snippet)).await;
                if senders.iter().all(Option::is_none) {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "snippet source failed");
                broadcast(&mut senders, SnippetEvent::Failed(err)).await;
                break;
            }
        }
    }
    drop(source);
    broadcast(&mut senders, SnippetEvent::End).await;
    drop(senders);

    let results = futures_util::future::join_all(workers).await;
    let mut entities = Vec::new();
    let mut first_error = None;
    for ((recogniser, _), joined) in jobs.iter().zip(results) {
        let result = joined.unwrap_or_else(|e| {
            Err(Error::Invariant(format!(
                "recogniser {} did not finish: {e}",
                recogniser.name()
            )))
        });
        match result {
            Ok(found) => entities.extend(found),
            Err(err) => {
                tracing::debug!(recogniser = recogniser.name(), error = %err, "recogniser failed");
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    tracing::debug!(
        recognisers = jobs.len(),
        snippets,
        entities = entities.len(),
        "recognition done"
    );
    Ok(entities)
}

/// Read HTML from `input` and run it through every recogniser, each with its own options.
///
/// Entities come back grouped by recogniser, in the order given. The first failure wins and
/// no partial result is returned.
pub async fn recognise<R>(input: R, jobs: &[Job]) -> Result<Vec<Entity>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let reader = tokio::task::spawn_blocking(move || {
        for item in SnippetReader::new(input) {
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });
    let result = fan_out(rx, jobs).await;
    reader
        .await
        .map_err(|e| Error::Invariant(format!("snippet reader did not finish: {e}")))?;
    result
}

/// Run already-extracted snippets through every recogniser.
pub async fn recognise_snippets(snippets: Vec<Snippet>, jobs: &[Job]) -> Result<Vec<Entity>> {
    let (tx, rx) = mpsc::channel(1);
    let feeder = tokio::spawn(async move {
        for snippet in snippets {
            if tx.send(Ok(snippet)).await.is_err() {
                break;
            }
        }
    });
    let result = fan_out(rx, jobs).await;
    feeder
        .await
        .map_err(|e| Error::Invariant(format!("snippet feeder did not finish: {e}")))?;
    result
}

/// Registry plus the global blocklist applied to every result.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    registry: Registry,
    blocklist: Arc<Blocklist>,
}

impl Engine {
    pub fn new(registry: Registry, blocklist: Arc<Blocklist>) -> Self {
        Self {
            registry,
            blocklist,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn blocklist(&self) -> &Arc<Blocklist> {
        &self.blocklist
    }

    pub async fn recognise<R>(&self, input: R, jobs: &[Job]) -> Result<Vec<Entity>>
    where
        R: Read + Send + 'static,
    {
        let mut entities = recognise(input, jobs).await?;
        self.blocklist.retain(&mut entities);
        Ok(entities)
    }

    pub async fn recognise_snippets(
        &self,
        snippets: Vec<Snippet>,
        jobs: &[Job],
    ) -> Result<Vec<Entity>> {
        let mut entities = recognise_snippets(snippets, jobs).await?;
        self.blocklist.retain(&mut entities);
        Ok(entities)
    }
}
