//! HTTP ingress, startup wiring and configuration for nerpipe.

pub mod config;
pub mod routes;

use config::{CacheType, Config, DictionaryConfig};
use nerpipe_core::{Cache, Error, Result};
use nerpipe_local::{
    dictfile::{self, DictFormat, ImportSummary},
    elastic::ElasticCache,
    http_client,
    redis_cache::RedisCache,
    DictionaryRecogniser, Engine, LeadmineRecogniser, MemoryCache, PatternRecogniser, Registry,
};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use routes::router;

/// Immutable state shared by every request.
pub struct AppState {
    pub engine: Engine,
    /// The remote dictionary cache, when one is configured.
    pub cache: Option<Arc<dyn Cache>>,
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("cache", &self.cache.as_ref().map(|c| c.name()))
            .finish()
    }
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nerpipe=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Connect the configured remote cache; `None` for `cache_type = "local"`.
pub async fn remote_cache(config: &Config) -> Result<Option<Arc<dyn Cache>>> {
    let cache: Arc<dyn Cache> = match config.cache_type()? {
        CacheType::Local => return Ok(None),
        CacheType::Redis => Arc::new(RedisCache::connect(&config.redis.url).await?),
        CacheType::Elasticsearch => Arc::new(elastic_cache(config)?),
    };
    Ok(Some(cache))
}

pub fn elastic_cache(config: &Config) -> Result<ElasticCache> {
    ElasticCache::new(
        http_client(Duration::from_secs(30))?,
        &config.elasticsearch.url,
        &config.elasticsearch.index,
    )
}

/// Import dictionary files of one format into `cache`, summing the per-file counts.
pub async fn import_files(
    files: &[impl AsRef<Path>],
    format: DictFormat,
    dictionary: &str,
    cache: &dyn Cache,
    pipeline_size: usize,
) -> Result<ImportSummary> {
    let mut total = ImportSummary::default();
    for path in files {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| Error::InputRead(format!("{}: {e}", path.display())))?;
        let entries = dictfile::read_entries(format, BufReader::new(file))?;
        let summary = dictfile::import(entries, dictionary, cache, pipeline_size, false).await?;
        total.entries += summary.entries;
        total.keys += summary.keys;
    }
    Ok(total)
}

async fn local_dictionary(config: &Config, dictionary: &DictionaryConfig) -> Result<MemoryCache> {
    let cache = MemoryCache::new();
    let format: DictFormat = dictionary.format.parse()?;
    let summary = import_files(
        &dictionary.files,
        format,
        &dictionary.name,
        &cache,
        config.pipeline_size,
    )
    .await?;
    tracing::info!(
        dictionary = %dictionary.name,
        files = dictionary.files.len(),
        entries = summary.entries,
        keys = summary.keys,
        "loaded local dictionary"
    );
    Ok(cache)
}

/// Build every configured recogniser: dictionaries, then regex sets, then Leadmine services.
pub async fn build_state(config: Config) -> Result<AppState> {
    config.validate()?;
    let blocklist = Arc::new(config.blocklist.to_blocklist());
    let cache = remote_cache(&config).await?;
    let options = config.dictionary_options();

    let mut registry = Registry::new();
    for dictionary in &config.dictionaries {
        let recogniser = match &cache {
            Some(remote) => {
                DictionaryRecogniser::remote(&dictionary.name, remote.clone(), options)
            }
            None => DictionaryRecogniser::local(
                &dictionary.name,
                local_dictionary(&config, dictionary).await?,
                options,
            ),
        };
        registry.register(Arc::new(recogniser))?;
    }
    for set in &config.patterns {
        let recogniser = PatternRecogniser::compile(
            &set.name,
            set.patterns.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )?;
        registry.register(Arc::new(recogniser))?;
    }
    for service in &config.leadmine {
        let client = http_client(Duration::from_millis(service.timeout_ms))?;
        let recogniser = LeadmineRecogniser::new(
            &service.name,
            client,
            &service.endpoint()?,
            service.params.clone(),
            blocklist.clone(),
        )?;
        registry.register(Arc::new(recogniser))?;
    }

    tracing::info!(
        recognisers = ?registry.names(),
        cache = cache.as_ref().map(|c| c.name()).unwrap_or("local"),
        "recognisers ready"
    );
    Ok(AppState {
        engine: Engine::new(registry, blocklist),
        cache,
        config: Arc::new(config),
    })
}

/// Bind the configured address and serve until the process is stopped.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(Arc::new(state))).await?;
    Ok(())
}
