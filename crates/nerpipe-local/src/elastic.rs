//! Document-index backend over the Elasticsearch REST API.
//!
//! Each cache entry is one document `{key, dictionary, identifiers, metadata}` with `_id = key`.
//! Gets are one `_msearch` with a `term` query per key; sets are one `_bulk` request.

use nerpipe_core::{Cache, Error, GetPipeline, Lookup, LookupHandle, Result, SetPipeline};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct ElasticCache {
    client: reqwest::Client,
    base: String,
    index: String,
}

impl ElasticCache {
    pub fn new(client: reqwest::Client, base_url: &str, index: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url).map_err(|e| Error::Config(format!("{base_url}: {e}")))?;
        if index.is_empty() {
            return Err(Error::Config("elasticsearch index name is empty".to_string()));
        }
        Ok(Self {
            client,
            base: parsed.as_str().trim_end_matches('/').to_string(),
            index: index.to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }

    /// Create the index with `key` mapped as an exact-match keyword. Existing indices are kept.
    pub async fn create_index(&self) -> Result<()> {
        let body = serde_json::json!({
            "mappings": { "properties": { "key": { "type": "keyword" } } }
        });
        let resp = self
            .client
            .put(self.endpoint(&self.index))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            tracing::info!(index = %self.index, "created elasticsearch index");
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::BAD_REQUEST && text.contains("resource_already_exists") {
            return Ok(());
        }
        Err(Error::Cache(format!("create index HTTP {status}: {text}")))
    }
}

#[async_trait::async_trait]
impl Cache for ElasticCache {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    fn new_get_pipeline(&self, capacity: usize) -> Box<dyn GetPipeline> {
        Box::new(ElasticGetPipeline {
            cache: self.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    fn new_set_pipeline(&self, capacity: usize) -> Box<dyn SetPipeline> {
        Box::new(ElasticSetPipeline {
            cache: self.clone(),
            queue: Vec::with_capacity(capacity),
        })
    }

    async fn ready(&self) -> bool {
        match self.client.head(self.endpoint(&self.index)).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::warn!(error = %e, "elasticsearch readiness check failed");
                false
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MsearchResponse {
    responses: Vec<SearchResponse>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    hits: Option<Hits>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Hits {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: Lookup,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
}

fn ndjson(lines: impl IntoIterator<Item = serde_json::Value>) -> String {
    let mut body = String::new();
    for line in lines {
        body.push_str(&line.to_string());
        body.push('\n');
    }
    body
}

struct ElasticGetPipeline {
    cache: ElasticCache,
    queue: Vec<(LookupHandle, String)>,
}

#[async_trait::async_trait]
impl GetPipeline for ElasticGetPipeline {
    fn get(&mut self, handle: LookupHandle, key: String) {
        self.queue.push((handle, key));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<Vec<(LookupHandle, Option<Lookup>)>> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(Vec::new());
        }
        let body = ndjson(queue.iter().flat_map(|(_, key)| {
            [
                serde_json::json!({ "index": self.cache.index }),
                serde_json::json!({ "size": 1, "query": { "term": { "key": key } } }),
            ]
        }));
        let resp = self
            .cache
            .client
            .post(self.cache.endpoint("_msearch"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Cache(format!("_msearch HTTP {status}")));
        }
        let bytes = resp.bytes().await.map_err(|e| Error::Cache(e.to_string()))?;
        let parsed: MsearchResponse =
            serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))?;
        if parsed.responses.len() != queue.len() {
            return Err(Error::Cache(format!(
                "_msearch returned {} responses for {} queries",
                parsed.responses.len(),
                queue.len()
            )));
        }

        let mut out = Vec::with_capacity(queue.len());
        for ((handle, key), response) in queue.into_iter().zip(parsed.responses) {
            if let Some(err) = response.error {
                return Err(Error::Cache(format!("_msearch failed for {key:?}: {err}")));
            }
            let lookup = response
                .hits
                .and_then(|h| h.hits.into_iter().next())
                .map(|h| h.source);
            out.push((handle, lookup));
        }
        Ok(out)
    }
}

struct ElasticSetPipeline {
    cache: ElasticCache,
    queue: Vec<(String, Vec<u8>)>,
}

#[async_trait::async_trait]
impl SetPipeline for ElasticSetPipeline {
    fn set(&mut self, key: String, value: Vec<u8>) {
        self.queue.push((key, value));
    }

    fn size(&self) -> usize {
        self.queue.len()
    }

    async fn exec(&mut self) -> Result<()> {
        let queue = std::mem::take(&mut self.queue);
        if queue.is_empty() {
            return Ok(());
        }
        let mut lines = Vec::with_capacity(queue.len() * 2);
        for (key, value) in queue {
            let mut doc: serde_json::Map<String, serde_json::Value> =
                serde_json::from_slice(&value).map_err(|e| Error::Decode(e.to_string()))?;
            doc.insert("key".to_string(), serde_json::Value::String(key.clone()));
            lines.push(serde_json::json!({ "index": { "_index": self.cache.index, "_id": key } }));
            lines.push(serde_json::Value::Object(doc));
        }
        let resp = self
            .cache
            .client
            .post(self.cache.endpoint("_bulk"))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(ndjson(lines))
            .send()
            .await
            .map_err(|e| Error::Cache(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Cache(format!("_bulk HTTP {status}")));
        }
        let parsed: BulkResponse = resp.json().await.map_err(|e| Error::Decode(e.to_string()))?;
        if parsed.errors {
            return Err(Error::Cache("_bulk reported item errors".to_string()));
        }
        Ok(())
    }
}
