//! HTTP recogniser for a Leadmine-style text annotation service.
//!
//! The whole document is posted as one `text/plain` body. Returned offsets are not trusted:
//! each distinct entity text is re-located in the posted text and mapped back to the snippet
//! that contains it. Entity positions are byte offsets into the owning snippet's text.

use crate::filter::{filter_submatches, Blocklist};
use nerpipe_core::{
    Entity, Error, RecogniseOptions, Recogniser, Result, Snippet, SnippetEvent, SnippetReceiver,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadmineResponse {
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub entities: Vec<LeadmineEntity>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadmineEntity {
    #[serde(default)]
    pub beg: usize,
    #[serde(default)]
    pub end: usize,
    #[serde(default)]
    pub beg_in_normalized_doc: usize,
    #[serde(default)]
    pub end_in_normalized_doc: usize,
    pub entity_text: String,
    #[serde(default)]
    pub entity_group: String,
    #[serde(default)]
    pub resolved_entity: String,
    #[serde(default)]
    pub recognising_dict: serde_json::Value,
    #[serde(default)]
    pub section_type: String,
}

#[derive(Debug, Clone)]
pub struct LeadmineRecogniser {
    name: String,
    client: reqwest::Client,
    url: url::Url,
    params: BTreeMap<String, String>,
    blocklist: Arc<Blocklist>,
}

impl LeadmineRecogniser {
    pub fn new(
        name: impl Into<String>,
        client: reqwest::Client,
        url: &str,
        params: BTreeMap<String, String>,
        blocklist: Arc<Blocklist>,
    ) -> Result<Self> {
        let url = url::Url::parse(url).map_err(|e| Error::Config(format!("{url}: {e}")))?;
        Ok(Self {
            name: name.into(),
            client,
            url,
            params,
            blocklist,
        })
    }

    fn request_url(&self, extra: &BTreeMap<String, String>) -> url::Url {
        let mut url = self.url.clone();
        if !self.params.is_empty() || !extra.is_empty() {
            let mut query = url.query_pairs_mut();
            for (k, v) in self.params.iter().chain(extra) {
                query.append_pair(k, v);
            }
        }
        url
    }

    async fn annotate(&self, text: String, params: &BTreeMap<String, String>) -> Result<LeadmineResponse> {
        let resp = self
            .client
            .post(self.request_url(params))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(text)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Transport(format!("{} HTTP {status}", self.name)));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    fn entity(&self, raw: &LeadmineEntity, position: usize, xpath: &str) -> Entity {
        let mut identifiers = BTreeMap::new();
        identifiers.insert(raw.entity_group.clone(), raw.resolved_entity.clone());
        Entity {
            name: raw.entity_text.clone(),
            position,
            xpath: xpath.to_string(),
            recogniser: self.name.clone(),
            identifiers,
            metadata: serde_json::json!({
                "entityGroup": raw.entity_group,
                "resolvedEntity": raw.resolved_entity,
                "recognisingDict": raw.recognising_dict,
                "sectionType": raw.section_type,
            }),
        }
    }

    /// Re-locate every distinct entity text in `text` and map matches to their snippets.
    fn correct(
        &self,
        raw: &[LeadmineEntity],
        text: &str,
        snippets: &BTreeMap<usize, Snippet>,
    ) -> Result<Vec<Entity>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entity in raw {
            if entity.entity_text.is_empty() || !seen.insert(entity.entity_text.as_str()) {
                continue;
            }
            let re = regex::Regex::new(&regex::escape(&entity.entity_text))
                .map_err(|e| Error::Invariant(e.to_string()))?;
            for m in re.find_iter(text) {
                let p = m.start();
                let (k, snippet) = snippets.range(..=p).next_back().ok_or_else(|| {
                    Error::Invariant(format!("no snippet owns offset {p}"))
                })?;
                if !snippet.text.contains(entity.entity_text.as_str()) {
                    return Err(Error::Invariant(format!(
                        "entity {:?} not in snippet at {}",
                        entity.entity_text, snippet.xpath
                    )));
                }
                out.push(self.entity(entity, p - k, &snippet.xpath));
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Recogniser for LeadmineRecogniser {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognise(
        &self,
        mut input: SnippetReceiver,
        options: RecogniseOptions,
    ) -> Result<Vec<Entity>> {
        let mut text = String::new();
        let mut snippets = BTreeMap::new();
        while let Some(event) = input.recv().await {
            match event {
                SnippetEvent::Snippet(snippet) => {
                    let start = text.len();
                    text.push_str(&snippet.text);
                    snippets.insert(start, snippet);
                }
                SnippetEvent::Failed(err) => return Err(err),
                SnippetEvent::End => break,
            }
        }
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let bytes = text.len();
        let response = self.annotate(text.clone(), &options.params).await?;
        let mut raw = response.entities;
        let returned = raw.len();
        raw.retain(|e| self.blocklist.allowed(&e.entity_text));
        let entities = filter_submatches(self.correct(&raw, &text, &snippets)?);
        tracing::debug!(
            recogniser = %self.name,
            bytes,
            returned,
            kept = entities.len(),
            "leadmine annotation done"
        );
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{RawQuery, State},
        http::{header, HeaderMap, StatusCode},
        routing::post,
        Json, Router,
    };
    use std::net::SocketAddr;
    use std::sync::Mutex;

    #[derive(Debug, Default, Clone)]
    struct Seen {
        query: Option<String>,
        content_type: Option<String>,
        body: String,
    }

    type Shared = Arc<Mutex<Seen>>;

    fn raw(text: &str, group: &str, resolved: &str) -> serde_json::Value {
        serde_json::json!({
            "beg": 0, "end": 0, "begInNormalizedDoc": 0, "endInNormalizedDoc": 0,
            "entityText": text, "entityGroup": group, "resolvedEntity": resolved,
            "recognisingDict": {"source": "test"}, "sectionType": "body"
        })
    }

    async fn annotate(
        State(seen): State<Shared>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: String,
    ) -> Json<serde_json::Value> {
        *seen.lock().unwrap() = Seen {
            query,
            content_type: headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        };
        Json(serde_json::json!({
            "created": "now",
            "entities": [
                raw("Aspirin", "Chemical", "CHEMBL25"),
                raw("acetylsalicylic acid", "Chemical", "CHEMBL25"),
                raw("acid", "Chemical", "CHEBI:37527"),
                raw("Water", "Chemical", "CHEBI:15377"),
                raw("Aspirin", "Chemical", "duplicate"),
            ]
        }))
    }

    async fn stub() -> (SocketAddr, Shared) {
        let seen: Shared = Arc::default();
        let app = Router::new()
            .route("/annotate", post(annotate))
            .route(
                "/fail",
                post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/garbage", post(|| async { "not json" }))
            .route(
                "/span",
                post(|| async {
                    Json(serde_json::json!({"created": "now", "entities": [raw("acid.\nTake", "X", "Y")]}))
                }),
            )
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, seen)
    }

    fn recogniser(addr: SocketAddr, path: &str) -> LeadmineRecogniser {
        let mut params = BTreeMap::new();
        params.insert("resolve".to_string(), "true".to_string());
        LeadmineRecogniser::new(
            "leadmine",
            reqwest::Client::new(),
            &format!("http://{addr}{path}"),
            params,
            Arc::new(Blocklist::new(Vec::new(), ["water".to_string()])),
        )
        .unwrap()
    }

    async fn run(rec: &LeadmineRecogniser, params: BTreeMap<String, String>) -> Result<Vec<Entity>> {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tx.send(SnippetEvent::Snippet(Snippet::new(
            "Aspirin is acetylsalicylic acid.\n",
            3,
            "/html/*[1]",
        )))
        .await
        .unwrap();
        tx.send(SnippetEvent::Snippet(Snippet::new(
            "Take aspirin daily. Aspirin! Water.\n",
            50,
            "/html/*[2]",
        )))
        .await
        .unwrap();
        tx.send(SnippetEvent::End).await.unwrap();
        rec.recognise(
            rx,
            RecogniseOptions {
                exact_match: false,
                params,
            },
        )
        .await
    }

    #[tokio::test]
    async fn entities_are_relocated_into_their_snippets() {
        let (addr, seen) = stub().await;
        let rec = recogniser(addr, "/annotate");
        let mut params = BTreeMap::new();
        params.insert("lang".to_string(), "en".to_string());
        let got = run(&rec, params).await.unwrap();

        let mut found: Vec<_> = got
            .iter()
            .map(|e| (e.name.as_str(), e.position, e.xpath.as_str()))
            .collect();
        found.sort();
        assert_eq!(
            found,
            vec![
                ("Aspirin", 0, "/html/*[1]"),
                ("Aspirin", 20, "/html/*[2]"),
                ("acetylsalicylic acid", 11, "/html/*[1]"),
            ]
        );
        let aspirin = &got[0];
        assert_eq!(aspirin.recogniser, "leadmine");
        assert_eq!(aspirin.identifiers["Chemical"], "CHEMBL25");
        assert_eq!(aspirin.metadata["recognisingDict"]["source"], "test");
        assert_eq!(aspirin.metadata["sectionType"], "body");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.query.as_deref(), Some("resolve=true&lang=en"));
        assert!(seen.content_type.unwrap().starts_with("text/plain"));
        assert_eq!(
            seen.body,
            "Aspirin is acetylsalicylic acid.\nTake aspirin daily. Aspirin! Water.\n"
        );
    }

    #[tokio::test]
    async fn non_success_status_is_a_transport_error() {
        let (addr, _) = stub().await;
        let err = run(&recogniser(addr, "/fail"), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let (addr, _) = stub().await;
        let err = run(&recogniser(addr, "/garbage"), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)), "{err:?}");
    }

    #[tokio::test]
    async fn entity_spanning_snippets_fails_the_request() {
        let (addr, _) = stub().await;
        let err = run(&recogniser(addr, "/span"), BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)), "{err:?}");
    }

    #[tokio::test]
    async fn empty_document_makes_no_request() {
        let rec = LeadmineRecogniser::new(
            "leadmine",
            reqwest::Client::new(),
            "http://127.0.0.1:1/annotate",
            BTreeMap::new(),
            Arc::default(),
        )
        .unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        tx.send(SnippetEvent::End).await.unwrap();
        let got = rec.recognise(rx, RecogniseOptions::default()).await.unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn response_shape_decodes() {
        let js = r#"{"created":"2020-01-01","entities":[{"beg":1,"end":4,"begInNormalizedDoc":1,
            "endInNormalizedDoc":4,"entityText":"abc","entityGroup":"G","resolvedEntity":"R",
            "recognisingDict":{"enforceBracketing":true},"sectionType":"title"}]}"#;
        let parsed: LeadmineResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.created, "2020-01-01");
        assert_eq!(parsed.entities[0].end, 4);
        assert_eq!(parsed.entities[0].section_type, "title");
    }
}
