use crate::AppState;
use axum::{
    body::Bytes,
    extract::{RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nerpipe_core::{Entity, Error, RecogniseOptions, Recogniser, Snippet, Token};
use nerpipe_local::{html::SnippetReader, textprep, visible_text, Job, UnknownRecogniser};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] Error),
}

impl From<UnknownRecogniser> for ApiError {
    fn from(e: UnknownRecogniser) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(e) => {
                tracing::warn!(error = %e, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/html/text", post(html_text))
        .route("/html/tokens", post(html_tokens))
        .route("/html/entities", post(html_entities))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Html,
    Plain,
}

fn body_kind(headers: &HeaderMap) -> ApiResult<BodyKind> {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return Ok(BodyKind::Html);
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::BadRequest("unreadable content type".to_string()))?;
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "" | "text/html" | "application/xhtml+xml" => Ok(BodyKind::Html),
        "text/plain" => Ok(BodyKind::Plain),
        other => Err(ApiError::BadRequest(format!(
            "unsupported content type: {other}"
        ))),
    }
}

fn plain_text(body: &Bytes) -> ApiResult<String> {
    String::from_utf8(body.to_vec())
        .map_err(|e| ApiError::BadRequest(format!("body is not utf-8: {e}")))
}

/// Query string of `/html/entities` and `/html/tokens`.
///
/// `options.params` holds every unrecognised key as given; `<recogniser>.<key>` keys are only
/// split out once the selected recognisers are known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Selection {
    recognisers: Vec<String>,
    all: bool,
    options: RecogniseOptions,
}

fn parse_flag(key: &str, value: &str) -> ApiResult<bool> {
    value
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("{key} must be true or false, got {value:?}")))
}

fn parse_selection(raw: Option<&str>) -> ApiResult<Selection> {
    let mut selection = Selection::default();
    let Some(raw) = raw else {
        return Ok(selection);
    };
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        match key.as_ref() {
            "recogniser" => selection.recognisers.push(value.into_owned()),
            "allRecognisers" => selection.all = parse_flag(&key, &value)?,
            "exactMatch" => selection.options.exact_match = parse_flag(&key, &value)?,
            _ => {
                selection
                    .options
                    .params
                    .insert(key.into_owned(), value.into_owned());
            }
        }
    }
    Ok(selection)
}

/// Split `key` into a selected recogniser's name and the key it scopes.
fn scoped<'a>(names: &'a [String], key: &'a str) -> Option<(&'a str, &'a str)> {
    names.iter().find_map(|name| {
        let rest = key.strip_prefix(name.as_str())?.strip_prefix('.')?;
        Some((name.as_str(), rest))
    })
}

impl Selection {
    /// Options for each selected recogniser.
    ///
    /// `<recogniser>.<key>=v` reaches only that recogniser, as `<key>=v`, and overrides a shared
    /// param of the same key. `<recogniser>.exactMatch` overrides the shared flag.
    fn jobs(&self, recognisers: Vec<Arc<dyn Recogniser>>) -> ApiResult<Vec<Job>> {
        let names: Vec<String> = recognisers.iter().map(|r| r.name().to_string()).collect();
        let shared = RecogniseOptions {
            exact_match: self.options.exact_match,
            params: self
                .options
                .params
                .iter()
                .filter(|(key, _)| scoped(&names, key).is_none())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        };
        let mut jobs = Vec::with_capacity(recognisers.len());
        for recogniser in recognisers {
            let mut options = shared.clone();
            for (key, value) in &self.options.params {
                match scoped(&names, key) {
                    Some((name, "exactMatch")) if name == recogniser.name() => {
                        options.exact_match = parse_flag(key, value)?;
                    }
                    Some((name, rest)) if name == recogniser.name() => {
                        options.params.insert(rest.to_string(), value.clone());
                    }
                    _ => {}
                }
            }
            jobs.push((recogniser, options));
        }
        Ok(jobs)
    }
}

/// Snippets of a request body, read off the async runtime.
async fn snippets(kind: BodyKind, body: Bytes) -> ApiResult<Vec<Snippet>> {
    match kind {
        BodyKind::Plain => Ok(vec![Snippet::new(plain_text(&body)?, 0, "/")]),
        BodyKind::Html => {
            let snippets = tokio::task::spawn_blocking(move || {
                SnippetReader::new(Cursor::new(body)).collect::<nerpipe_core::Result<Vec<_>>>()
            })
            .await
            .map_err(|e| Error::Invariant(format!("snippet reader did not finish: {e}")))??;
            Ok(snippets)
        }
    }
}

fn require_body(body: &Bytes) -> ApiResult<()> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is empty".to_string()));
    }
    Ok(())
}

async fn html_text(headers: HeaderMap, body: Bytes) -> ApiResult<String> {
    require_body(&body)?;
    let kind = body_kind(&headers)?;
    if kind == BodyKind::Plain {
        return plain_text(&body);
    }
    Ok(visible_text(&snippets(kind, body).await?))
}

/// Every token of every snippet, as the dictionary recogniser would see them before normalising.
pub fn tokens(snippets: &[Snippet], exact_match: bool) -> Vec<Token> {
    let mut out = Vec::new();
    for snippet in snippets {
        textprep::tokenize(snippet, exact_match, |token| out.push(token));
    }
    out
}

async fn html_tokens(
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Vec<Token>>> {
    require_body(&body)?;
    let kind = body_kind(&headers)?;
    let selection = parse_selection(query.as_deref())?;
    let snippets = snippets(kind, body).await?;
    Ok(Json(tokens(&snippets, selection.options.exact_match)))
}

async fn html_entities(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Vec<Entity>>> {
    require_body(&body)?;
    let kind = body_kind(&headers)?;
    let selection = parse_selection(query.as_deref())?;

    let registry = state.engine.registry();
    let recognisers = if selection.all {
        registry.all()
    } else {
        registry.select(selection.recognisers.as_slice())?
    };
    if recognisers.is_empty() {
        return Err(ApiError::BadRequest(
            "no recogniser selected: pass recogniser=NAME or allRecognisers=true".to_string(),
        ));
    }
    let jobs = selection.jobs(recognisers)?;
    tracing::debug!(
        recognisers = jobs.len(),
        exact_match = selection.options.exact_match,
        bytes = body.len(),
        "recognising entities"
    );

    let entities = match kind {
        BodyKind::Html => state.engine.recognise(Cursor::new(body), &jobs).await?,
        BodyKind::Plain => {
            state
                .engine
                .recognise_snippets(snippets(kind, body).await?, &jobs)
                .await?
        }
    };
    Ok(Json(entities))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if let Some(cache) = &state.cache {
        if !cache.ready().await {
            tracing::warn!(cache = cache.name(), "cache not ready");
            return (StatusCode::SERVICE_UNAVAILABLE, "cache not ready");
        }
    }
    (StatusCode::OK, "ok")
}
