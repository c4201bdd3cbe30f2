use nerpipe_core::{Cache, GetPipeline, SetPipeline};
use nerpipe_local::MemoryCache;
use nerpipe_server::{build_state, config::Config, router, AppState};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

const CONFIG: &str = r#"
bind = "127.0.0.1:0"

[[dictionary]]
name = "chem"
format = "leadmine"

[[regex]]
name = "ids"
patterns = { chembl = '^chembl\d+$' }
"#;

/// Start the router on an ephemeral port with a one-entry chemical dictionary.
async fn spawn(extra: &str) -> String {
    let mut dict = tempfile::NamedTempFile::new().unwrap();
    writeln!(dict, "# name\tid").unwrap();
    writeln!(dict, "calcium chloride\tCHEBI:3312").unwrap();

    let mut config = Config::from_toml(&format!("{CONFIG}\n{extra}")).unwrap();
    config.dictionaries[0].files = vec![dict.path().to_path_buf()];
    let state = build_state(config).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::new(state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn post(url: &str, content_type: Option<&str>, body: &'static str) -> reqwest::Response {
    let mut req = reqwest::Client::new().post(url).body(body);
    if let Some(ct) = content_type {
        req = req.header("content-type", ct);
    }
    req.send().await.unwrap()
}

#[tokio::test]
async fn text_endpoint_returns_visible_text() {
    let base = spawn("").await;
    let resp = post(
        &format!("{base}/html/text"),
        Some("text/html"),
        "<html><body><div>one</div><style>p{}</style><p>two</p></body></html>",
    )
    .await;
    assert_eq!(resp.status(), 200);
    let ct = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(ct.starts_with("text/plain"), "{ct}");
    assert_eq!(resp.text().await.unwrap(), "one\ntwo\n");
}

#[tokio::test]
async fn tokens_endpoint_honours_exact_match() {
    let base = spawn("").await;
    let split: Value = post(&format!("{base}/html/tokens"), None, "<p>apple-pie</p>")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(split.as_array().unwrap().len(), 3);
    assert_eq!(split[2], serde_json::json!({"text": "pie", "offset": 9, "xpath": "/p"}));

    let glued: Value = post(
        &format!("{base}/html/tokens?exactMatch=true"),
        None,
        "<p>apple-pie</p>",
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(glued, serde_json::json!([{"text": "apple-pie", "offset": 3, "xpath": "/p"}]));
}

#[tokio::test]
async fn entities_from_a_named_dictionary() {
    let base = spawn("").await;
    let resp = post(
        &format!("{base}/html/entities?recogniser=chem"),
        Some("text/html; charset=utf-8"),
        "<p>Calcium chloride</p>",
    )
    .await;
    assert_eq!(resp.status(), 200);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v.as_array().unwrap().len(), 1, "{v}");
    assert_eq!(v[0]["name"], "calcium chloride");
    assert_eq!(v[0]["position"], 3);
    assert_eq!(v[0]["xpath"], "/p");
    assert_eq!(v[0]["recogniser"], "chem");
    assert_eq!(v[0]["identifiers"]["leadmine"], "CHEBI:3312");
}

#[tokio::test]
async fn all_recognisers_are_grouped_in_registration_order() {
    let base = spawn("").await;
    let v: Value = post(
        &format!("{base}/html/entities?allRecognisers=true"),
        None,
        "<p>CHEMBL25 is not calcium chloride</p>",
    )
    .await
    .json()
    .await
    .unwrap();
    let got: Vec<_> = v
        .as_array()
        .unwrap()
        .iter()
        .map(|e| (e["name"].as_str().unwrap(), e["recogniser"].as_str().unwrap()))
        .collect();
    assert_eq!(got, vec![("calcium chloride", "chem"), ("chembl25", "chembl")]);
}

#[tokio::test]
async fn plain_text_bodies_are_one_root_snippet() {
    let base = spawn("").await;
    let v: Value = post(
        &format!("{base}/html/entities?recogniser=chem"),
        Some("text/plain"),
        "add calcium chloride",
    )
    .await
    .json()
    .await
    .unwrap();
    assert_eq!(v[0]["position"], 4);
    assert_eq!(v[0]["xpath"], "/");
}

#[tokio::test]
async fn blocklisted_names_are_dropped() {
    let base = spawn("[blocklist]\ncase_insensitive = [\"Calcium Chloride\"]").await;
    let v: Value = post(
        &format!("{base}/html/entities?allRecognisers=true"),
        None,
        "<p>calcium chloride and CHEMBL25</p>",
    )
    .await
    .json()
    .await
    .unwrap();
    let names: Vec<_> = v.as_array().unwrap().iter().map(|e| e["name"].clone()).collect();
    assert_eq!(names, vec![Value::from("chembl25")]);
}

#[tokio::test]
async fn bad_requests_are_rejected_with_400() {
    let base = spawn("").await;
    let cases = [
        ("/html/entities?recogniser=nope", None, "<p>x</p>", "unknown recogniser"),
        ("/html/entities", None, "<p>x</p>", "no recogniser selected"),
        ("/html/entities?recogniser=chem", None, "", "empty"),
        ("/html/text", Some("application/json"), "{}", "content type"),
        ("/html/entities?allRecognisers=maybe", None, "<p>x</p>", "allRecognisers"),
    ];
    for (path, ct, body, needle) in cases {
        let resp = post(&format!("{base}{path}"), ct, body).await;
        assert_eq!(resp.status(), 400, "{path}");
        let v: Value = resp.json().await.unwrap();
        let msg = v["error"].as_str().unwrap_or_default();
        assert!(msg.contains(needle), "{path}: {msg}");
    }
}

#[tokio::test]
async fn invalid_utf8_is_an_internal_error() {
    let base = spawn("").await;
    let resp = reqwest::Client::new()
        .post(format!("{base}/html/entities?recogniser=chem"))
        .body(vec![b'<', b'p', b'>', 0xff, 0xfe])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let v: Value = resp.json().await.unwrap();
    assert!(v["error"].as_str().unwrap().contains("html parse failed"), "{v}");
}

#[tokio::test]
async fn health_is_ok_without_a_remote_cache() {
    let base = spawn("").await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

struct Unready;

#[async_trait::async_trait]
impl Cache for Unready {
    fn name(&self) -> &'static str {
        "unready"
    }

    fn new_get_pipeline(&self, capacity: usize) -> Box<dyn GetPipeline> {
        MemoryCache::new().new_get_pipeline(capacity)
    }

    fn new_set_pipeline(&self, capacity: usize) -> Box<dyn SetPipeline> {
        MemoryCache::new().new_set_pipeline(capacity)
    }

    async fn ready(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn health_is_503_when_the_cache_is_down() {
    let state = AppState {
        engine: Default::default(),
        cache: Some(Arc::new(Unready)),
        config: Arc::new(Config::default()),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(Arc::new(state))).await.unwrap();
    });
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 503);
}
