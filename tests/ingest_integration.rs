//! End-to-end ingestion against a fake search service, a real SQLite
//! database, and the HTTP API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use docset::config::Config;
use docset::ingest::Ingestor;
use docset::migrate::migrate_pool;
use docset::search_client::DocumentCloudClient;
use docset::server::{build_router, AppState};
use docset::sqlite_store::SqliteStore;
use docset_core::job::JobState;
use docset_core::pipeline::SearchClient;
use docset_core::store::Store;

const TITLES: &[&str] = &[
    "\"Budget memo 2011\"",
    "Budget memo 2012",
    "Budget report",
    "Police report",
    "Police overtime report",
    "Police budget",
    "Meeting minutes",
];

#[derive(Clone)]
struct FakeSearch {
    hits: Arc<AtomicUsize>,
    /// Respond 503 to this many requests before serving results.
    failures: usize,
}

async fn fake_search(
    State(fake): State<FakeSearch>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let hit = fake.hits.fetch_add(1, Ordering::SeqCst);
    if hit < fake.failures {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let page: usize = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let per_page: usize = params.get("per_page").and_then(|p| p.parse().ok()).unwrap_or(100);

    let documents: Vec<Value> = TITLES
        .iter()
        .enumerate()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|(i, title)| {
            json!({
                "id": format!("{}-doc", i + 1),
                "title": title,
                "canonical_url": format!("https://dc.example/documents/{}", i + 1),
                "resources": { "text": format!("https://dc.example/documents/{}.txt", i + 1) }
            })
        })
        .collect();
    Ok(Json(json!({ "documents": documents })))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

struct Env {
    _tmp: TempDir,
    config: Config,
    store: Arc<SqliteStore>,
    hits: Arc<AtomicUsize>,
}

async fn setup(failures: usize, max_attempts: u32) -> Env {
    let hits = Arc::new(AtomicUsize::new(0));
    let search_router = Router::new()
        .route("/api/search.json", get(fake_search))
        .with_state(FakeSearch {
            hits: hits.clone(),
            failures,
        });
    let base = serve(search_router).await;

    let tmp = TempDir::new().unwrap();
    let config_src = format!(
        r#"[db]
path = "{}/docset.sqlite"

[search]
base_url = "{}/api/search.json"
per_page = 3
max_retries = 0

[ingest]
max_attempts = {}
fetch_timeout_secs = 10

[tree]
min_node_size = 5
"#,
        tmp.path().display(),
        base,
        max_attempts
    );
    let config: Config = toml::from_str(&config_src).unwrap();

    let pool = docset::db::connect(&config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    Env {
        _tmp: tmp,
        config,
        store: Arc::new(SqliteStore::new(pool)),
        hits,
    }
}

fn ingestor(env: &Env) -> Ingestor {
    let search: Arc<dyn SearchClient> =
        Arc::new(DocumentCloudClient::new(&env.config.search).unwrap());
    Ingestor::new(env.store.clone(), search, &env.config)
}

#[tokio::test]
async fn job_ingests_every_page_and_builds_tree() {
    let env = setup(0, 3).await;
    let job = env.store.create_document_set_job("budget police").await.unwrap();

    let done = ingestor(&env).process_next("w1").await.unwrap().unwrap();
    assert_eq!(done.state, JobState::Complete);
    // 7 results at 3 per page: pages of 3, 3, 1.
    assert_eq!(env.hits.load(Ordering::SeqCst), 3);

    let docs = env.store.list_documents(job.document_set_id).await.unwrap();
    assert_eq!(docs.len(), 7);
    assert_eq!(docs[0].title, "Budget memo 2011");
    assert_eq!(docs[0].external_id.as_deref(), Some("1-doc"));
    assert_eq!(docs[0].text_url, "https://dc.example/documents/1.txt");
    assert_eq!(done.initial_document_id, Some(docs[0].id));

    let tree = env.store.tree_for_set(job.document_set_id).await.unwrap().unwrap();
    assert_eq!(env.store.tree_documents(tree.id).await.unwrap().len(), 7);
}

#[tokio::test]
async fn rerunning_a_job_does_not_duplicate_documents() {
    let env = setup(0, 3).await;
    let job = env.store.create_document_set_job("budget").await.unwrap();
    let ingestor = ingestor(&env);

    ingestor.process_next("w1").await.unwrap();
    // Simulate a crashed worker: the job is handed out again and re-run.
    let mut again = env.store.get_job(job.id).await.unwrap().unwrap();
    again.state = JobState::InProgress;
    env.store.update_job(&again).await.unwrap();
    let rerun = ingestor.process_next("w2").await.unwrap().unwrap();

    assert_eq!(rerun.state, JobState::Complete);
    assert_eq!(env.store.list_documents(job.document_set_id).await.unwrap().len(), 7);
}

#[tokio::test]
async fn fetch_failures_stay_submitted_until_max_attempts() {
    let env = setup(10, 2).await;
    let job = env.store.create_document_set_job("budget").await.unwrap();
    let ingestor = ingestor(&env);

    let first = ingestor.process_next("w1").await.unwrap().unwrap();
    assert_eq!(first.state, JobState::Submitted);
    assert_eq!(first.attempts, 1);
    assert!(first.last_error.unwrap().contains("503"));

    let second = ingestor.process_next("w1").await.unwrap().unwrap();
    assert_eq!(second.state, JobState::Failed);
    assert!(ingestor.process_next("w1").await.unwrap().is_none());
    assert!(env.store.list_documents(job.document_set_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_have_one_winner() {
    let env = setup(0, 3).await;
    let job = env.store.create_document_set_job("budget").await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = env.store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_job(job.id, &format!("w{}", i), 1_000, 600)
                .await
                .unwrap()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn http_api_drives_the_whole_flow() {
    let env = setup(0, 3).await;
    let base = serve(build_router(AppState {
        store: env.store.clone(),
        config: Arc::new(env.config.clone()),
    }))
    .await;
    let client = reqwest::Client::new();

    let health: Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");

    let created = client
        .post(format!("{}/document-sets", base))
        .json(&json!({ "query": "budget police" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 202);
    let job: Value = created.json().await.unwrap();
    let job_id = job["id"].as_i64().unwrap();
    let set_id = job["document_set_id"].as_i64().unwrap();
    assert_eq!(job["state"], "submitted");

    // Building a tree before ingestion finishes is a conflict.
    let early = client
        .post(format!("{}/document-sets/{}/tree", base, set_id))
        .send()
        .await
        .unwrap();
    assert_eq!(early.status(), 409);
    let body: Value = early.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");

    ingestor(&env).drain("w1").await.unwrap();

    let status: Value = client
        .get(format!("{}/jobs/{}", base, job_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["state"], "complete");
    assert_eq!(status["item_errors"].as_array().unwrap().len(), 0);

    let page: Value = client
        .get(format!("{}/document-sets/{}/documents?offset=5&limit=10", base, set_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["total"], 7);
    assert_eq!(page["documents"].as_array().unwrap().len(), 2);

    let tree_id = page["tree_id"].as_i64().unwrap();
    let nodes: Value = client
        .get(format!("{}/trees/{}/nodes?max=2", base, tree_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let nodes = nodes["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0]["description"], "budget police");

    let none: Value = client
        .get(format!("{}/trees/{}/nodes?max=-1", base, tree_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(none["nodes"].as_array().unwrap().is_empty());

    let first_doc = page["documents"][0]["id"].as_i64().unwrap();
    let tagged: Value = client
        .put(format!("{}/documents/{}/tags", base, first_doc))
        .json(&json!({ "tags": "police, overtime" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tag_id = tagged["tags"][0]["id"].as_i64().unwrap();

    let filtered: Value = client
        .get(format!("{}/document-sets/{}/documents?tags={}", base, set_id, tag_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(filtered["total"], 1);
    assert_eq!(filtered["documents"][0]["id"], first_doc);

    let deleted = client
        .delete(format!("{}/document-sets/{}", base, set_id))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let missing = client
        .get(format!("{}/document-sets/{}/documents", base, set_id))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}
