#![allow(unused_crate_dependencies)]
#![allow(clippy::expect_used, reason = "integration test — panics are the assertion mechanism")]

use std::sync::Arc;
use std::time::Duration;

use lexsync_core::{
    ChangeFeedClient, CollectionOptions, EndpointResolver, HttpCollectionFetcher,
    InProcessTransport, LocalCache, ManualClock, MemoryStore, ResolverOptions,
    StaticTokenProvider, SyncedCollection,
};
use lexsync_types::{RecordPatch, SubscriptionScope, SyncError};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn consultations_body() -> serde_json::Value {
    serde_json::json!([
        {"id": "c1", "status": "pending", "title": "tenancy dispute"},
        {"id": "c2", "status": "accepted", "title": "employment claim"}
    ])
}

struct TestStack {
    cache: Arc<LocalCache>,
    resolver: Arc<EndpointResolver>,
    feed: ChangeFeedClient,
    clock: Arc<ManualClock>,
}

fn stack_for(server_uri: &str) -> TestStack {
    let clock = Arc::new(ManualClock::new(0));
    let cache = Arc::new(LocalCache::new(
        Arc::new(MemoryStore::new()),
        Arc::clone(&clock) as _,
        "lexsync:",
    ));
    let resolver = Arc::new(
        EndpointResolver::new(
            Some(server_uri.to_string()),
            ResolverOptions::default(),
            Arc::clone(&clock) as _,
        )
        .expect("client build"),
    );
    let feed = ChangeFeedClient::with_debounce(
        Arc::new(InProcessTransport::new()) as _,
        Duration::from_millis(50),
    );
    TestStack { cache, resolver, feed, clock }
}

async fn open_collection(stack: &TestStack) -> Arc<SyncedCollection> {
    let fetcher = Arc::new(HttpCollectionFetcher::new(
        reqwest::Client::new(),
        "api/consultations",
    ));
    SyncedCollection::open(
        Arc::clone(&stack.cache),
        Arc::clone(&stack.resolver),
        &stack.feed,
        fetcher,
        Arc::new(StaticTokenProvider(Some("bearer-token".to_string()))),
        SubscriptionScope::new("consultations").with_filter("owner", "u1"),
        CollectionOptions::new("consultations:u1").with_ttl(60_000),
    )
    .await
    .expect("open collection")
}

#[tokio::test]
async fn test_resolver_probes_once_within_interval() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack_for(&server.uri());

    let first = stack.resolver.best_url().await;
    stack.clock.advance(30_000);
    let second = stack.resolver.best_url().await;

    assert_eq!(first, server.uri());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_resolver_fails_open_on_unhealthy_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let stack = stack_for(&server.uri());

    let url = stack.resolver.best_url().await;

    assert_eq!(url, server.uri(), "fail-open must still yield the primary URL");
    assert!(stack.resolver.cached_health().await.is_none());
}

#[tokio::test]
async fn test_cold_load_hits_network_once_then_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/consultations"))
        .and(header("authorization", "Bearer bearer-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(consultations_body()))
        .expect(1)
        .mount(&server)
        .await;

    let stack = stack_for(&server.uri());
    let collection = open_collection(&stack).await;

    let records = collection.load(false).await.expect("cold load");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].field_str("status"), Some("pending"));

    // Second load within TTL must be served from cache; the expect(1) on
    // the mock verifies zero additional fetches.
    let cached = collection.load(false).await.expect("warm load");
    assert_eq!(cached.len(), 2);

    let stats = collection.stats();
    assert_eq!(stats.by_status.get("pending"), Some(&1));
    assert_eq!(stats.by_status.get("accepted"), Some(&1));

    collection.dispose();
}

#[tokio::test]
async fn test_remote_rejection_is_typed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/consultations"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let stack = stack_for(&server.uri());
    let collection = open_collection(&stack).await;

    let err = collection.load(false).await.expect_err("403 must surface");
    assert_eq!(
        err,
        SyncError::RemoteRejected { status: 403, message: "forbidden".to_string() }
    );

    collection.dispose();
}

#[tokio::test]
async fn test_rejected_submit_rolls_back_then_surfaces_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/consultations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(consultations_body()))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/consultations/c1"))
        .respond_with(ResponseTemplate::new(409).set_body_string("version conflict"))
        .mount(&server)
        .await;

    let stack = stack_for(&server.uri());
    let collection = open_collection(&stack).await;
    collection.load(false).await.expect("seed load");

    let client = reqwest::Client::new();
    let err = collection
        .submit(
            RecordPatch::new("c1").set("status", serde_json::json!("closed")),
            |base_url, token| async move {
                let mut request =
                    client.put(format!("{base_url}/api/consultations/c1")).json(&serde_json::json!({
                        "status": "closed"
                    }));
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                let response = request
                    .send()
                    .await
                    .map_err(|e| SyncError::NetworkUnavailable { message: e.to_string() })?;
                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(SyncError::RemoteRejected {
                        status: status.as_u16(),
                        message: response.text().await.unwrap_or_default(),
                    })
                }
            },
        )
        .await
        .expect_err("409 must surface");

    assert!(matches!(err, SyncError::RemoteRejected { status: 409, .. }));

    // Rollback has already run: the record is back on its server state.
    let c1 = collection
        .records()
        .into_iter()
        .find(|r| r.id == "c1")
        .expect("c1 present");
    assert_eq!(c1.field_str("status"), Some("pending"));
    assert_eq!(collection.pending_mutations(), 0);

    collection.dispose();
}
