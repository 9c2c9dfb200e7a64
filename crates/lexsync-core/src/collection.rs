//! Synchronized collections: cache-first reads, optimistic mutations with
//! rollback, and invalidation driven by the change feed.
//!
//! One `SyncedCollection` exists per logical scope (e.g. "this user's
//! consultations"). It is caller-owned: callers must `dispose()` on every
//! exit path, which releases the feed subscription and makes any in-flight
//! load discard its result.
//!
//! # Record state machine
//!
//! ```text
//! Idle ──optimistic_apply──▶ Optimistic ──confirm───▶ Idle
//!                                 │
//!                                 └──rollback──▶ RolledBack (▶ Idle)
//! ```
//!
//! A reload racing an unresolved optimistic mutation never overwrites the
//! mutated record: records with a pending `MutationIntent` are carried over
//! from the in-memory view until the intent is confirmed or rolled back.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lexsync_types::{
    CollectionStats, MutationIntent, RecordPatch, SubscriptionScope, SyncError, SyncState,
    SyncedRecord,
};
use serde_json::Value;

use crate::cache::LocalCache;
use crate::endpoint::EndpointResolver;
use crate::feed::{ChangeFeedClient, FeedSignal, SubscriptionHandle};

/// External auth boundary: the sync layer only consumes the current bearer
/// token, never manages its lifecycle.
pub trait AuthTokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Fixed-token provider for tests and offline fixtures.
pub struct StaticTokenProvider(pub Option<String>);

impl AuthTokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Fetches the authoritative record set for one collection.
#[async_trait]
pub trait CollectionFetcher: Send + Sync {
    async fn fetch(
        &self,
        base_url: &str,
        access_token: Option<&str>,
    ) -> Result<Vec<SyncedRecord>, SyncError>;
}

/// Standard fetcher: `GET {base_url}/{resource_path}` returning a JSON array
/// of objects, each with an `"id"` field.
pub struct HttpCollectionFetcher {
    client: reqwest::Client,
    resource_path: String,
}

impl HttpCollectionFetcher {
    pub fn new(client: reqwest::Client, resource_path: impl Into<String>) -> Self {
        Self { client, resource_path: resource_path.into() }
    }
}

#[async_trait]
impl CollectionFetcher for HttpCollectionFetcher {
    async fn fetch(
        &self,
        base_url: &str,
        access_token: Option<&str>,
    ) -> Result<Vec<SyncedRecord>, SyncError> {
        let url = format!("{}/{}", base_url.trim_end_matches('/'), self.resource_path);
        let mut request = self.client.get(&url);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout
            } else {
                SyncError::NetworkUnavailable { message: e.to_string() }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::RemoteRejected { status: status.as_u16(), message });
        }

        let values: Vec<Value> = response
            .json()
            .await
            .map_err(|e| SyncError::NetworkUnavailable { message: format!("invalid body: {e}") })?;

        Ok(values.into_iter().filter_map(record_from_value).collect())
    }
}

fn record_from_value(value: Value) -> Option<SyncedRecord> {
    let Value::Object(mut fields) = value else {
        tracing::warn!("collection element is not an object; skipping");
        return None;
    };
    let id = fields.get("id").and_then(Value::as_str)?.to_string();
    fields.remove("id");
    Some(SyncedRecord::new(id, fields))
}

/// Per-collection knobs.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Cache key for this collection's record set
    pub cache_key: String,
    /// TTL for the cached record set
    pub ttl_ms: i64,
    /// Field used to group records for `CollectionStats`
    pub status_field: String,
}

impl CollectionOptions {
    pub fn new(cache_key: impl Into<String>) -> Self {
        Self {
            cache_key: cache_key.into(),
            ttl_ms: crate::config::DEFAULT_TTL_MS,
            status_field: "status".to_string(),
        }
    }

    pub fn with_ttl(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_status_field(mut self, field: impl Into<String>) -> Self {
        self.status_field = field.into();
        self
    }
}

#[derive(Default)]
struct CollectionState {
    records: Vec<SyncedRecord>,
    /// Pending optimistic mutations keyed by rollback token
    intents: HashMap<String, MutationIntent>,
    /// Highest confirmed sequence per record, for superseded-rollback checks
    confirmed_seq: HashMap<String, u64>,
    stats: CollectionStats,
}

/// Composition root over cache, resolver, and change feed for one scope.
pub struct SyncedCollection {
    cache: Arc<LocalCache>,
    resolver: Arc<EndpointResolver>,
    fetcher: Arc<dyn CollectionFetcher>,
    auth: Arc<dyn AuthTokenProvider>,
    options: CollectionOptions,
    state: Mutex<CollectionState>,
    /// Monotonic apply-time counter for mutation ordering (never wall-clock)
    sequence: AtomicU64,
    /// Bumped on dispose; in-flight loads compare and discard
    generation: AtomicU64,
    disposed: AtomicBool,
    feed_lost: AtomicBool,
    feed_handle: Mutex<Option<SubscriptionHandle>>,
}

impl SyncedCollection {
    /// Construct the collection and wire its invalidation subscription.
    ///
    /// The feed listener holds only a weak reference, so a disposed and
    /// dropped collection never receives further signals.
    pub async fn open(
        cache: Arc<LocalCache>,
        resolver: Arc<EndpointResolver>,
        feed: &ChangeFeedClient,
        fetcher: Arc<dyn CollectionFetcher>,
        auth: Arc<dyn AuthTokenProvider>,
        scope: SubscriptionScope,
        options: CollectionOptions,
    ) -> Result<Arc<Self>, SyncError> {
        let collection = Arc::new(Self {
            cache,
            resolver,
            fetcher,
            auth,
            options,
            state: Mutex::new(CollectionState::default()),
            sequence: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            feed_lost: AtomicBool::new(false),
            feed_handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&collection);
        let handle = feed
            .subscribe(
                scope,
                Arc::new(move |signal| {
                    let Some(collection) = weak.upgrade() else {
                        return;
                    };
                    match signal {
                        FeedSignal::Changed => {
                            tokio::spawn(async move {
                                if let Err(err) = collection.invalidate().await {
                                    tracing::warn!(error = %err, "invalidation reload failed");
                                }
                            });
                        }
                        FeedSignal::Lost => {
                            collection.feed_lost.store(true, Ordering::SeqCst);
                            tracing::warn!("change feed lost; collection will serve stale data until re-opened");
                        }
                    }
                }),
            )
            .await?;

        if let Ok(mut guard) = collection.feed_handle.lock() {
            *guard = Some(handle);
        }

        Ok(collection)
    }

    /// Cache-first load. `force_refresh` skips the cache fast path.
    ///
    /// Fail-open: if the fetch fails transiently and the collection already
    /// holds records, those are returned instead of an error.
    pub async fn load(&self, force_refresh: bool) -> Result<Vec<SyncedRecord>, SyncError> {
        let generation = self.generation.load(Ordering::SeqCst);

        if !force_refresh {
            if let Some(cached) =
                self.cache.get::<Vec<SyncedRecord>>(&self.options.cache_key).await
            {
                tracing::debug!(key = %self.options.cache_key, count = cached.len(), "cache hit");
                return Ok(self.adopt(cached));
            }
        }

        let base_url = self.resolver.best_url().await;
        let token = self.auth.access_token();

        let fetched = match self.fetcher.fetch(&base_url, token.as_deref()).await {
            Ok(records) => records,
            Err(err) if err.is_transient() => {
                let snapshot = self.records();
                if snapshot.is_empty() {
                    return Err(err);
                }
                tracing::warn!(error = %err, "fetch failed; serving last-known records");
                return Ok(snapshot);
            }
            Err(err) => return Err(err),
        };

        // Stale-response guard: a dispose (or a newer generation) between
        // our await points means this result must not be applied.
        if self.disposed.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            tracing::debug!(key = %self.options.cache_key, "discarding stale load result");
            return Ok(self.records());
        }

        // The raw server result is what gets cached; pending optimistic
        // state stays purely in memory.
        self.cache.set(&self.options.cache_key, &fetched, Some(self.options.ttl_ms)).await;
        Ok(self.adopt(fetched))
    }

    /// Apply a patch in memory immediately and return a rollback token.
    ///
    /// Synchronous by design: callers get instant feedback before any
    /// network round-trip.
    pub fn optimistic_apply(&self, patch: RecordPatch) -> Result<String, SyncError> {
        let mut state = self.state_guard();

        let record = state
            .records
            .iter_mut()
            .find(|r| r.id == patch.target_id)
            .ok_or_else(|| SyncError::UnknownRecord { id: patch.target_id.clone() })?;

        let previous_snapshot = record.clone();
        for (field, value) in &patch.fields {
            record.fields.insert(field.clone(), value.clone());
        }
        record.sync_state = SyncState::Optimistic;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let token = uuid::Uuid::new_v4().to_string();
        let intent = MutationIntent {
            token: token.clone(),
            target_id: patch.target_id.clone(),
            patch: patch.fields,
            previous_snapshot,
            sequence,
        };
        tracing::debug!(target = %intent.target_id, sequence, "optimistic mutation applied");
        state.intents.insert(token.clone(), intent);

        state.stats = CollectionStats::compute(&state.records, &self.options.status_field);
        Ok(token)
    }

    /// Server acknowledged the mutation: the optimistic value becomes
    /// authoritative. Returns false for unknown/already-resolved tokens.
    pub fn confirm(&self, token: &str) -> bool {
        let mut state = self.state_guard();
        let Some(intent) = state.intents.remove(token) else {
            return false;
        };

        let highest = state.confirmed_seq.entry(intent.target_id.clone()).or_insert(0);
        *highest = (*highest).max(intent.sequence);

        if let Some(record) = state.records.iter_mut().find(|r| r.id == intent.target_id) {
            record.sync_state = SyncState::Idle;
        }
        tracing::debug!(target = %intent.target_id, sequence = intent.sequence, "mutation confirmed");
        true
    }

    /// Server rejected the mutation: restore the pre-mutation snapshot,
    /// unless a newer confirmed state has superseded it (then no-op).
    /// Patches from newer still-pending mutations on the same record are
    /// preserved on top of the restored snapshot. Returns true when a
    /// restore actually happened.
    pub fn rollback(&self, token: &str) -> bool {
        let mut state = self.state_guard();
        let Some(intent) = state.intents.remove(token) else {
            return false;
        };

        let superseded =
            state.confirmed_seq.get(&intent.target_id).copied().unwrap_or(0) > intent.sequence;
        if superseded {
            tracing::debug!(target = %intent.target_id, sequence = intent.sequence, "rollback superseded; skipping");
            return false;
        }

        // Newer pending mutations stacked on the same record survive this
        // rollback: replay their patches on the restored snapshot and rebase
        // their own snapshots, so no later rollback can resurrect the
        // rejected patch.
        let mut newer_tokens: Vec<(u64, String)> = state
            .intents
            .values()
            .filter(|i| i.target_id == intent.target_id && i.sequence > intent.sequence)
            .map(|i| (i.sequence, i.token.clone()))
            .collect();
        newer_tokens.sort_unstable();

        let mut restore_to = intent.previous_snapshot.clone();
        for (_, newer_token) in &newer_tokens {
            if let Some(pending) = state.intents.get_mut(newer_token) {
                pending.previous_snapshot = restore_to.clone();
                for (field, value) in &pending.patch {
                    restore_to.fields.insert(field.clone(), value.clone());
                }
                restore_to.sync_state = SyncState::Optimistic;
            }
        }

        let restored =
            if let Some(record) = state.records.iter_mut().find(|r| r.id == intent.target_id) {
                // Bit-for-bit restore when no newer mutation is pending. The
                // RolledBack state is transient by contract: nothing can
                // observe the record inside this critical section, so it
                // lands directly on the rebased state.
                *record = restore_to;
                true
            } else {
                false
            };

        if restored {
            tracing::debug!(target = %intent.target_id, sequence = intent.sequence, "mutation rolled back");
            state.stats = CollectionStats::compute(&state.records, &self.options.status_field);
        }
        restored
    }

    /// Optimistically apply `patch`, run the server round-trip, then confirm
    /// or roll back. The rollback has always completed before the error is
    /// returned, so callers never observe an inconsistent optimistic state.
    pub async fn submit<F, Fut>(&self, patch: RecordPatch, round_trip: F) -> Result<(), SyncError>
    where
        F: FnOnce(String, Option<String>) -> Fut,
        Fut: Future<Output = Result<(), SyncError>>,
    {
        let token = self.optimistic_apply(patch)?;
        let base_url = self.resolver.best_url().await;
        let access_token = self.auth.access_token();

        match round_trip(base_url, access_token).await {
            Ok(()) => {
                self.confirm(&token);
                Ok(())
            }
            Err(err) => {
                self.rollback(&token);
                Err(err)
            }
        }
    }

    /// Drop the cache entry and reload from the network. This is the target
    /// of the debounced change-feed callback.
    pub async fn invalidate(&self) -> Result<Vec<SyncedRecord>, SyncError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        tracing::debug!(key = %self.options.cache_key, "invalidated by change feed");
        self.cache.remove(&self.options.cache_key).await;
        self.load(true).await
    }

    /// Current in-memory record set.
    pub fn records(&self) -> Vec<SyncedRecord> {
        self.state_guard().records.clone()
    }

    /// Derived aggregate state, recomputed on every load and mutation.
    pub fn stats(&self) -> CollectionStats {
        self.state_guard().stats.clone()
    }

    /// Number of unresolved optimistic mutations.
    pub fn pending_mutations(&self) -> usize {
        self.state_guard().intents.len()
    }

    /// Whether the change feed for this collection has been lost.
    pub fn is_feed_lost(&self) -> bool {
        self.feed_lost.load(Ordering::SeqCst)
    }

    /// Release the feed subscription and invalidate in-flight loads.
    /// Idempotent; also runs on drop, but callers should invoke it
    /// explicitly on all exit paths.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut guard) = self.feed_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.dispose();
            }
        }
        tracing::debug!(key = %self.options.cache_key, "collection disposed");
    }

    /// Merge a fetched/cached record set into memory, preserving records
    /// with pending optimistic mutations (defer-until-confirm policy).
    fn adopt(&self, incoming: Vec<SyncedRecord>) -> Vec<SyncedRecord> {
        let mut state = self.state_guard();

        let pending_ids: HashSet<String> =
            state.intents.values().map(|i| i.target_id.clone()).collect();

        let mut merged = Vec::with_capacity(incoming.len());
        let mut seen: HashSet<String> = HashSet::with_capacity(incoming.len());

        for record in incoming {
            if pending_ids.contains(&record.id) {
                if let Some(existing) = state.records.iter().find(|r| r.id == record.id) {
                    tracing::debug!(id = %record.id, "reload skipping record with pending mutation");
                    seen.insert(record.id.clone());
                    merged.push(existing.clone());
                    continue;
                }
            }
            seen.insert(record.id.clone());
            merged.push(record);
        }

        // A pending record the server no longer returns stays until its
        // intent resolves; deleting it out from under an unresolved
        // mutation would orphan the rollback snapshot.
        for existing in &state.records {
            if pending_ids.contains(&existing.id) && !seen.contains(&existing.id) {
                merged.push(existing.clone());
            }
        }

        state.records = merged.clone();
        state.stats = CollectionStats::compute(&state.records, &self.options.status_field);
        merged
    }

    /// Lock the state, recovering from poisoning (a panicked writer) rather
    /// than propagating the panic to every later caller.
    fn state_guard(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for SyncedCollection {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::endpoint::{EndpointResolver, ResolverOptions};
    use crate::feed::{ChangeFeedClient, InProcessTransport};
    use crate::store::MemoryStore;
    use crate::utils::clock::ManualClock;
    use lexsync_types::{ChangeEvent, ChangeEventType};
    use serde_json::{json, Map};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeFetcher {
        responses: Mutex<Vec<Result<Vec<SyncedRecord>, SyncError>>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(responses: Vec<Result<Vec<SyncedRecord>, SyncError>>) -> Arc<Self> {
            Arc::new(Self { responses: Mutex::new(responses), calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CollectionFetcher for FakeFetcher {
        async fn fetch(
            &self,
            _base_url: &str,
            _access_token: Option<&str>,
        ) -> Result<Vec<SyncedRecord>, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(Vec::new());
            }
            responses.remove(0)
        }
    }

    fn record(id: &str, status: &str) -> SyncedRecord {
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!(status));
        fields.insert("title".to_string(), json!(format!("case {id}")));
        SyncedRecord::new(id, fields)
    }

    struct Harness {
        cache: Arc<LocalCache>,
        resolver: Arc<EndpointResolver>,
        feed: ChangeFeedClient,
        transport: Arc<InProcessTransport>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let cache = Arc::new(LocalCache::new(
            Arc::new(MemoryStore::new()),
            Arc::clone(&clock) as _,
            "lexsync:",
        ));
        let options = ResolverOptions { skip_verification: true, ..Default::default() };
        let resolver = Arc::new(
            EndpointResolver::new(
                Some("http://api.test".to_string()),
                options,
                Arc::clone(&clock) as _,
            )
            .unwrap(),
        );
        let transport = Arc::new(InProcessTransport::new());
        let feed = ChangeFeedClient::with_debounce(
            Arc::clone(&transport) as _,
            Duration::from_millis(50),
        );
        Harness { cache, resolver, feed, transport, clock }
    }

    fn scope() -> SubscriptionScope {
        SubscriptionScope::new("consultations").with_filter("owner", "u1")
    }

    async fn open_with(h: &Harness, fetcher: Arc<FakeFetcher>) -> Arc<SyncedCollection> {
        SyncedCollection::open(
            Arc::clone(&h.cache),
            Arc::clone(&h.resolver),
            &h.feed,
            fetcher,
            Arc::new(StaticTokenProvider(Some("tok".to_string()))),
            scope(),
            CollectionOptions::new("consultations:u1").with_ttl(60_000),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_cold_load_fetches_once_then_serves_from_cache() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, Arc::clone(&fetcher)).await;

        let first = collection.load(false).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(fetcher.calls(), 1);

        // Within TTL: zero additional fetches.
        let second = collection.load(false).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(fetcher.calls(), 1);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_expired_cache_triggers_refetch() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![
            Ok(vec![record("c1", "pending")]),
            Ok(vec![record("c1", "accepted")]),
        ]);
        let collection = open_with(&h, Arc::clone(&fetcher)).await;

        collection.load(false).await.unwrap();
        h.clock.advance(61_000);

        let reloaded = collection.load(false).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(reloaded[0].field_str("status"), Some("accepted"));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_load_recomputes_stats() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![
            record("c1", "pending"),
            record("c2", "pending"),
            record("c3", "accepted"),
        ])]);
        let collection = open_with(&h, fetcher).await;

        collection.load(false).await.unwrap();
        let stats = collection.stats();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status.get("pending"), Some(&2));
        assert_eq!(stats.by_status.get("accepted"), Some(&1));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_optimistic_apply_then_rollback_restores_snapshot() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let before = collection.records()[0].clone();
        let patch = RecordPatch::new("c1").set("status", json!("accepted"));
        let token = collection.optimistic_apply(patch).unwrap();

        let mutated = collection.records()[0].clone();
        assert_eq!(mutated.field_str("status"), Some("accepted"));
        assert_eq!(mutated.sync_state, SyncState::Optimistic);

        assert!(collection.rollback(&token));
        let after = collection.records()[0].clone();
        assert_eq!(after, before);
        assert_eq!(collection.pending_mutations(), 0);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_confirm_makes_optimistic_value_authoritative() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let token = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("accepted")))
            .unwrap();
        assert!(collection.confirm(&token));

        let record = collection.records()[0].clone();
        assert_eq!(record.field_str("status"), Some("accepted"));
        assert_eq!(record.sync_state, SyncState::Idle);

        // Rollback after confirm is a no-op.
        assert!(!collection.rollback(&token));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_superseded_rollback_is_noop() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let first = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("accepted")))
            .unwrap();
        let second = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("closed")))
            .unwrap();

        // The newer mutation is confirmed; rolling back the older one must
        // not regress the record.
        assert!(collection.confirm(&second));
        assert!(!collection.rollback(&first));

        assert_eq!(collection.records()[0].field_str("status"), Some("closed"));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_stacked_rollbacks_restore_original_state() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let first = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("accepted")))
            .unwrap();
        let second = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("closed")))
            .unwrap();

        // Rolling back the older mutation keeps the newer pending patch
        // visible; its rejected value must not linger anywhere.
        assert!(collection.rollback(&first));
        let mid = collection.records()[0].clone();
        assert_eq!(mid.field_str("status"), Some("closed"));
        assert_eq!(mid.sync_state, SyncState::Optimistic);

        // Rolling back the newer mutation lands on the original server
        // state, not on the already-rejected first patch.
        assert!(collection.rollback(&second));
        let after = collection.records()[0].clone();
        assert_eq!(after.field_str("status"), Some("pending"));
        assert_eq!(after.sync_state, SyncState::Idle);
        assert_eq!(collection.pending_mutations(), 0);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_stacked_rollbacks_newest_first() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let first = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("accepted")))
            .unwrap();
        let second = collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("closed")))
            .unwrap();

        assert!(collection.rollback(&second));
        assert_eq!(collection.records()[0].field_str("status"), Some("accepted"));
        assert_eq!(collection.records()[0].sync_state, SyncState::Optimistic);

        assert!(collection.rollback(&first));
        assert_eq!(collection.records()[0].field_str("status"), Some("pending"));
        assert_eq!(collection.records()[0].sync_state, SyncState::Idle);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_unknown_target_is_rejected() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let err = collection
            .optimistic_apply(RecordPatch::new("ghost").set("status", json!("x")))
            .unwrap_err();

        assert_eq!(err, SyncError::UnknownRecord { id: "ghost".to_string() });

        collection.dispose();
    }

    #[tokio::test]
    async fn test_reload_preserves_pending_optimistic_record() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![
            Ok(vec![record("c1", "pending"), record("c2", "pending")]),
            // Server still says pending for c1; c2 updated remotely.
            Ok(vec![record("c1", "pending"), record("c2", "accepted")]),
        ]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        collection
            .optimistic_apply(RecordPatch::new("c1").set("status", json!("accepted")))
            .unwrap();

        let reloaded = collection.load(true).await.unwrap();

        let c1 = reloaded.iter().find(|r| r.id == "c1").unwrap();
        let c2 = reloaded.iter().find(|r| r.id == "c2").unwrap();
        assert_eq!(c1.field_str("status"), Some("accepted"));
        assert_eq!(c1.sync_state, SyncState::Optimistic);
        assert_eq!(c2.field_str("status"), Some("accepted"));
        assert_eq!(c2.sync_state, SyncState::Idle);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_fail_open_serves_last_known_records() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![
            Ok(vec![record("c1", "pending")]),
            Err(SyncError::NetworkUnavailable { message: "offline".to_string() }),
        ]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let served = collection.load(true).await.unwrap();
        assert_eq!(served.len(), 1);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_network_error_with_no_data_propagates() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Err(SyncError::NetworkUnavailable {
            message: "offline".to_string(),
        })]);
        let collection = open_with(&h, fetcher).await;

        let err = collection.load(false).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable { .. }));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_submit_rolls_back_before_surfacing_rejection() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![record("c1", "pending")])]);
        let collection = open_with(&h, fetcher).await;
        collection.load(false).await.unwrap();

        let err = collection
            .submit(RecordPatch::new("c1").set("status", json!("accepted")), |_base, _token| async {
                Err(SyncError::RemoteRejected { status: 422, message: "not allowed".to_string() })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::RemoteRejected { status: 422, .. }));
        // Rollback already applied: the caller sees the pre-mutation state.
        assert_eq!(collection.records()[0].field_str("status"), Some("pending"));
        assert_eq!(collection.pending_mutations(), 0);

        collection.dispose();
    }

    #[tokio::test]
    async fn test_change_events_trigger_single_debounced_reload() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![
            Ok(vec![record("c1", "pending")]),
            Ok(vec![record("c1", "accepted")]),
        ]);
        let collection = open_with(&h, Arc::clone(&fetcher)).await;
        collection.load(false).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        let key = scope().scope_key();
        for _ in 0..5 {
            let delivered = h
                .transport
                .emit(
                    &key,
                    ChangeEvent {
                        table: "consultations".to_string(),
                        event_type: ChangeEventType::Update,
                        affected_id: Some("c1".to_string()),
                    },
                )
                .await;
            assert!(delivered);
        }

        // One debounce window plus scheduling slack.
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(collection.records()[0].field_str("status"), Some("accepted"));

        collection.dispose();
    }

    #[tokio::test]
    async fn test_dispose_releases_feed_subscription() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![])]);
        let collection = open_with(&h, fetcher).await;

        assert_eq!(h.feed.active_scopes(), 1);
        collection.dispose();
        assert_eq!(h.feed.active_scopes(), 0);

        // Idempotent.
        collection.dispose();
    }

    #[tokio::test]
    async fn test_feed_loss_marks_collection() {
        let h = harness();
        let fetcher = FakeFetcher::new(vec![Ok(vec![])]);
        let collection = open_with(&h, fetcher).await;

        h.transport.drop_feed(&scope().scope_key());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(collection.is_feed_lost());

        collection.dispose();
    }
}
