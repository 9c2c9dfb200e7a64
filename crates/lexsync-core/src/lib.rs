//! # Lexsync Core
//!
//! Client-side data synchronization layer for the Lexsync legal-assistance
//! client.
//!
//! ## Architecture
//!
//! ```text
//! lexsync-core/src/
//! ├── cache.rs       # LocalCache: namespaced TTL cache over a key-value store
//! ├── endpoint.rs    # EndpointResolver: discovery + health-checked URL caching
//! ├── feed.rs        # ChangeFeedClient: ref-counted, debounced change feeds
//! ├── collection.rs  # SyncedCollection: cache-first reads, optimistic writes
//! ├── config.rs      # Tunables (TTLs, debounce window, probe timeout)
//! ├── store.rs       # Persistent key-value store boundary
//! └── utils/         # HTTP client construction, clock injection, tracing init
//! ```
//!
//! `SyncedCollection` is the composition root: the UI asks it for data, it
//! asks `EndpointResolver` for a base URL and `LocalCache` for a fast path,
//! and it keeps itself fresh through one `ChangeFeedClient` subscription per
//! scope. Mutations go through the optimistic apply/confirm/rollback path
//! independent of reads.
//!
//! Authentication, the persistent store engine, and the realtime wire
//! protocol are external collaborators injected at construction.

pub mod cache;
pub mod collection;
pub mod config;
pub mod endpoint;
pub mod feed;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use cache::{AssumeOnline, LocalCache, ReachabilityProbe};
pub use collection::{
    AuthTokenProvider, CollectionFetcher, CollectionOptions, HttpCollectionFetcher,
    StaticTokenProvider, SyncedCollection,
};
pub use config::SyncConfig;
pub use endpoint::{DiscoveryFn, EndpointResolver, ResolverOptions};
pub use feed::{
    ChangeFeedClient, FeedConnection, FeedListener, FeedSignal, InProcessTransport,
    RealtimeTransport, SubscriptionHandle,
};
pub use store::{KeyValueStore, MemoryStore};
pub use utils::clock::{Clock, ManualClock, SystemClock};
