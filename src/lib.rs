//! swr-reactive - A reactive stale-while-revalidate (SWR) cache for Rust
//!
//! This library provides a client-side caching engine with:
//! - Stale-while-revalidate (SWR) semantics over reactive streams
//! - Keyed entry lifecycle with refcounted, deferred teardown
//! - Deduplication of in-flight fetches per key
//! - Retry with a fixed delay on fetch failure
//! - Optimistic local mutation with optional revalidation
//! - Revalidation on focus/online signals and cross-context storage changes
//! - Pluggable persistence (in-memory, Redis, or none)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swr_reactive::{MemoryStore, Mutation, Swr, SwrError};
//!
//! #[derive(Clone, serde::Serialize, serde::Deserialize)]
//! struct Todo {
//!     id: u64,
//!     title: String,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let swr: Swr<Todo> = Swr::builder(|args| async move {
//!         let url = args[0].as_str().unwrap_or_default().to_string();
//!         fetch_todo(&url)
//!             .await
//!             .map_err(|e| SwrError::fetch(url, e.to_string()))
//!     })
//!     .store(Arc::new(MemoryStore::new()))
//!     .build();
//!
//!     // Latest value immediately, refreshed in the background
//!     let mut todos = swr.subscribe("/todos/1", None).await;
//!     while let Ok(Some(todo)) = todos.next_data().await {
//!         println!("{}", todo.title);
//!     }
//!
//!     // Optimistic update; pass Some(true) to refetch afterwards
//!     todos
//!         .mutate(
//!             Mutation::update(|current: Option<Todo>| {
//!                 let mut todo = current.unwrap();
//!                 todo.title.push_str(" (done)");
//!                 todo
//!             }),
//!             None,
//!         )
//!         .await
//!         .unwrap();
//! }
//! ```

mod builder;
mod cache;
mod clock;
mod entry;
mod error;
mod events;
mod item;
mod key;
mod retry;
mod store;
pub mod stores;
mod swr;

// Re-export public API
pub use builder::SwrBuilder;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::SwrError;
pub use events::{EventBus, StorageEvent};
pub use item::CacheItem;
pub use key::KeySpec;
pub use retry::retry_with_delay;
pub use store::PersistentStore;
pub use stores::memory::MemoryStore;
pub use stores::redis::{RedisStore, RedisStoreConfig};
pub use swr::{
    DataStream, ErrorStream, FetchFuture, Mutation, Subscription, Swr, UseOptions,
    ValidationStream,
};
