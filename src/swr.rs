use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::cache::StorageCache;
use crate::clock::Clock;
use crate::entry::{CacheEntry, Source};
use crate::error::SwrError;
use crate::events::EventBus;
use crate::item::CacheItem;
use crate::key::{self, KeySpec};
use crate::retry::retry_with_delay;

/// Boxed future returned by the injected fetcher.
pub type FetchFuture<V> = BoxFuture<'static, Result<V, SwrError>>;

/// The injected resource loader. Receives the decoded fetch arguments.
pub(crate) type Fetcher<V> = Arc<dyn Fn(Vec<Value>) -> FetchFuture<V> + Send + Sync>;

/// Extra grace granted on top of the deduping interval before an idle entry
/// is torn down, so a consumer that unsubscribes and immediately resubscribes
/// keeps its entry.
const TEARDOWN_GRACE_MS: i64 = 100;

/// Per-call options overriding the cache-level defaults.
#[derive(Debug, Clone)]
pub struct UseOptions<V> {
    /// Value to seed a freshly created entry with. It is treated as
    /// immediately stale, so a fetch still runs, but subscribers see the
    /// seed right away.
    pub initial_data: Option<V>,
    /// Lifetime granted to a fresh item; also the teardown grace base.
    pub deduping_interval_ms: Option<i64>,
    /// Delay between retries on fetch failure.
    pub error_retry_interval_ms: Option<i64>,
    /// Total fetch attempts before giving up.
    pub error_retry_count: Option<u32>,
}

impl<V> Default for UseOptions<V> {
    fn default() -> Self {
        UseOptions {
            initial_data: None,
            deduping_interval_ms: None,
            error_retry_interval_ms: None,
            error_retry_count: None,
        }
    }
}

/// A local replacement for a cached value.
pub enum Mutation<V> {
    /// No replacement value. By default this triggers a revalidation.
    None,
    /// Replace the cached value directly.
    Value(V),
    /// Derive the replacement from the current cached value.
    Update(Box<dyn FnOnce(Option<V>) -> V + Send>),
    /// A value that is still being produced. The validating flag is raised
    /// while it resolves; a rejection is returned to the mutate caller.
    Future(FetchFuture<V>),
}

impl<V> Mutation<V> {
    pub fn value(value: V) -> Self {
        Mutation::Value(value)
    }

    pub fn update<F>(update: F) -> Self
    where
        F: FnOnce(Option<V>) -> V + Send + 'static,
    {
        Mutation::Update(Box::new(update))
    }

    pub fn future<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<V, SwrError>> + Send + 'static,
    {
        Mutation::Future(future.boxed())
    }
}

struct LiveData<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    entry: Arc<CacheEntry<V>>,
    rx: watch::Receiver<Source<V>>,
    cache: StorageCache<V>,
    grace: Duration,
}

/// The value stream of a subscription.
///
/// Emits the latest known value on first poll, then every subsequent value.
/// Holding the stream keeps the cache entry alive; dropping the last stream
/// for a key arms the deferred teardown.
pub struct DataStream<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    live: Option<LiveData<V>>,
}

impl<V> DataStream<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// The latest known value, if any.
    pub fn current(&self) -> Option<V> {
        let live = self.live.as_ref()?;
        match &*live.rx.borrow() {
            Source::Item(item) => Some(item.data.clone()),
            _ => None,
        }
    }

    /// Wait for the next value.
    ///
    /// Returns `Ok(Some(value))` for each emission, `Ok(None)` once the entry
    /// completed, and `Err` if retries were exhausted before any data ever
    /// arrived. An inert stream (key not ready) never resolves.
    pub async fn next(&mut self) -> Result<Option<V>, SwrError> {
        let Some(live) = self.live.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if live.rx.changed().await.is_err() {
                return Ok(None);
            }
            let state = live.rx.borrow_and_update().clone();
            match state {
                Source::Empty => continue,
                Source::Item(item) => return Ok(Some(item.data)),
                Source::Failed(error) => return Err(error),
            }
        }
    }
}

impl<V> Drop for DataStream<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn drop(&mut self) {
        let Some(live) = self.live.take() else { return };
        let LiveData {
            entry,
            cache,
            grace,
            ..
        } = live;

        let entry_for_timer = Arc::clone(&entry);
        let mut state = entry.state.lock().unwrap();
        state.subscription_count -= 1;
        if state.subscription_count > 0 {
            return;
        }

        if let Some(listener) = state.revalidation.take() {
            listener.abort();
        }
        if entry.is_stopped() {
            return;
        }

        let key = entry.key().to_string();
        state.teardown = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            {
                let mut state = entry_for_timer.state.lock().unwrap();
                // Detach first: stop_and_delete must not cancel the task
                // that is running it
                state.teardown = None;
                if state.subscription_count > 0 {
                    return;
                }
            }
            if entry_for_timer.validating() {
                return;
            }
            cache.stop_and_delete(&key, &entry_for_timer).await;
        }));
    }
}

/// The error stream of a subscription: latest fetch failure, or `None` after
/// a successful fetch cleared it.
pub struct ErrorStream {
    rx: Option<watch::Receiver<Option<SwrError>>>,
}

impl ErrorStream {
    pub fn current(&self) -> Option<SwrError> {
        self.rx.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Wait for the next change. Returns `None` once the entry completed; an
    /// inert stream never resolves.
    pub async fn changed(&mut self) -> Option<Option<SwrError>> {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }
}

/// The validating stream of a subscription: `true` while a fetch (or a
/// promised mutation) is outstanding.
pub struct ValidationStream {
    rx: Option<watch::Receiver<bool>>,
}

impl ValidationStream {
    pub fn current(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Wait for the next change. Returns `None` once the entry completed; an
    /// inert stream never resolves.
    pub async fn changed(&mut self) -> Option<bool> {
        let Some(rx) = self.rx.as_mut() else {
            return std::future::pending().await;
        };
        match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        }
    }
}

/// A live interest in one resource.
///
/// Created by [`Swr::subscribe`]. Holds the data, error, and validating
/// streams plus a mutate bound to the resolved key. Dropping the subscription
/// releases the entry reference; once the last one for a key is gone the
/// entry is torn down after a grace period.
pub struct Subscription<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    key: Option<String>,
    data: DataStream<V>,
    errors: ErrorStream,
    validating: ValidationStream,
    options: UseOptions<V>,
    swr: Weak<SwrInner<V>>,
}

impl<V> Subscription<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn inert(options: UseOptions<V>, swr: Weak<SwrInner<V>>) -> Self {
        Subscription {
            key: None,
            data: DataStream { live: None },
            errors: ErrorStream { rx: None },
            validating: ValidationStream { rx: None },
            options,
            swr,
        }
    }

    /// The encoded cache key; `None` when the key was not ready.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.key.is_some()
    }

    pub fn data(&mut self) -> &mut DataStream<V> {
        &mut self.data
    }

    pub fn errors(&mut self) -> &mut ErrorStream {
        &mut self.errors
    }

    pub fn validating(&mut self) -> &mut ValidationStream {
        &mut self.validating
    }

    /// The latest known value, if any.
    pub fn current(&self) -> Option<V> {
        self.data.current()
    }

    /// Shorthand for `self.data().next()`.
    pub async fn next_data(&mut self) -> Result<Option<V>, SwrError> {
        self.data.next().await
    }

    /// Mutate the resource this subscription tracks.
    ///
    /// See [`Swr::mutate`]; the key and per-call options are the ones this
    /// subscription was created with. On an inert subscription this is a
    /// no-op returning `Ok(None)`.
    pub async fn mutate(
        &self,
        mutation: Mutation<V>,
        revalidate: Option<bool>,
    ) -> Result<Option<V>, SwrError> {
        let (Some(key), Some(inner)) = (self.key.as_deref(), self.swr.upgrade()) else {
            return Ok(None);
        };
        inner.mutate(key, mutation, revalidate, &self.options).await
    }
}

pub(crate) struct SwrInner<V>
where
    V: Clone + Send + Sync,
{
    pub(crate) fetcher: Fetcher<V>,
    pub(crate) deduping_interval_ms: i64,
    pub(crate) error_retry_interval_ms: i64,
    pub(crate) error_retry_count: u32,
    pub(crate) cache: StorageCache<V>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) storage_listener: Mutex<Option<JoinHandle<()>>>,
}

impl<V> Drop for SwrInner<V>
where
    V: Clone + Send + Sync,
{
    fn drop(&mut self) {
        if let Some(listener) = self.storage_listener.lock().unwrap().take() {
            listener.abort();
        }
    }
}

impl<V> SwrInner<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Register a data subscription on the entry. Returns `false` when the
    /// entry stopped before the subscription could be taken, in which case
    /// the caller retries against a fresh entry.
    fn attach(self: &Arc<Self>, entry: &Arc<CacheEntry<V>>, options: &UseOptions<V>) -> bool {
        let mut state = entry.state.lock().unwrap();
        if entry.is_stopped() {
            return false;
        }
        state.subscription_count += 1;
        if state.subscription_count > 1 {
            return true;
        }

        // First subscriber: cancel any pending teardown and start listening
        // for the ambient signals that wake this entry
        if let Some(timer) = state.teardown.take() {
            timer.abort();
        }

        let weak = Arc::downgrade(self);
        let weak_entry = Arc::downgrade(entry);
        let key = entry.key().to_string();
        let options = options.clone();
        let mut focus = self.events.subscribe_focus();
        let mut online = self.events.subscribe_online();
        state.revalidation = Some(tokio::spawn(async move {
            loop {
                let closed = tokio::select! {
                    res = focus.recv() => matches!(res, Err(broadcast::error::RecvError::Closed)),
                    res = online.recv() => matches!(res, Err(broadcast::error::RecvError::Closed)),
                };
                if closed {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };
                let Some(entry) = weak_entry.upgrade() else { break };
                inner.revalidate_item(&key, entry.current_item(), false, &options);
            }
        }));
        true
    }

    fn build_subscription(
        self: &Arc<Self>,
        key: String,
        entry: Arc<CacheEntry<V>>,
        options: UseOptions<V>,
    ) -> Subscription<V> {
        let deduping = options
            .deduping_interval_ms
            .unwrap_or(self.deduping_interval_ms);
        let grace = Duration::from_millis((deduping + TEARDOWN_GRACE_MS).max(0) as u64);

        // Mark every channel changed so the first poll yields the latest
        // value instead of waiting for the next emission
        let mut rx = entry.source.subscribe();
        rx.mark_changed();
        let mut errors_rx = entry.errors.subscribe();
        errors_rx.mark_changed();
        let mut validating_rx = entry.is_validating.subscribe();
        validating_rx.mark_changed();

        Subscription {
            key: Some(key),
            data: DataStream {
                live: Some(LiveData {
                    entry,
                    rx,
                    cache: self.cache.clone(),
                    grace,
                }),
            },
            errors: ErrorStream { rx: Some(errors_rx) },
            validating: ValidationStream {
                rx: Some(validating_rx),
            },
            options,
            swr: Arc::downgrade(self),
        }
    }

    /// Kick a background fetch iff forced, or there is no usable item.
    fn revalidate_item(
        self: &Arc<Self>,
        key: &str,
        item: Option<CacheItem<V>>,
        force: bool,
        options: &UseOptions<V>,
    ) {
        let now = self.clock.now_ms();
        let needed = force || item.map(|i| i.is_expired(now)).unwrap_or(true);
        if !needed {
            return;
        }
        let inner = Arc::clone(self);
        let key = key.to_string();
        let options = options.clone();
        tokio::spawn(async move {
            inner.request_data(&key, &options).await;
        });
    }

    /// Run one fetch pipeline for the key: retry with a fixed delay,
    /// publishing every failure on the error channel, then settle the entry.
    async fn request_data(self: &Arc<Self>, key: &str, options: &UseOptions<V>) {
        let Some(entry) = self.cache.lookup(key) else {
            return;
        };
        let args = match key::decode(key) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(key, error = %e, "cannot decode cache key");
                return;
            }
        };
        // A pipeline already in flight for this key owns the entry
        if !entry.begin_validation() {
            return;
        }

        let interval = options
            .error_retry_interval_ms
            .unwrap_or(self.error_retry_interval_ms);
        let count = options.error_retry_count.unwrap_or(self.error_retry_count);
        let deduping = options
            .deduping_interval_ms
            .unwrap_or(self.deduping_interval_ms);

        let fetcher = Arc::clone(&self.fetcher);
        let result = retry_with_delay(
            Duration::from_millis(interval.max(0) as u64),
            count,
            || {
                let fetcher = Arc::clone(&fetcher);
                let args = args.clone();
                let entry = Arc::clone(&entry);
                async move {
                    match (fetcher.as_ref())(args).await {
                        Ok(data) => Ok(data),
                        Err(error) => {
                            entry.set_error(error.clone());
                            Err(error)
                        }
                    }
                }
            },
        )
        .await;

        match result {
            Ok(data) => {
                if entry.is_stopped() {
                    tracing::debug!(key, "discarding fetch result for stopped entry");
                } else {
                    let item = CacheItem::new(data, self.clock.now_ms() + deduping);
                    entry.push_item(item.clone());
                    entry.clear_error();
                    self.cache.persist(key, &item).await;
                }
            }
            Err(error) => {
                if !entry.has_item() && !entry.is_stopped() {
                    // Nothing was ever served for this key; the entry dies
                    // and the next subscriber starts from scratch
                    tracing::debug!(key, "retries exhausted with no prior data");
                    entry.fail(error);
                    self.cache.discard(key, &entry);
                }
                // With prior data the stale item stays and the last failure
                // remains on the error channel
            }
        }

        entry.end_validation();
    }

    pub(crate) async fn mutate(
        self: &Arc<Self>,
        key: &str,
        mutation: Mutation<V>,
        revalidate: Option<bool>,
        options: &UseOptions<V>,
    ) -> Result<Option<V>, SwrError> {
        let provides_value = !matches!(mutation, Mutation::None);
        // Omitted value defaults to revalidating; a provided value does not.
        // An explicit argument always wins.
        let should_revalidate = revalidate.unwrap_or(!provides_value);

        let entry = match self.cache.lookup(key) {
            Some(entry) => Some(entry),
            None if provides_value => Some(self.cache.get_or_init(key, None).await),
            None => None,
        };
        let Some(entry) = entry else {
            return Ok(None);
        };

        let prior = entry.current_item();

        let resolved = match mutation {
            Mutation::None => None,
            Mutation::Value(value) => Some(value),
            Mutation::Update(update) => Some(update(prior.as_ref().map(|i| i.data.clone()))),
            Mutation::Future(future) => {
                let raised = entry.begin_validation();
                let result = future.await;
                if raised {
                    entry.end_validation();
                }
                Some(result?)
            }
        };

        if let Some(value) = &resolved {
            let deduping = options
                .deduping_interval_ms
                .unwrap_or(self.deduping_interval_ms);
            let item = CacheItem::new(value.clone(), self.clock.now_ms() + deduping);
            entry.push_item(item.clone());
            self.cache.persist(key, &item).await;
        }

        if should_revalidate {
            self.revalidate_item(key, prior, true, options);
        }

        Ok(resolved)
    }
}

/// Reactive stale-while-revalidate cache.
///
/// Consumers subscribe with a tuple of fetch arguments and receive streams
/// that emit the latest known value immediately and keep emitting as the
/// cache revalidates in the background: on expiry, on focus/online signals,
/// on storage changes from other contexts, and on explicit request.
///
/// # Example
///
/// ```ignore
/// use swr_reactive::{Swr, SwrError};
///
/// let swr: Swr<User> = Swr::builder(|args| async move {
///     let url = args[0].as_str().unwrap().to_string();
///     http_get(&url).await.map_err(|e| SwrError::fetch(url, e.to_string()))
/// })
/// .build();
///
/// let mut users = swr.subscribe("/api/users", None).await;
/// while let Ok(Some(user)) = users.next_data().await {
///     render(user);
/// }
/// ```
pub struct Swr<V>
where
    V: Clone + Send + Sync,
{
    inner: Arc<SwrInner<V>>,
}

impl<V> Clone for Swr<V>
where
    V: Clone + Send + Sync,
{
    fn clone(&self) -> Self {
        Swr {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> Swr<V>
where
    V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    /// Create a cache with default options and no persistence.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new<F, Fut>(fetcher: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, SwrError>> + Send + 'static,
    {
        Self::builder(fetcher).build()
    }

    /// Start building a cache around the given fetcher.
    pub fn builder<F, Fut>(fetcher: F) -> crate::builder::SwrBuilder<V>
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, SwrError>> + Send + 'static,
    {
        crate::builder::SwrBuilder::new(Arc::new(move |args| fetcher(args).boxed()))
    }

    pub(crate) fn from_inner(inner: Arc<SwrInner<V>>) -> Self {
        Swr { inner }
    }

    /// The shared event bus. Embedders emit focus/online/storage signals into
    /// it; tests drive revalidation through it.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Number of live cache entries.
    pub fn len(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declare interest in a resource.
    ///
    /// Returns the entry's streams and kicks a revalidation that fetches iff
    /// no value is cached yet or the cached one expired. A key resolving to
    /// [`KeySpec::NotReady`] yields an inert subscription whose streams never
    /// emit and whose `mutate` is a no-op, which is the mechanism for fetches
    /// depending on data that is not available yet.
    pub async fn subscribe(
        &self,
        key: impl Into<KeySpec>,
        options: Option<UseOptions<V>>,
    ) -> Subscription<V> {
        let options = options.unwrap_or_default();
        let KeySpec::Args(args) = key.into() else {
            return Subscription::inert(options, Arc::downgrade(&self.inner));
        };
        let key = match key::encode(&args) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "cannot encode fetch arguments");
                return Subscription::inert(options, Arc::downgrade(&self.inner));
            }
        };

        let fallback = options
            .initial_data
            .clone()
            .map(|data| CacheItem::new(data, 0));

        let entry = loop {
            let entry = self.inner.cache.get_or_init(&key, fallback.clone()).await;
            if self.inner.attach(&entry, &options) {
                break entry;
            }
            // Lost a race against teardown; the next round gets a fresh entry
        };

        let subscription = self
            .inner
            .build_subscription(key.clone(), Arc::clone(&entry), options);
        self.inner
            .revalidate_item(&key, entry.current_item(), false, &subscription.options);
        subscription
    }

    /// Replace the cached value for a key, optionally revalidating.
    ///
    /// `revalidate` defaults to `true` when the mutation carries no
    /// replacement value ([`Mutation::None`]) and `false` otherwise; an
    /// explicit argument always wins. Returns the resolved value, or
    /// `Ok(None)` for an unknown key with nothing to apply.
    pub async fn mutate(
        &self,
        key: impl Into<KeySpec>,
        mutation: Mutation<V>,
        revalidate: Option<bool>,
        options: Option<UseOptions<V>>,
    ) -> Result<Option<V>, SwrError> {
        let KeySpec::Args(args) = key.into() else {
            return Ok(None);
        };
        let key = key::encode(&args)?;
        let options = options.unwrap_or_default();
        self.inner.mutate(&key, mutation, revalidate, &options).await
    }

    /// Trigger a revalidation for a key.
    ///
    /// Without `force` the fetch only runs when no value is cached or the
    /// cached one expired. Unknown keys are a no-op.
    pub fn revalidate(&self, key: impl Into<KeySpec>, force: bool) {
        let KeySpec::Args(args) = key.into() else {
            return;
        };
        let Ok(key) = key::encode(&args) else { return };
        let item = self
            .inner
            .cache
            .lookup(&key)
            .and_then(|entry| entry.current_item());
        self.inner
            .revalidate_item(&key, item, force, &UseOptions::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_swr() -> (Swr<String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let swr = Swr::new(move |_args| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("fetched".to_string())
            }
        });
        (swr, calls)
    }

    #[tokio::test]
    async fn test_not_ready_key_is_inert() {
        let (swr, calls) = counting_swr();

        let mut sub = swr.subscribe(KeySpec::NotReady, None).await;
        assert!(!sub.is_ready());
        assert!(sub.key().is_none());
        assert!(sub.current().is_none());
        assert!(!sub.validating().current());

        // No entry was created and the fetcher never ran
        assert!(swr.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Mutating through the inert handle is a no-op
        let result = sub
            .mutate(Mutation::value("ignored".to_string()), None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(swr.is_empty());
    }

    #[tokio::test]
    async fn test_mutate_unknown_key_without_value_returns_none() {
        let (swr, calls) = counting_swr();

        let result = swr
            .mutate("/missing", Mutation::None, None, None)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(swr.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mutate_with_value_creates_entry() {
        let (swr, _calls) = counting_swr();

        let result = swr
            .mutate(
                "/users",
                Mutation::value("seeded".to_string()),
                Some(false),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.as_deref(), Some("seeded"));
        assert_eq!(swr.len(), 1);

        let sub = swr.subscribe("/users", None).await;
        assert_eq!(sub.current().as_deref(), Some("seeded"));
    }
}
