//! Offline cache worker: precache, activation cleanup, cache-first fetch and
//! background sync of pending form submissions.

use std::fmt;
use std::sync::Arc;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use reqwest::{Method, Url};
use serde_json::Value;

use crate::{
    cache::RequestKey, options::SYNC_FORM_DATA_TAG, wire::WorkerMessage, CacheStorage,
    CachedResponse, FetchRequest, Fetcher, PendingRecord, PendingStore, RetryPolicy, SyncError,
    WorkerError, WorkerOptions,
};

/// Worker lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Installing,
    /// Installed and waiting for the previous version to step aside.
    Installed,
    Active,
    /// Superseded or failed to install. Terminal.
    Redundant,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Installing => write!(f, "installing"),
            WorkerState::Installed => write!(f, "installed"),
            WorkerState::Active => write!(f, "active"),
            WorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// One version of the offline worker.
pub struct OfflineWorker<F> {
    options: WorkerOptions,
    origin: Url,
    sync_url: String,
    offline_key: RequestKey,
    caches: CacheStorage,
    fetcher: F,
    state: Mutex<WorkerState>,
}

impl<F> fmt::Debug for OfflineWorker<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineWorker")
            .field("cache_name", &self.options.cache_name)
            .field("origin", &self.origin.as_str())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl<F: Fetcher> OfflineWorker<F> {
    /// Creates a worker in the `Installing` state. `caches` is usually shared
    /// with earlier versions so activation can clean them up.
    pub fn new(options: WorkerOptions, caches: CacheStorage, fetcher: F) -> Result<Self, WorkerError> {
        let origin = Url::parse(&options.origin).map_err(|err| WorkerError::InvalidUrl {
            url: options.origin.clone(),
            reason: err.to_string(),
        })?;
        let sync_url = resolve(&origin, &options.sync_endpoint)?;
        let offline_key = RequestKey::get(resolve(&origin, &options.offline_page)?);

        Ok(Self {
            options,
            origin,
            sync_url,
            offline_key,
            caches,
            fetcher,
            state: Mutex::new(WorkerState::Installing),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn cache_name(&self) -> &str {
        &self.options.cache_name
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    /// Resolves a relative asset path against the worker origin.
    pub fn resolve(&self, url: &str) -> Result<String, WorkerError> {
        resolve(&self.origin, url)
    }

    /// Fetches the eager part of the asset list into the current cache.
    ///
    /// All-or-nothing: if any asset fails, nothing is stored and the worker
    /// becomes redundant.
    pub async fn install(&self) -> Result<(), WorkerError> {
        self.expect_state(WorkerState::Installing, "install")?;
        tracing::info!(cache = %self.options.cache_name, "installing and caching assets");

        match self.precache().await {
            Ok(entries) => {
                self.caches.put_all(&self.options.cache_name, entries);
                *self.state.lock() = WorkerState::Installed;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "install failed");
                *self.state.lock() = WorkerState::Redundant;
                Err(err)
            }
        }
    }

    async fn precache(&self) -> Result<Vec<(RequestKey, CachedResponse)>, WorkerError> {
        self.caches.open(&self.options.cache_name);
        let fetches = self.options.eager_assets().iter().map(|asset| async move {
            let url = self.resolve(asset)?;
            let response = self
                .fetcher
                .fetch(&FetchRequest::get(url.clone()))
                .await
                .map_err(|err| WorkerError::Install {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
            if !response.is_ok() {
                return Err(WorkerError::Install {
                    reason: format!("status {}", response.status),
                    url,
                });
            }
            Ok((RequestKey::get(url), response))
        });
        try_join_all(fetches).await
    }

    /// Takes control and deletes every cache not named after this version.
    /// Returns the names of the deleted caches.
    pub fn activate(&self) -> Result<Vec<String>, WorkerError> {
        self.expect_state(WorkerState::Installed, "activate")?;

        let mut deleted = Vec::new();
        for name in self.caches.keys() {
            if name != self.options.cache_name && self.caches.delete(&name) {
                tracing::info!(cache = %name, "deleting old cache");
                deleted.push(name);
            }
        }
        *self.state.lock() = WorkerState::Active;
        Ok(deleted)
    }

    pub(crate) fn retire(&self) {
        *self.state.lock() = WorkerState::Redundant;
    }

    /// Cache-first fetch for GET requests; everything else goes straight to
    /// the network.
    ///
    /// A GET miss is fetched once and, if it came back 200 and not as an
    /// error, stored in the current cache. When the network is down the
    /// cached offline page stands in.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<CachedResponse, WorkerError> {
        self.expect_state(WorkerState::Active, "intercept fetches")?;

        let mut request = request.clone();
        request.url = self.resolve(&request.url)?;

        if request.method != Method::GET {
            return self.fetcher.fetch(&request).await;
        }

        let key = RequestKey::get(request.url.clone());
        if let Some(hit) = self.caches.match_any(&key) {
            tracing::debug!(url = %key.url, "cache hit");
            return Ok(hit);
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.caches
                        .put(&self.options.cache_name, key, response.clone());
                }
                Ok(response)
            }
            Err(err) => {
                tracing::warn!(url = %request.url, error = %err, "offline, serving fallback page");
                self.caches
                    .match_any(&self.offline_key)
                    .ok_or(WorkerError::Offline { url: request.url })
            }
        }
    }

    /// Runs the background sync registered under `tag`. Unknown tags are
    /// ignored and report zero deliveries.
    pub async fn handle_sync(&self, tag: &str, store: &PendingStore) -> Result<usize, SyncError> {
        if tag != SYNC_FORM_DATA_TAG {
            tracing::debug!(tag, "ignoring unknown sync tag");
            return Ok(0);
        }
        self.sync_form_data(store).await
    }

    /// Delivers every pending submission. Delivered records are deleted;
    /// failed ones stay and the call fails so it gets scheduled again.
    pub async fn sync_form_data(&self, store: &PendingStore) -> Result<usize, SyncError> {
        let records = store.get_all().await?;
        let mut delivered = 0;
        let mut failed = 0;
        let mut last_error = None;

        for record in records {
            match self.deliver(&record).await {
                Ok(()) => {
                    store.delete(&record.id).await?;
                    delivered += 1;
                }
                Err(err) => {
                    tracing::error!(id = %record.id, error = %err, "failed to sync form");
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last) => Err(SyncError::Delivery { failed, last }),
            None => {
                if delivered > 0 {
                    tracing::info!(delivered, "pending forms synced");
                }
                Ok(delivered)
            }
        }
    }

    /// Re-runs a failing sync under `policy`, the way the platform
    /// reschedules a rejected sync event.
    pub async fn sync_with_reschedule(
        &self,
        tag: &str,
        store: &PendingStore,
        policy: RetryPolicy,
    ) -> Result<usize, SyncError> {
        let mut backoff = policy.backoff();
        loop {
            match self.handle_sync(tag, store).await {
                Ok(delivered) => return Ok(delivered),
                Err(err) => {
                    tracing::warn!(attempt = backoff.attempt(), error = %err, "sync failed");
                    if !backoff.wait().await {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn deliver(&self, record: &PendingRecord) -> Result<(), WorkerError> {
        let request = FetchRequest::post_json(self.sync_url.clone(), &record.payload);
        let response = self.fetcher.fetch(&request).await?;
        if response.is_ok() {
            Ok(())
        } else {
            Err(WorkerError::Rejected {
                url: self.sync_url.clone(),
                status: response.status,
            })
        }
    }

    fn expect_state(&self, expected: WorkerState, action: &'static str) -> Result<(), WorkerError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(WorkerError::InvalidState { state, action })
        }
    }
}

fn resolve(origin: &Url, url: &str) -> Result<String, WorkerError> {
    origin
        .join(url)
        .map(String::from)
        .map_err(|err| WorkerError::InvalidUrl {
            url: url.to_owned(),
            reason: err.to_string(),
        })
}

/// Tracks the active worker and at most one waiting successor.
pub struct WorkerRegistration<F> {
    active: Mutex<Option<Arc<OfflineWorker<F>>>>,
    waiting: Mutex<Option<Arc<OfflineWorker<F>>>>,
}

impl<F> Default for WorkerRegistration<F> {
    fn default() -> Self {
        Self {
            active: Mutex::new(None),
            waiting: Mutex::new(None),
        }
    }
}

impl<F: Fetcher> WorkerRegistration<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `worker`. With no active worker it takes control at once;
    /// otherwise it waits until [`skip_waiting`](Self::skip_waiting).
    pub async fn register(&self, worker: OfflineWorker<F>) -> Result<Arc<OfflineWorker<F>>, WorkerError> {
        let worker = Arc::new(worker);
        worker.install().await?;

        if self.active.lock().is_none() {
            self.promote(Arc::clone(&worker))?;
        } else {
            tracing::info!(cache = %worker.cache_name(), "new worker waiting");
            if let Some(previous) = self.waiting.lock().replace(Arc::clone(&worker)) {
                previous.retire();
            }
        }
        Ok(worker)
    }

    pub fn active(&self) -> Option<Arc<OfflineWorker<F>>> {
        self.active.lock().clone()
    }

    pub fn waiting(&self) -> Option<Arc<OfflineWorker<F>>> {
        self.waiting.lock().clone()
    }

    /// Activates the waiting worker, if any. Returns the caches it deleted.
    ///
    /// The worker leaves the waiting slot only once it is active, so a
    /// failed activation keeps it there.
    pub fn skip_waiting(&self) -> Result<Option<Vec<String>>, WorkerError> {
        let Some(worker) = self.waiting() else {
            return Ok(None);
        };
        let deleted = self.promote(Arc::clone(&worker))?;
        let mut waiting = self.waiting.lock();
        if waiting.as_ref().is_some_and(|current| Arc::ptr_eq(current, &worker)) {
            *waiting = None;
        }
        Ok(Some(deleted))
    }

    /// Handles a client control message. Only `SKIP_WAITING` is understood.
    pub fn handle_message(&self, message: &Value) -> Result<(), WorkerError> {
        match serde_json::from_value::<WorkerMessage>(message.clone()) {
            Ok(WorkerMessage::SkipWaiting) => self.skip_waiting().map(|_| ()),
            Err(_) => {
                tracing::debug!(%message, "ignoring worker message");
                Ok(())
            }
        }
    }

    /// Routes a request through the active worker.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, WorkerError> {
        let worker = self.active().ok_or(WorkerError::NoActiveWorker)?;
        worker.handle_fetch(request).await
    }

    fn promote(&self, worker: Arc<OfflineWorker<F>>) -> Result<Vec<String>, WorkerError> {
        let deleted = worker.activate()?;
        if let Some(previous) = self.active.lock().replace(worker) {
            previous.retire();
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::{OfflineWorker, WorkerRegistration, WorkerState};
    use crate::{
        CacheStorage, CachedResponse, FetchRequest, Fetcher, WorkerError, WorkerOptions,
    };

    const ORIGIN: &str = "https://lifebank.test";

    /// Serves canned responses and records every URL it was asked for.
    #[derive(Clone, Default)]
    struct StubFetcher {
        responses: Arc<Mutex<HashMap<String, u16>>>,
        offline: Arc<Mutex<bool>>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl StubFetcher {
        fn serve(&self, path: &str, status: u16) {
            self.responses.lock().insert(format!("{ORIGIN}{path}"), status);
        }

        fn go_offline(&self) {
            *self.offline.lock() = true;
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, WorkerError> {
            self.calls.lock().push(request.url.clone());
            if *self.offline.lock() {
                return Err(WorkerError::Network("connection refused".to_owned()));
            }
            let status = self.responses.lock().get(&request.url).copied().unwrap_or(404);
            Ok(CachedResponse::new(status, request.url.clone()))
        }
    }

    fn options(name: &str, assets: &[&str]) -> WorkerOptions {
        let mut opts = WorkerOptions::new(ORIGIN)
            .with_cache_name(name)
            .with_precache(assets.iter().copied());
        opts.eager_precache = 2;
        opts
    }

    async fn active_worker(fetcher: &StubFetcher) -> OfflineWorker<StubFetcher> {
        fetcher.serve("/", 200);
        fetcher.serve("/index.html", 200);
        let worker = OfflineWorker::new(
            options("lifebank-v1", &["/", "/index.html", "/about.html"]),
            CacheStorage::new(),
            fetcher.clone(),
        )
        .expect("worker");
        worker.install().await.expect("install");
        worker.activate().expect("activate");
        worker
    }

    #[tokio::test]
    async fn install_caches_only_eager_assets() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;

        let fetched: HashSet<String> = fetcher.calls().into_iter().collect();
        assert_eq!(
            fetched,
            HashSet::from([format!("{ORIGIN}/"), format!("{ORIGIN}/index.html")])
        );
        assert_eq!(worker.caches().len_of("lifebank-v1"), Some(2));
    }

    #[tokio::test]
    async fn failed_install_stores_nothing_and_turns_redundant() {
        let fetcher = StubFetcher::default();
        fetcher.serve("/", 200);
        let worker = OfflineWorker::new(
            options("lifebank-v2", &["/", "/missing.css"]),
            CacheStorage::new(),
            fetcher,
        )
        .expect("worker");

        let err = worker.install().await.expect_err("404 must fail install");
        assert!(matches!(err, WorkerError::Install { .. }));
        assert_eq!(worker.state(), WorkerState::Redundant);
        assert_eq!(worker.caches().len_of("lifebank-v2"), Some(0));
    }

    #[tokio::test]
    async fn activate_deletes_every_other_cache() {
        let fetcher = StubFetcher::default();
        fetcher.serve("/", 200);
        fetcher.serve("/index.html", 200);
        let caches = CacheStorage::new();
        caches.open("lifebank-v0");
        caches.open("some-other-cache");

        let worker = OfflineWorker::new(
            options("lifebank-v1", &["/", "/index.html"]),
            caches.clone(),
            fetcher,
        )
        .expect("worker");
        worker.install().await.expect("install");
        let mut deleted = worker.activate().expect("activate");
        deleted.sort();

        assert_eq!(deleted, vec!["lifebank-v0".to_owned(), "some-other-cache".to_owned()]);
        assert_eq!(caches.keys(), vec!["lifebank-v1".to_owned()]);
        assert_eq!(worker.state(), WorkerState::Active);
    }

    #[tokio::test]
    async fn cached_get_skips_the_network() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;
        let before = fetcher.calls().len();

        let response = worker
            .handle_fetch(&FetchRequest::get("/index.html"))
            .await
            .expect("cached");
        assert_eq!(response.status, 200);
        assert_eq!(fetcher.calls().len(), before);
    }

    #[tokio::test]
    async fn miss_fetches_once_and_populates_cache() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;
        fetcher.serve("/about.html", 200);
        let before = fetcher.calls().len();

        worker
            .handle_fetch(&FetchRequest::get("/about.html"))
            .await
            .expect("network");
        worker
            .handle_fetch(&FetchRequest::get("/about.html"))
            .await
            .expect("cache");

        assert_eq!(fetcher.calls().len(), before + 1);
        assert_eq!(worker.caches().len_of("lifebank-v1"), Some(3));
    }

    #[tokio::test]
    async fn non_200_responses_are_not_cached() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;

        let response = worker
            .handle_fetch(&FetchRequest::get("/nope"))
            .await
            .expect("404 is still a response");
        assert_eq!(response.status, 404);
        assert_eq!(worker.caches().len_of("lifebank-v1"), Some(2));
    }

    #[tokio::test]
    async fn non_get_bypasses_cache() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;
        fetcher.serve("/api/donate", 200);
        let before = fetcher.calls().len();

        for _ in 0..2 {
            worker
                .handle_fetch(&FetchRequest::post_json("/api/donate", &json!({"a": 1})))
                .await
                .expect("post");
        }
        assert_eq!(fetcher.calls().len(), before + 2);
        assert_eq!(worker.caches().len_of("lifebank-v1"), Some(2));
    }

    #[tokio::test]
    async fn offline_miss_serves_offline_page() {
        let fetcher = StubFetcher::default();
        let worker = active_worker(&fetcher).await;
        fetcher.go_offline();

        let response = worker
            .handle_fetch(&FetchRequest::get("/inventory.html"))
            .await
            .expect("fallback");
        assert_eq!(response.body, format!("{ORIGIN}/index.html").into_bytes());
    }

    #[tokio::test]
    async fn offline_without_fallback_fails() {
        let fetcher = StubFetcher::default();
        fetcher.serve("/", 200);
        fetcher.serve("/about.html", 200);
        let worker = OfflineWorker::new(
            options("lifebank-v1", &["/", "/about.html"]),
            CacheStorage::new(),
            fetcher.clone(),
        )
        .expect("worker");
        worker.install().await.expect("install");
        worker.activate().expect("activate");
        fetcher.go_offline();

        let err = worker
            .handle_fetch(&FetchRequest::get("/inventory.html"))
            .await
            .expect_err("nothing to serve");
        assert!(matches!(err, WorkerError::Offline { .. }));
    }

    #[tokio::test]
    async fn fetch_before_activation_is_rejected() {
        let worker = OfflineWorker::new(options("v", &[]), CacheStorage::new(), StubFetcher::default())
            .expect("worker");
        let err = worker
            .handle_fetch(&FetchRequest::get("/"))
            .await
            .expect_err("installing worker");
        assert!(matches!(
            err,
            WorkerError::InvalidState { state: WorkerState::Installing, .. }
        ));
    }

    #[tokio::test]
    async fn second_worker_waits_until_skip_waiting() {
        let fetcher = StubFetcher::default();
        fetcher.serve("/", 200);
        fetcher.serve("/index.html", 200);
        let caches = CacheStorage::new();
        let registration = WorkerRegistration::new();

        let v1 = registration
            .register(
                OfflineWorker::new(options("lifebank-v1", &["/"]), caches.clone(), fetcher.clone())
                    .expect("v1"),
            )
            .await
            .expect("register v1");
        assert_eq!(v1.state(), WorkerState::Active);

        let v2 = registration
            .register(
                OfflineWorker::new(options("lifebank-v2", &["/index.html"]), caches.clone(), fetcher)
                    .expect("v2"),
            )
            .await
            .expect("register v2");
        assert_eq!(v2.state(), WorkerState::Installed);
        assert!(caches.has("lifebank-v1"));

        registration
            .handle_message(&json!({"type": "SKIP_WAITING"}))
            .expect("skip waiting");

        assert_eq!(v2.state(), WorkerState::Active);
        assert_eq!(v1.state(), WorkerState::Redundant);
        assert_eq!(caches.keys(), vec!["lifebank-v2".to_owned()]);
        assert!(registration.waiting().is_none());
    }

    #[tokio::test]
    async fn failed_activation_keeps_the_waiting_worker() {
        let fetcher = StubFetcher::default();
        fetcher.serve("/", 200);
        fetcher.serve("/index.html", 200);
        let caches = CacheStorage::new();
        let registration = WorkerRegistration::new();

        let v1 = registration
            .register(
                OfflineWorker::new(options("lifebank-v1", &["/"]), caches.clone(), fetcher.clone())
                    .expect("v1"),
            )
            .await
            .expect("register v1");
        let v2 = registration
            .register(
                OfflineWorker::new(options("lifebank-v2", &["/index.html"]), caches.clone(), fetcher)
                    .expect("v2"),
            )
            .await
            .expect("register v2");

        v2.retire();
        let err = registration
            .skip_waiting()
            .expect_err("a redundant worker cannot activate");
        assert!(matches!(
            err,
            WorkerError::InvalidState { state: WorkerState::Redundant, .. }
        ));

        let waiting = registration.waiting().expect("still waiting");
        assert!(Arc::ptr_eq(&waiting, &v2));
        let active = registration.active().expect("still active");
        assert!(Arc::ptr_eq(&active, &v1));
        assert_eq!(v1.state(), WorkerState::Active);
        assert!(caches.has("lifebank-v1"));
    }

    #[tokio::test]
    async fn unknown_messages_are_ignored() {
        let registration: WorkerRegistration<StubFetcher> = WorkerRegistration::new();
        registration
            .handle_message(&json!({"type": "PING"}))
            .expect("ignored");
        assert_eq!(registration.skip_waiting().expect("noop"), None);
    }
}
