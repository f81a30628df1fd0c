//! Named response caches, versioned by cache name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::Method;

/// How the response was obtained. Only `Error` responses are never cached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseKind {
    #[default]
    Basic,
    Cors,
    Opaque,
    Error,
}

/// Stored copy of a network response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Exactly 200 and not an error response.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind != ResponseKind::Error
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Cache key: method plus absolute URL. Only GET requests are ever stored.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RequestKey {
    pub method: Method,
    pub url: String,
}

impl RequestKey {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
        }
    }
}

/// One named cache.
#[derive(Clone, Debug, Default)]
pub struct Cache {
    entries: HashMap<RequestKey, CachedResponse>,
}

impl Cache {
    pub fn get(&self, key: &RequestKey) -> Option<&CachedResponse> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: RequestKey, response: CachedResponse) {
        self.entries.insert(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All caches of one origin, shared between worker versions.
///
/// Clones share the same storage. Lookups search caches in creation order.
#[derive(Clone, Debug, Default)]
pub struct CacheStorage {
    inner: Arc<Mutex<Vec<(String, Cache)>>>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the cache if missing. Returns `true` when it was created.
    pub fn open(&self, name: &str) -> bool {
        let mut caches = self.inner.lock();
        if caches.iter().any(|(existing, _)| existing == name) {
            return false;
        }
        caches.push((name.to_owned(), Cache::default()));
        true
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.lock().iter().any(|(existing, _)| existing == name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    /// Drops the cache and every entry in it.
    pub fn delete(&self, name: &str) -> bool {
        let mut caches = self.inner.lock();
        let before = caches.len();
        caches.retain(|(existing, _)| existing != name);
        caches.len() != before
    }

    /// Stores into `name`, creating the cache if needed.
    pub fn put(&self, name: &str, key: RequestKey, response: CachedResponse) {
        let mut caches = self.inner.lock();
        match caches.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, cache)) => cache.put(key, response),
            None => {
                let mut cache = Cache::default();
                cache.put(key, response);
                caches.push((name.to_owned(), cache));
            }
        }
    }

    /// Stores every entry or none: the batch lands under one lock.
    pub fn put_all(&self, name: &str, entries: Vec<(RequestKey, CachedResponse)>) {
        let mut caches = self.inner.lock();
        let index = match caches.iter().position(|(existing, _)| existing == name) {
            Some(index) => index,
            None => {
                caches.push((name.to_owned(), Cache::default()));
                caches.len() - 1
            }
        };
        for (key, response) in entries {
            caches[index].1.put(key, response);
        }
    }

    /// Looks `key` up in a single cache.
    pub fn match_in(&self, name: &str, key: &RequestKey) -> Option<CachedResponse> {
        self.inner
            .lock()
            .iter()
            .find(|(existing, _)| existing == name)
            .and_then(|(_, cache)| cache.get(key).cloned())
    }

    /// Looks `key` up across all caches, oldest first.
    pub fn match_any(&self, key: &RequestKey) -> Option<CachedResponse> {
        self.inner
            .lock()
            .iter()
            .find_map(|(_, cache)| cache.get(key).cloned())
    }

    /// Number of entries in `name`, or `None` if the cache does not exist.
    pub fn len_of(&self, name: &str) -> Option<usize> {
        self.inner
            .lock()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, cache)| cache.len())
    }
}
