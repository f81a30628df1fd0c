use std::time::Duration;

use crate::RetryPolicy;

/// Default API base URL, overridden by `LIFEBANK_API_URL`.
pub const DEFAULT_API_URL: &str = "https://api.lifebank.org";
/// Default push channel URL, overridden by `LIFEBANK_WS_URL`.
pub const DEFAULT_WS_URL: &str = "wss://api.lifebank.org/ws";
/// Default site origin used in links inside confirmation emails.
pub const DEFAULT_SITE_ORIGIN: &str = "https://lifebank.org";

/// Configures HTTP timeout and retry behavior.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Wait before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Factor applied to the wait after every retry. Values below 1 are
    /// treated as 1.
    pub backoff_multiplier: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2,
        }
    }
}

impl ClientOptions {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            self.backoff_multiplier,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configures the push channel endpoint and its reconnect budget.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChannelOptions {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Automatic reconnect attempts after a close, before giving up.
    pub max_reconnect_attempts: u32,
    /// Fixed wait before each reconnect attempt, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Upper bound for a single connect handshake, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_owned(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 3_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ChannelOptions {
    /// Builds options with the given endpoint and default timings.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Reads `LIFEBANK_WS_URL`, falling back to [`DEFAULT_WS_URL`] when unset.
    ///
    /// Returns an error if the variable is set but empty or is not a
    /// WebSocket URL.
    pub fn from_env() -> std::result::Result<Self, String> {
        match std::env::var("LIFEBANK_WS_URL") {
            Ok(url) => {
                let url = url.trim();
                if url.is_empty() {
                    return Err("LIFEBANK_WS_URL is set but empty".to_owned());
                }
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(format!("LIFEBANK_WS_URL must be a ws:// or wss:// URL, got '{url}'"));
                }
                Ok(Self::with_url(url))
            }
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Assets the site needs offline. Only the first
/// [`WorkerOptions::eager_precache`] entries are fetched at install.
pub const DEFAULT_PRECACHE: &[&str] = &[
    "/",
    "/index.html",
    "/register.html",
    "/inventory.html",
    "/about.html",
    "/main.js",
    "/resources/hero-medical.jpg",
    "/resources/medical-team.jpg",
    "/resources/laboratory-tech.jpg",
    "/resources/blood-donation-center.jpg",
    "/resources/medical-equipment.jpg",
    "/resources/blood-cells-microscope.jpg",
    "/resources/hospital-emergency.jpg",
    "https://cdn.tailwindcss.com",
    "https://cdnjs.cloudflare.com/ajax/libs/animejs/3.2.1/anime.min.js",
    "https://cdnjs.cloudflare.com/ajax/libs/typed.js/2.0.12/typed.min.js",
    "https://cdn.jsdelivr.net/npm/echarts@5.4.3/dist/echarts.min.js",
    "https://cdn.jsdelivr.net/npm/@splidejs/splide@4.1.4/dist/js/splide.min.js",
    "https://cdn.jsdelivr.net/npm/@splidejs/splide@4.1.4/dist/css/splide.min.css",
    "https://fonts.googleapis.com/css2?family=Inter:wght@300;400;500;600;700&display=swap",
];

/// Configures the offline cache worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkerOptions {
    /// Origin relative asset paths resolve against.
    pub origin: String,
    /// Versioned cache name. Activation deletes every other cache.
    pub cache_name: String,
    /// Curated asset list.
    pub precache: Vec<String>,
    /// How many leading `precache` entries install fetches eagerly.
    pub eager_precache: usize,
    /// Served when the network is down and the request is not cached.
    pub offline_page: String,
    /// Endpoint pending submissions are delivered to during sync.
    pub sync_endpoint: String,
}

/// Background sync tag that flushes pending form submissions.
pub const SYNC_FORM_DATA_TAG: &str = "sync-form-data";

impl WorkerOptions {
    /// Builds options for `origin` with the site's default asset list.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            cache_name: "lifebank-v1".to_owned(),
            precache: DEFAULT_PRECACHE.iter().map(|asset| (*asset).to_owned()).collect(),
            eager_precache: 10,
            offline_page: "/index.html".to_owned(),
            sync_endpoint: "/api/donate".to_owned(),
        }
    }

    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    pub fn with_precache<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Assets fetched during install.
    pub fn eager_assets(&self) -> &[String] {
        let end = self.eager_precache.min(self.precache.len());
        &self.precache[..end]
    }
}
