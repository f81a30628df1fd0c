/// Failure worth retrying: the server or the network may recover.
#[derive(Debug, thiserror::Error)]
pub enum TransientError {
    /// Network, timeout or body-read error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success, non-4xx HTTP status with raw response body.
    #[error("http error {status}: {body}")]
    Status { status: u16, body: String },
    /// Success status with a body that is not the expected JSON, e.g. a
    /// maintenance page served as 200.
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl TransientError {
    /// Returns `true` when the attempt was aborted by its own timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_timeout())
    }

    /// HTTP status of the failed attempt, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            Self::Status { status, .. } => Some(*status),
            Self::Decode(_) => None,
        }
    }
}

/// Error type returned by the API client.
#[derive(Debug, thiserror::Error)]
pub enum LifeBankError {
    /// 4xx response. Never retried.
    #[error("client error {status}: {body}")]
    Client { status: u16, body: String },
    /// Single-attempt failure that a retry could fix.
    #[error(transparent)]
    Transient(#[from] TransientError),
    /// Every configured attempt failed; wraps the last failure.
    #[error("request failed after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: TransientError },
    /// Request body could not be serialized; nothing was sent.
    #[error("request body could not be encoded: {0}")]
    Encode(String),
    /// Local rate limiter refused the action.
    #[error("too many requests, please try again later ({remaining} attempts remaining)")]
    RateLimited { remaining: u32 },
    /// Durable pending-submission store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifeBankError {
    /// Returns `true` for failures where deferring the work for later makes sense.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::ExhaustedRetries { .. })
    }
}

/// Push channel failures. Logged by the channel; only connect failures feed
/// the reconnect cycle.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket connect timed out after {0} ms")]
    Timeout(u64),
    /// A newer `connect()` or a `disconnect()` replaced this attempt.
    #[error("connect attempt was superseded")]
    Superseded,
    #[error("unparseable channel message: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Durable local store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// On-disk database is newer than this build understands.
    #[error("store version {found} is newer than supported version {expected}")]
    Version { found: u32, expected: u32 },
}

/// Offline cache worker failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Network fetch failed before any response arrived.
    #[error("network error: {0}")]
    Network(String),
    /// Server answered with a status that does not count as delivered.
    #[error("{url} answered with status {status}")]
    Rejected { url: String, status: u16 },
    /// Network unreachable and nothing cached, not even the offline page.
    #[error("offline and no cached response for {url}")]
    Offline { url: String },
    /// Precache fetch did not produce a storable response.
    #[error("install failed while caching {url}: {reason}")]
    Install { url: String, reason: String },
    #[error("worker is {state}, cannot {action}")]
    InvalidState {
        state: crate::WorkerState,
        action: &'static str,
    },
    #[error("no active worker")]
    NoActiveWorker,
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Background sync failures. Returning one of these asks the caller to
/// schedule the sync again; no record is lost.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{failed} pending submission(s) could not be delivered: {last}")]
    Delivery { failed: usize, last: WorkerError },
}
