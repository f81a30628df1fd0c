//! `lifebank-client` is the async client core of the LifeBank donor site.
//!
//! - [`LifeBankClient`]: HTTP API client with per-attempt timeouts, retry
//!   with exponential backoff and fail-fast on 4xx, plus the donor-site
//!   operations built on it.
//! - [`PushChannel`]: WebSocket subscription for inventory updates with
//!   bounded automatic reconnection.
//! - [`OfflineWorker`]: cache-first fetch over a versioned cache, precache
//!   and activation cleanup, and background sync of submissions parked in
//!   the durable [`PendingStore`].
//!
//! Nothing here is global. Build each piece once and hand it to whatever
//! needs it; every handle is cheap to clone or meant to sit behind an `Arc`.

mod cache;
mod channel;
mod client;
mod error;
mod fetcher;
mod options;
mod retry;
mod security;
mod store;
mod types;
mod wire;
mod worker;

pub use cache::{CacheStorage, CachedResponse, RequestKey, ResponseKind};
pub use channel::{ChannelState, PushChannel, SubscriptionId, INVENTORY_UPDATE};
pub use client::{
    LifeBankClient, APPOINTMENTS_PATH, CSRF_HEADER, DONATE_PATH, EMAIL_PATH, INVENTORY_PATH,
    LOGIN_PATH, LOGOUT_PATH,
};
pub use error::{ChannelError, LifeBankError, StoreError, SyncError, TransientError, WorkerError};
pub use fetcher::{FetchRequest, Fetcher, HttpFetcher};
pub use options::{
    ChannelOptions, ClientOptions, WorkerOptions, DEFAULT_API_URL, DEFAULT_PRECACHE,
    DEFAULT_SITE_ORIGIN, DEFAULT_WS_URL, SYNC_FORM_DATA_TAG,
};
pub use retry::{Backoff, RetryPolicy};
pub use security::{
    generate_token, sanitize_email, sanitize_form_data, sanitize_input, sanitize_phone,
    RateLimiter, SessionStore,
};
pub use store::{PendingRecord, PendingStore, DATABASE_NAME, DATABASE_VERSION, PENDING_FORMS};
pub use types::{
    ApiRequest, ApiResponse, AppointmentRequest, AppointmentResponse, ContactForm,
    DonorRegistration, Inventory, LoginResponse, SubmissionOutcome,
};
pub use wire::{Envelope, WorkerMessage};
pub use worker::{OfflineWorker, WorkerRegistration, WorkerState};

pub type Result<T> = std::result::Result<T, LifeBankError>;
