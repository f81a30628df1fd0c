use std::fmt;
use std::future::Future;
use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::time::sleep;

use crate::{
    options::{DEFAULT_API_URL, DEFAULT_SITE_ORIGIN},
    security::{sanitize_form_data, AUTH_TOKEN_KEY},
    wire::EmailRequest,
    ApiRequest, ApiResponse, AppointmentRequest, AppointmentResponse, ClientOptions, ContactForm,
    DonorRegistration, Inventory, LifeBankError, LoginResponse, PendingRecord, PendingStore,
    RateLimiter, Result, SessionStore, SubmissionOutcome, TransientError,
};

pub const DONATE_PATH: &str = "/api/donate";
pub const INVENTORY_PATH: &str = "/api/inventory";
pub const APPOINTMENTS_PATH: &str = "/api/appointments";
pub const LOGIN_PATH: &str = "/api/auth/login";
pub const LOGOUT_PATH: &str = "/api/auth/logout";
pub const EMAIL_PATH: &str = "/api/email/send";

/// Header carrying the per-session CSRF token.
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// HTTP client for the LifeBank API.
///
/// Cloning is cheap and clones share the session, cookie jar and rate
/// limiters, so one instance per process is the intended shape.
#[derive(Clone)]
pub struct LifeBankClient {
    http: reqwest::Client,
    base_url: String,
    site_origin: String,
    session: SessionStore,
    options: ClientOptions,
    form_limiter: Arc<RateLimiter>,
    login_limiter: Arc<RateLimiter>,
}

impl fmt::Debug for LifeBankClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifeBankClient")
            .field("base_url", &self.base_url)
            .field("site_origin", &self.site_origin)
            .field("session", &"<redacted>")
            .field("options", &self.options)
            .finish()
    }
}

/// Classified result of one attempt.
enum AttemptError {
    Client { status: u16, body: String },
    Transient(TransientError),
}

impl LifeBankClient {
    /// Creates a client for `base_url` with a fresh session and a cookie
    /// store, so credentials ride along on every call.
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = build_or_fallback(reqwest::Client::builder().cookie_store(true));
        Self::with_http_client(base_url, http)
    }

    /// Creates a client around a preconfigured `reqwest::Client`.
    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            site_origin: DEFAULT_SITE_ORIGIN.to_owned(),
            session: SessionStore::new(),
            options: ClientOptions::default(),
            form_limiter: Arc::new(RateLimiter::form_submissions()),
            login_limiter: Arc::new(RateLimiter::login_attempts()),
        }
    }

    /// Creates a client from environment variables.
    ///
    /// Reads:
    /// - `LIFEBANK_API_URL`: API base URL, defaults to `https://api.lifebank.org`
    /// - `LIFEBANK_SITE_ORIGIN`: origin used in email links, optional
    ///
    /// Returns an error if a variable is set but empty.
    pub fn from_env() -> std::result::Result<Self, String> {
        let base_url = match std::env::var("LIFEBANK_API_URL") {
            Ok(url) if url.trim().is_empty() => {
                return Err("LIFEBANK_API_URL is set but empty".to_owned())
            }
            Ok(url) => url,
            Err(_) => DEFAULT_API_URL.to_owned(),
        };
        let mut client = Self::new(base_url.trim());
        if let Ok(origin) = std::env::var("LIFEBANK_SITE_ORIGIN") {
            if origin.trim().is_empty() {
                return Err("LIFEBANK_SITE_ORIGIN is set but empty".to_owned());
            }
            client = client.with_site_origin(origin.trim());
        }
        Ok(client)
    }

    /// Applies client options such as timeout and retry behavior.
    pub fn with_options(mut self, opts: ClientOptions) -> Self {
        self.options = opts;
        self
    }

    /// Origin used to build links in confirmation emails.
    pub fn with_site_origin(mut self, origin: impl Into<String>) -> Self {
        self.site_origin = origin.into().trim_end_matches('/').to_owned();
        self
    }

    /// Shares an existing session (CSRF token, auth token) with this client.
    pub fn with_session(mut self, session: SessionStore) -> Self {
        self.session = session;
        self
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Token stored by the last successful [`login_user`](Self::login_user).
    pub fn auth_token(&self) -> Option<String> {
        self.session.get(AUTH_TOKEN_KEY)
    }

    /// Sends `req` with retry and backoff and parses the JSON body.
    ///
    /// 4xx answers fail at once with [`LifeBankError::Client`]. Network
    /// errors, timeouts, other statuses and unparseable bodies are retried;
    /// once the attempts run out the last one is returned inside
    /// [`LifeBankError::ExhaustedRetries`]. A body that could not be
    /// serialized fails with [`LifeBankError::Encode`] before anything is sent.
    pub async fn request<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T> {
        check_body(&req)?;
        self.with_retry(&req.path, || self.attempt(&req)).await
    }

    /// Runs `run_attempt` until it succeeds, fails with a client error or
    /// the retry budget is spent, sleeping the backoff delay in between.
    async fn with_retry<T, F, Fut>(&self, path: &str, mut run_attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let mut backoff = self.options.retry_policy().backoff();

        loop {
            let err = match run_attempt().await {
                Ok(body) => return Ok(body),
                Err(AttemptError::Client { status, body }) => {
                    return Err(LifeBankError::Client { status, body })
                }
                Err(AttemptError::Transient(err)) => err,
            };

            let attempt = backoff.attempt();
            match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "request failed, retrying"
                    );
                    sleep(delay).await;
                }
                None => {
                    return Err(LifeBankError::ExhaustedRetries {
                        attempts: attempt,
                        last: err,
                    })
                }
            }
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        req: &ApiRequest,
    ) -> std::result::Result<T, AttemptError> {
        let timeout = req.timeout.unwrap_or_else(|| self.options.timeout());
        let mut builder = self
            .http
            .request(req.method.clone(), self.url(&req.path))
            .headers(self.headers_for(req))
            .timeout(timeout);
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|err| AttemptError::Transient(TransientError::Transport(err)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AttemptError::Transient(TransientError::Transport(err)))?;

        if !status.is_success() {
            return Err(classify_status(status, body));
        }

        parse_body(&body)
            .map_err(|message| AttemptError::Transient(TransientError::Decode(message)))
    }

    /// Default headers, then caller headers replacing any with the same name.
    fn headers_for(&self, req: &ApiRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match HeaderValue::from_str(&self.session.csrf_token()) {
            Ok(token) => {
                headers.insert(HeaderName::from_static("x-csrf-token"), token);
            }
            Err(err) => tracing::warn!(error = %err, "csrf token is not a valid header value"),
        }
        for (name, value) in &req.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid request header"),
            }
        }
        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Submits the registration form. A confirmation email follows when the
    /// server reports success; its failure never fails the registration.
    pub async fn submit_donor_registration(&self, data: &DonorRegistration) -> Result<ApiResponse> {
        let response: ApiResponse = self
            .request(ApiRequest::post(DONATE_PATH).json(data))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "donor registration failed"))?;

        if response.success {
            self.send_confirmation_email(&data.email, &data.first_name)
                .await;
        }
        Ok(response)
    }

    /// Like [`submit_donor_registration`](Self::submit_donor_registration),
    /// but parks the form in `store` when the server cannot be reached, for a
    /// later background sync. Client errors still fail.
    pub async fn submit_donor_registration_or_defer(
        &self,
        data: &DonorRegistration,
        store: &PendingStore,
    ) -> Result<SubmissionOutcome> {
        match self.submit_donor_registration(data).await {
            Ok(response) => Ok(SubmissionOutcome::Delivered(response)),
            Err(err) if err.is_transient() => {
                let payload =
                    serde_json::to_value(data).map_err(|err| LifeBankError::Encode(err.to_string()))?;
                let record = PendingRecord::new(payload);
                let id = record.id.clone();
                store.put(record).await?;
                tracing::info!(%id, error = %err, "registration deferred for background sync");
                Ok(SubmissionOutcome::Deferred { id })
            }
            Err(err) => Err(err),
        }
    }

    /// Current blood stock levels.
    pub async fn get_blood_inventory(&self) -> Result<Inventory> {
        self.request(ApiRequest::get(INVENTORY_PATH))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "failed to fetch inventory"))
    }

    /// Books a donation slot and emails the confirmation on success.
    pub async fn book_appointment(&self, data: &AppointmentRequest) -> Result<AppointmentResponse> {
        let response: AppointmentResponse = self
            .request(ApiRequest::post(APPOINTMENTS_PATH).json(data))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "appointment booking failed"))?;

        if response.success {
            let appointment_id = response.appointment_id.as_deref().unwrap_or_default();
            self.send_appointment_confirmation(&data.email, appointment_id)
                .await;
        }
        Ok(response)
    }

    pub async fn send_confirmation_email(&self, email: &str, name: &str) {
        let variables = json!({
            "name": name,
            "confirmLink": format!("{}/confirm?email={email}", self.site_origin),
        });
        self.send_email(email, "donor-confirmation", variables).await;
    }

    pub async fn send_appointment_confirmation(&self, email: &str, appointment_id: &str) {
        let variables = json!({
            "appointmentId": appointment_id,
            "rescheduleLink": format!("{}/reschedule?id={appointment_id}", self.site_origin),
        });
        self.send_email(email, "appointment-confirmation", variables)
            .await;
    }

    pub async fn send_contact_form_email(&self, data: &ContactForm) {
        let variables = json!({
            "name": data.first_name,
            "subject": data.subject,
        });
        self.send_email(&data.email, "contact-acknowledgment", variables)
            .await;
    }

    /// Email dispatch is best effort: failures are logged and dropped.
    async fn send_email(&self, to: &str, template: &str, variables: Value) {
        let payload = EmailRequest {
            to,
            template,
            variables,
        };
        let result: Result<Value> = self.request(ApiRequest::post(EMAIL_PATH).json(&payload)).await;
        if let Err(err) = result {
            tracing::error!(template, error = %err, "failed to send email");
        }
    }

    /// Logs in and keeps the returned token in the session.
    ///
    /// Attempts per email are capped by the login rate limiter.
    pub async fn login_user(&self, email: &str, password: &str) -> Result<LoginResponse> {
        if self.login_limiter.is_limited(email) {
            return Err(LifeBankError::RateLimited {
                remaining: self.login_limiter.remaining(email),
            });
        }

        let response: LoginResponse = self
            .request(ApiRequest::post(LOGIN_PATH).json(&json!({
                "email": email,
                "password": password,
            })))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "login failed"))?;

        if let Some(token) = &response.token {
            self.session.set(AUTH_TOKEN_KEY, token.clone());
        }
        Ok(response)
    }

    pub async fn logout_user(&self) -> Result<()> {
        let _: Value = self
            .request(ApiRequest::post(LOGOUT_PATH))
            .await
            .inspect_err(|err| tracing::error!(error = %err, "logout failed"))?;
        self.session.remove(AUTH_TOKEN_KEY);
        Ok(())
    }

    /// Rate-limited, sanitized, single-attempt form post.
    ///
    /// The CSRF token travels both as header and as `csrf_token` in the body.
    pub async fn submit_form(&self, path: &str, form: &Map<String, Value>) -> Result<Value> {
        let user = self.session.user_identifier();
        if self.form_limiter.is_limited(&user) {
            return Err(LifeBankError::RateLimited {
                remaining: self.form_limiter.remaining(&user),
            });
        }

        let mut body = sanitize_form_data(form);
        body.insert("csrf_token".to_owned(), Value::String(self.session.csrf_token()));

        let req = ApiRequest::new(Method::POST, path).json(&body);
        check_body(&req)?;
        match self.attempt(&req).await {
            Ok(value) => Ok(value),
            Err(AttemptError::Client { status, body }) => Err(LifeBankError::Client { status, body }),
            Err(AttemptError::Transient(err)) => {
                tracing::error!(path, error = %err, "form submission failed");
                Err(LifeBankError::Transient(err))
            }
        }
    }
}

/// Builds `builder`, falling back to a plain client when that fails. The
/// fallback has no cookie store, so the failure is logged.
fn build_or_fallback(builder: reqwest::ClientBuilder) -> reqwest::Client {
    match builder.build() {
        Ok(http) => http,
        Err(err) => {
            tracing::warn!(
                error = %err,
                "could not build HTTP client with cookie store, cookies will not be sent"
            );
            reqwest::Client::new()
        }
    }
}

fn check_body(req: &ApiRequest) -> Result<()> {
    match req.body_error() {
        Some(reason) => Err(LifeBankError::Encode(reason.to_owned())),
        None => Ok(()),
    }
}

fn classify_status(status: StatusCode, body: String) -> AttemptError {
    if status.is_client_error() {
        AttemptError::Client {
            status: status.as_u16(),
            body,
        }
    } else {
        AttemptError::Transient(TransientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Empty bodies read as JSON `null`.
fn parse_body<T: DeserializeOwned>(body: &str) -> std::result::Result<T, String> {
    let text = if body.trim().is_empty() { "null" } else { body };
    serde_json::from_str::<T>(text)
        .map_err(|err| format!("invalid response JSON: {err}; body: {body}"))
}
