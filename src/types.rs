use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Per-call request descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub path: String,
    pub method: Method,
    pub body: Option<Value>,
    /// Extra headers; applied after the defaults, so they win on conflict.
    pub headers: Vec<(String, String)>,
    /// Overrides the client-wide per-attempt timeout.
    pub timeout: Option<Duration>,
    /// Set when [`json`](Self::json) could not serialize the body; the
    /// client fails before sending.
    body_error: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            body: None,
            headers: Vec::new(),
            timeout: None,
            body_error: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Sets a JSON body. A serialization failure is kept and reported when
    /// the request is sent.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => {
                self.body = Some(value);
                self.body_error = None;
            }
            Err(err) => {
                self.body = None;
                self.body_error = Some(err.to_string());
            }
        }
        self
    }

    /// Why the last [`json`](Self::json) body could not be serialized.
    pub fn body_error(&self) -> Option<&str> {
        self.body_error.as_deref()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Multi-step registration form as posted to `/api/donate`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonorRegistration {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: String,
    #[serde(default)]
    pub gender: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub blood_type: String,
    #[serde(default)]
    pub medical_history: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Appointment booking as posted to `/api/appointments`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentRequest {
    pub email: String,
    /// Fields the server understands beyond the email (date, time, center…).
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

/// Contact form; only the fields the acknowledgment email needs are typed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactForm {
    pub email: String,
    pub first_name: String,
    pub subject: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Generic `{success, message, …}` answer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub appointment_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Blood stock levels keyed by blood type (`"O+"`, `"AB-"`, …).
pub type Inventory = Map<String, Value>;

/// Result of a submission that may fall back to the pending store.
#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionOutcome {
    Delivered(ApiResponse),
    /// Stored for background sync under this record id.
    Deferred { id: String },
}
