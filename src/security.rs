//! CSRF token, session storage, rate limiting and form input sanitization.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{Map, Value};

const CSRF_TOKEN_KEY: &str = "csrf_token";
const USER_IDENTIFIER_KEY: &str = "user_identifier";
pub(crate) const AUTH_TOKEN_KEY: &str = "auth_token";

/// Session-scoped key/value storage. Lives as long as the process; clones
/// share the same map.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> {
        self.entries.lock().remove(key)
    }

    /// Per-session CSRF token, generated on first use.
    pub fn csrf_token(&self) -> String {
        self.get_or_generate(CSRF_TOKEN_KEY)
    }

    /// Opaque per-session identifier used to key rate limits.
    pub fn user_identifier(&self) -> String {
        self.get_or_generate(USER_IDENTIFIER_KEY)
    }

    fn get_or_generate(&self, key: &str) -> String {
        self.entries
            .lock()
            .entry(key.to_owned())
            .or_insert_with(generate_token)
            .clone()
    }
}

/// Random lowercase alphanumeric part followed by the base-36 timestamp.
pub fn generate_token() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(11)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect();
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{random}{}", to_base36(millis))
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Sliding-window limiter keyed by an arbitrary identifier.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Three submissions per minute.
    pub fn form_submissions() -> Self {
        Self::new(3, Duration::from_secs(60))
    }

    /// Five login attempts per five minutes.
    pub fn login_attempts() -> Self {
        Self::new(5, Duration::from_secs(300))
    }

    /// Returns `true` when `identifier` is over the limit. Otherwise records
    /// this attempt and returns `false`.
    pub fn is_limited(&self, identifier: &str) -> bool {
        self.is_limited_at(identifier, Instant::now())
    }

    pub fn remaining(&self, identifier: &str) -> u32 {
        self.remaining_at(identifier, Instant::now())
    }

    pub fn reset(&self, identifier: &str) {
        self.attempts.lock().remove(identifier);
    }

    fn is_limited_at(&self, identifier: &str, now: Instant) -> bool {
        let mut attempts = self.attempts.lock();
        // identifiers with nothing left in the window are dropped
        attempts.retain(|_, timestamps| {
            timestamps.retain(|ts| now.saturating_duration_since(*ts) < self.window);
            !timestamps.is_empty()
        });
        let timestamps = attempts.entry(identifier.to_owned()).or_default();

        if timestamps.len() >= self.max_attempts as usize {
            return true;
        }
        timestamps.push(now);
        false
    }

    fn remaining_at(&self, identifier: &str, now: Instant) -> u32 {
        let attempts = self.attempts.lock();
        let used = attempts
            .get(identifier)
            .map(|timestamps| {
                timestamps
                    .iter()
                    .filter(|ts| now.saturating_duration_since(**ts) < self.window)
                    .count()
            })
            .unwrap_or(0);
        self.max_attempts.saturating_sub(used as u32)
    }
}

/// Escapes text so it renders literally inside HTML.
pub fn sanitize_input(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            other => out.push(other),
        }
    }
    out
}

pub fn sanitize_email(email: &str) -> String {
    email
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '@' | '.' | '-' | '_'))
        .collect()
}

pub fn sanitize_phone(phone: &str) -> String {
    phone
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '-' | '(' | ')' | '+') || ch.is_whitespace())
        .collect()
}

/// Escapes and trims top-level strings; escapes strings inside arrays.
/// Other values pass through untouched.
pub fn sanitize_form_data(form: &Map<String, Value>) -> Map<String, Value> {
    form.iter()
        .map(|(key, value)| {
            let cleaned = match value {
                Value::String(text) => Value::String(sanitize_input(text).trim().to_owned()),
                Value::Array(items) => Value::Array(
                    items
                        .iter()
                        .map(|item| match item {
                            Value::String(text) => Value::String(sanitize_input(text)),
                            other => other.clone(),
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
            (key.clone(), cleaned)
        })
        .collect()
}
