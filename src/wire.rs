use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{type, data}` frame used in both directions on the push channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Body of `POST /api/email/send`.
#[derive(Debug, Serialize)]
pub struct EmailRequest<'a> {
    pub to: &'a str,
    pub template: &'a str,
    pub variables: Value,
}

/// Worker control message, e.g. `{"type":"SKIP_WAITING"}`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SkipWaiting,
}
