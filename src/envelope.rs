//! The envelope: the unit every downstream consumer sees.
//!
//! Objects decoded from model output are either full envelopes (forwarded as-is),
//! short-form `{type, payload, meta?}` messages (completed here), or foreign JSON.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{
    BACKEND_AGENT, SCHEMA_VERSION, TYPE_CHAT, TYPE_CHAT_MESSAGE, TYPE_ERROR, TYPE_TASK_STATUS,
    TYPE_TEXT,
};
use crate::phase::Phase;
use crate::types::ErrorCode;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub schema_version: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Who produced model-originated envelopes this turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub model: String,
    pub provider: String,
}

impl Origin {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
        }
    }

    fn source(&self) -> Value {
        serde_json::json!({ "agentName": self.model, "provider": self.provider })
    }
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn backend_source() -> Value {
    serde_json::json!({ "agentName": BACKEND_AGENT })
}

fn is_schema_v1(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Number(n)) => n.as_u64() == Some(SCHEMA_VERSION) || n.as_f64() == Some(1.0),
        _ => false,
    }
}

/// The admission predicate: schemaVersion 1, string type/id/createdAt, payload key present.
pub fn is_valid_envelope(obj: &Map<String, Value>) -> bool {
    is_schema_v1(obj.get("schemaVersion"))
        && obj.get("type").is_some_and(Value::is_string)
        && obj.get("id").is_some_and(Value::is_string)
        && obj.get("createdAt").is_some_and(Value::is_string)
        && obj.contains_key("payload")
}

/// `{type: string, payload}` with the envelope boilerplate missing.
pub fn is_short_form(obj: &Map<String, Value>) -> bool {
    obj.get("type").is_some_and(Value::is_string) && obj.contains_key("payload")
}

/// Type tag of a candidate object, if it is a string.
pub fn type_of(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("type").and_then(Value::as_str)
}

/// Non-empty id the model put on the object, used for dedup before normalization.
pub fn claimed_id(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("id").and_then(Value::as_str).filter(|id| !id.is_empty())
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> String {
    match obj.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

/// `agentToUi/chat` with a string `content` (or `message`) becomes a plain chatMessage.
fn rewrite_chat_alias(obj: Map<String, Value>) -> Map<String, Value> {
    if type_of(&obj) != Some(TYPE_CHAT) {
        return obj;
    }
    let text = obj.get("payload").and_then(Value::as_object).and_then(|p| {
        p.get("content")
            .and_then(Value::as_str)
            .or_else(|| p.get("message").and_then(Value::as_str))
            .map(str::to_owned)
    });
    match text {
        Some(content) => {
            let mut out = Map::new();
            out.insert("type".into(), Value::String(TYPE_CHAT_MESSAGE.into()));
            out.insert("payload".into(), serde_json::json!({ "content": content }));
            out
        }
        None => obj,
    }
}

/// Completes `obj` into an envelope. Well-formed envelopes keep every field they carry;
/// anything else is treated as short-form and gets a fresh id, timestamp and model source.
pub fn normalize(obj: Map<String, Value>, origin: &Origin) -> Envelope {
    if is_valid_envelope(&obj) {
        let mut obj = obj;
        obj.remove("schemaVersion");
        let kind = take_string(&mut obj, "type");
        let id = take_string(&mut obj, "id");
        let created_at = take_string(&mut obj, "createdAt");
        // An explicit null stays `Some(Value::Null)` and serializes back as null.
        let source = obj.remove("source");
        let payload = obj.remove("payload").unwrap_or(Value::Null);
        let meta = obj.remove("meta");
        return Envelope {
            schema_version: SCHEMA_VERSION,
            kind,
            id,
            created_at,
            source,
            payload,
            meta,
            extra: obj,
        };
    }

    let mut obj = rewrite_chat_alias(obj);
    let kind = take_string(&mut obj, "type");
    let payload = obj.remove("payload").unwrap_or(Value::Null);
    let meta = obj.remove("meta").filter(Value::is_object);
    Envelope {
        schema_version: SCHEMA_VERSION,
        kind,
        id: fresh_id(),
        created_at: now_timestamp(),
        source: Some(origin.source()),
        payload,
        meta,
        extra: Map::new(),
    }
}

impl Envelope {
    fn minted(kind: &str, source: Value, payload: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            kind: kind.to_string(),
            id: fresh_id(),
            created_at: now_timestamp(),
            source: Some(source),
            payload,
            meta: None,
            extra: Map::new(),
        }
    }

    pub fn text(text: impl Into<String>, origin: &Origin) -> Self {
        Self::minted(
            TYPE_TEXT,
            origin.source(),
            serde_json::json!({ "text": text.into() }),
        )
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, details: Option<Value>) -> Self {
        let mut payload = serde_json::json!({ "code": code, "message": message.into() });
        if let Some(details) = details {
            payload["details"] = details;
        }
        Self::minted(TYPE_ERROR, backend_source(), payload)
    }

    pub fn task_status(phase: Phase, message: Option<&str>) -> Self {
        let mut payload = serde_json::json!({ "phase": phase });
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            payload["message"] = Value::String(message.to_string());
        }
        Self::minted(TYPE_TASK_STATUS, backend_source(), payload)
    }

    /// Merges extra keys into `payload.details` of an error envelope.
    pub fn with_details(mut self, extra: Map<String, Value>) -> Self {
        if let Some(payload) = self.payload.as_object_mut() {
            let details = payload
                .entry("details")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(details) = details.as_object_mut() {
                for (k, v) in extra {
                    details.entry(k).or_insert(v);
                }
            }
        }
        self
    }
}
