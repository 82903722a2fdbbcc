use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::specs::openai::ResponseFormat;
use crate::types::*;

/// How the model is asked to frame its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseMode {
    /// Plain text, one text envelope per delta.
    #[serde(rename = "text")]
    Text,
    /// One JSON object holding an `envelopes` array.
    #[serde(rename = "agentToUi-json")]
    AgentToUiJson,
    /// One envelope per line.
    #[serde(rename = "agentToUi-jsonl")]
    AgentToUiJsonl,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::AgentToUiJson => "agentToUi-json",
            Self::AgentToUiJsonl => "agentToUi-jsonl",
        }
    }

    /// Array mode asks the provider for JSON output.
    pub fn response_format(&self) -> Option<ResponseFormat> {
        match self {
            Self::AgentToUiJson => Some(ResponseFormat::JsonObject),
            _ => None,
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseMode {
    type Err = ObservedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "agentToUi-json" => Ok(Self::AgentToUiJson),
            "agentToUi-jsonl" => Ok(Self::AgentToUiJsonl),
            other => Err(RelayError::BadRequest(format!("unsupported responseMode: {}", other)).into()),
        }
    }
}

/// Request body as the editor sends it. Every field is optional and loosely typed.
#[derive(Deserialize, Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawChatRequest {
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub context_pack: Option<Value>,
    #[serde(default)]
    pub viewport: Option<Value>,
    #[serde(default)]
    pub provider: Option<Value>,
    #[serde(default)]
    pub model: Option<Value>,
    #[serde(default)]
    pub response_mode: Option<Value>,
}

/// A validated chat turn request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub content: String,
    pub context_pack: Option<Value>,
    pub viewport: Option<Value>,
    pub provider: String,
    pub model_override: Option<String>,
    pub response_mode: ResponseMode,
}

fn non_empty_str(v: &Option<Value>) -> Option<&str> {
    v.as_ref().and_then(Value::as_str).filter(|s| !s.is_empty())
}

impl RawChatRequest {
    /// Parses a request body; anything that is not a JSON object counts as `{}`.
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => match serde_json::from_value(value) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(error = %e, "request body fields unreadable, using defaults");
                    Self::default()
                }
            },
            Ok(_) => Self::default(),
            Err(e) => {
                if !body.is_empty() {
                    tracing::debug!(error = %e, "request body is not JSON, using defaults");
                }
                Self::default()
            }
        }
    }

    pub fn validate(self, default_mode: ResponseMode, provider_name: &str) -> Result<ChatRequest> {
        let content = match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        if content.trim().is_empty() {
            return Err(RelayError::BadRequest("content is required".into()).into());
        }

        let provider = non_empty_str(&self.provider).unwrap_or(provider_name).to_string();
        if provider != provider_name {
            return Err(RelayError::BadRequest(format!("unsupported provider: {}", provider)).into());
        }

        let response_mode = match non_empty_str(&self.response_mode) {
            Some(mode) => mode.parse()?,
            None => default_mode,
        };

        Ok(ChatRequest {
            content,
            context_pack: self.context_pack.filter(|v| !v.is_null()),
            viewport: self.viewport.filter(Value::is_object),
            provider,
            model_override: non_empty_str(&self.model).map(str::to_owned),
            response_mode,
        })
    }
}
