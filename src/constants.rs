/// Every envelope on the wire carries this schema version.
pub const SCHEMA_VERSION: u64 = 1;

/// Provider accepted when the request does not name one.
pub const DEFAULT_PROVIDER: &str = "deepseek";

/// `source.agentName` for envelopes minted by the relay itself.
pub const BACKEND_AGENT: &str = "backend";

/// Envelope type tags
pub const TYPE_NAMESPACE: &str = "agentToUi/";
pub const TYPE_TEXT: &str = "agentToUi/text";
pub const TYPE_CHAT: &str = "agentToUi/chat";
pub const TYPE_CHAT_MESSAGE: &str = "agentToUi/chatMessage";
pub const TYPE_COMPONENT_TEMPLATE: &str = "agentToUi/componentTemplate";
pub const TYPE_TASK_STATUS: &str = "agentToUi/taskStatus";
pub const TYPE_ERROR: &str = "agentToUi/error";

/// Array-mode scanning
pub const ENVELOPES_KEY: &str = "\"envelopes\"";
pub const ARRAY_BUFFER_CEILING: usize = 200_000;
pub const ARRAY_BUFFER_KEEP: usize = 50_000;

/// Line-mode scanning
pub const LINE_BUFFER_CEILING: usize = 50_000;

/// Diagnostic bounds (characters)
pub const DISCARD_PREVIEW_CHARS: usize = 2_000;
pub const REPAIR_TAIL_PREVIEW_CHARS: usize = 2_000;
pub const TAIL_PREVIEW_CHARS: usize = 8_000;
pub const TEXT_FALLBACK_CHARS: usize = 8_000;
pub const BAD_JSON_RAW_CHARS: usize = 2_000;
pub const RECENT_EMITTED_LIMIT: usize = 30;

/// Upstream wire
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const SSE_DATA_PREFIX: &str = "data:";
pub const SSE_DONE_MARKER: &str = "[DONE]";
pub const MAX_UPSTREAM_LINE_BYTES: usize = 1024 * 1024;

/// Downstream SSE
pub const TURN_CHANNEL_CAPACITY: usize = 100;
pub const KEEPALIVE_INTERVAL_SECS: u64 = 15;

/// Phase narration
pub const PHASE_MSG_STARTED: &str = "started";
pub const PHASE_MSG_CONNECTING: &str = "connecting to model";
pub const PHASE_MSG_DRAFTING: &str = "drafting reply";
pub const PHASE_MSG_TEMPLATE: &str = "building component";
pub const PHASE_MSG_CONTENT: &str = "generating content";
pub const PHASE_MSG_RESIDUE: &str = "residue detected, asking the model to repair and continue";
pub const PHASE_MSG_REPAIRED: &str = "model output was truncated; the relay repaired it and continued";
pub const PHASE_MSG_REPAIR_WARNING: &str =
    "some residue was still dropped after the repair continuation";
pub const PHASE_MSG_ERROR: &str = "an error occurred";
pub const PHASE_MSG_DONE: &str = "done";
