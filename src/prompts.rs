//! Conversation assembly for one turn.

use serde_json::Value;

use crate::ingress::ResponseMode;
use crate::types::ChatMessage;

const ROLE_LINE: &str = "You are the AI assistant of a video stage editor.";

const LINE_MODE_RULES: &[&str] = &[
    "Output JSONL only: one complete JSON object per line and nothing else.",
    "Every character you output must belong to a JSON object line. No prose, prefixes, suffixes or blank lines.",
    "To say something to the user, send an agentToUi/chatMessage envelope with the text in payload.content.",
    "Do not use Markdown or code fences. Do not pretty-print: each envelope stays on its own line.",
    "Each line is a full envelope with schemaVersion=1, type, id, createdAt and payload.",
    "Never wrap JSON inside a JSON string.",
    "User-visible text fields must not contain braces, brackets or envelope field names. Refer to nodes by nodeId only.",
];

const ARRAY_MODE_RULES: &[&str] = &[
    "Output json: a single JSON object, never several objects and never JSONL.",
    "The shape is always {\"envelopes\":[ ... ]} where each element is an envelope.",
    "Write the array elements in order and close each object as soon as it is complete, so it can be streamed.",
    "Each envelope contains schemaVersion=1, type, id, createdAt, source and payload.",
    "User-visible text fields must not contain braces, brackets or envelope field names.",
];

const ARRAY_MODE_EXAMPLE: &str = r#"EXAMPLE JSON OUTPUT:
{
  "envelopes": [
    {
      "schemaVersion": 1,
      "type": "agentToUi/text",
      "id": "00000000-0000-0000-0000-000000000000",
      "createdAt": "2026-01-01T00:00:00Z",
      "source": { "agentName": "assistant" },
      "payload": { "text": "example" }
    }
  ]
}"#;

fn line_mode_parts(default_intent: &str, viewport: Option<&Value>) -> Vec<String> {
    let mut parts: Vec<String> = LINE_MODE_RULES.iter().map(|s| s.to_string()).collect();
    parts.push(format!(
        "When inserting something onto the stage: first send one short agentToUi/chatMessage saying what you will insert, \
         then one agentToUi/componentTemplate with payload.intent=\"{}\" and payload.template. \
         Use agentToUi/patchNode or agentToUi/deleteNode with payload.nodeId to correct existing nodes.",
        default_intent
    ));
    if let Some(viewport) = viewport {
        parts.push(format!("Current viewport (JSON):\n{}", viewport));
    }
    parts
}

/// System prompt plus the user's message.
pub fn build_messages(
    content: &str,
    context_pack: Option<&Value>,
    mode: ResponseMode,
    viewport: Option<&Value>,
) -> Vec<ChatMessage> {
    let mut parts = vec![ROLE_LINE.to_string()];
    match mode {
        ResponseMode::AgentToUiJsonl => parts.extend(line_mode_parts("insert", viewport)),
        ResponseMode::AgentToUiJson => {
            parts.extend(ARRAY_MODE_RULES.iter().map(|s| s.to_string()));
            parts.push(ARRAY_MODE_EXAMPLE.to_string());
        }
        ResponseMode::Text => {}
    }
    if let Some(pack) = context_pack.filter(|v| !v.is_null()) {
        parts.push(format!("contextPack(JSON):\n{}", pack));
    }
    vec![ChatMessage::system(parts.join("\n")), ChatMessage::user(content)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    #[test]
    fn text_mode_is_role_line_plus_user() {
        let msgs = build_messages("hello", None, ResponseMode::Text, None);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, ROLE_LINE);
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[1].content, "hello");
    }

    #[test]
    fn array_mode_mentions_json_and_example() {
        let msgs = build_messages("x", None, ResponseMode::AgentToUiJson, None);
        assert!(msgs[0].content.contains("json"));
        assert!(msgs[0].content.contains("\"envelopes\""));
    }

    #[test]
    fn line_mode_carries_context_and_viewport() {
        let pack = json!({"selected": ["n1"]});
        let viewport = json!({"width": 1920});
        let msgs = build_messages(
            "x",
            Some(&pack),
            ResponseMode::AgentToUiJsonl,
            Some(&viewport),
        );
        let system = &msgs[0].content;
        assert!(system.contains("JSONL"));
        assert!(system.contains(r#"{"selected":["n1"]}"#));
        assert!(system.contains(r#"{"width":1920}"#));
    }
}
