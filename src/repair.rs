//! Line-mode residue repair: one continuation call asking the model to fix and resume.

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::constants::{
    PHASE_MSG_REPAIRED, PHASE_MSG_REPAIR_WARNING, PHASE_MSG_RESIDUE, RECENT_EMITTED_LIMIT,
    REPAIR_TAIL_PREVIEW_CHARS, TAIL_PREVIEW_CHARS,
};
use crate::dedup::EmittedRef;
use crate::engine::Turn;
use crate::envelope::Envelope;
use crate::phase::Phase;
use crate::scanner::LineScanner;
use crate::str_utils::prefix_chars;
use crate::types::*;

const REPAIR_SYSTEM: &str = "This is an automatic repair continuation: JSONL parsing of your previous output failed and was stopped. \
You must finish the user's task and output strictly JSONL, one complete agentToUi envelope JSON object per line, with no non-JSON content.";

const JSONL_PARSE_FAILURE: &str = "model output contained unparsable residue; it was dropped";

/// Bullet list of already-sent envelopes, or `(none)`.
fn emitted_lines(recent: &[EmittedRef]) -> String {
    if recent.is_empty() {
        return "(none)".to_string();
    }
    recent
        .iter()
        .map(|e| format!("- {} id={}", e.kind, e.id))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The original conversation followed by the repair instructions.
pub fn build_repair_messages(
    original: &[ChatMessage],
    tail: &str,
    recent: &[EmittedRef],
) -> Vec<ChatMessage> {
    let user = format!(
        "Your previous output triggered jsonl_parse_error. Preview of the unparsable residue \
         (for locating the problem only, do not repeat it):\n{}\n\n\
         Most recent messages already delivered to the editor (do not repeat them):\n{}\n\n\
         Now:\n\
         1) first output one agentToUi/chatMessage briefly saying you will correct and continue;\n\
         2) then continue with the remaining messages you were supposed to output;\n\
         3) follow the JSONL format strictly and output no extra text.",
        prefix_chars(tail, REPAIR_TAIL_PREVIEW_CHARS),
        emitted_lines(recent)
    );
    let mut messages = original.to_vec();
    messages.push(ChatMessage::system(REPAIR_SYSTEM));
    messages.push(ChatMessage::user(user));
    messages
}

pub fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

impl Turn {
    /// Details for the `jsonl_parse_error` envelope describing a residue nobody could repair.
    fn tail_diagnostics(&self, tail: &str, scanner: &LineScanner) -> Value {
        let mut details: Map<String, Value> = self.ctx.error_details();
        details.insert("model".into(), Value::String(self.ctx.model.clone()));
        details.insert("tailLen".into(), json!(tail.chars().count()));
        details.insert(
            "tailPreview".into(),
            Value::String(prefix_chars(tail, TAIL_PREVIEW_CHARS).to_string()),
        );
        details.insert("tailSha256".into(), Value::String(sha256_hex(tail)));
        details.insert(
            "discardedPrefixPreview".into(),
            json!(scanner.discarded_preview()),
        );
        details.insert(
            "flushedBufferDueToSize".into(),
            Value::Bool(scanner.flushed_due_to_size()),
        );
        details.insert(
            "emittedEnvelopes".into(),
            json!(self.dedup.recent(RECENT_EMITTED_LIMIT)),
        );
        Value::Object(details)
    }

    pub(crate) async fn repair_line_residue(
        &mut self,
        scanner: &mut LineScanner,
        tail: String,
    ) -> Result<()> {
        tracing::warn!(
            tail_len = tail.len(),
            tail_sha256 = %sha256_hex(&tail),
            "[⚙️  -> ☁️ ] line residue after stream end, requesting repair continuation"
        );
        self.metric.repair_attempted = true;
        let emitted_before = self.dedup.emitted_count();
        self.set_phase(Phase::Streaming, Some(PHASE_MSG_RESIDUE)).await?;

        let messages = build_repair_messages(
            &self.ctx.messages,
            &tail,
            self.dedup.recent(RECENT_EMITTED_LIMIT),
        );
        scanner.reset_buffer();
        let deltas = self.open_stream(messages, None).await?;
        let repair_deltas = self.pump_lines(scanner, deltas).await?;
        self.metric.repair_deltas = repair_deltas;
        self.drain_lines(scanner).await?;

        let added = self.dedup.emitted_count() - emitted_before;
        if added > 0 {
            tracing::info!(added, "repair continuation recovered the turn");
            self.set_phase(Phase::Repair, Some(PHASE_MSG_REPAIRED)).await?;
            if repair_deltas > 0 && !scanner.residue().is_empty() {
                tracing::warn!(
                    residue_len = scanner.residue().len(),
                    "residue left after repair continuation, dropped"
                );
                self.set_phase(Phase::RepairWarning, Some(PHASE_MSG_REPAIR_WARNING))
                    .await?;
            }
            return Ok(());
        }

        tracing::error!(repair_deltas, "repair continuation produced no envelope");
        let details = self.tail_diagnostics(&tail, scanner);
        self.emit(Envelope::error(
            ErrorCode::JsonlParseError,
            JSONL_PARSE_FAILURE,
            Some(details),
        ))
        .await
    }
}
