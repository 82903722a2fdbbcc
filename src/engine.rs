//! Turn engine: drives one chat turn from upstream deltas to downstream envelopes.
//!
//! Every status and data envelope goes through the turn's [`OutputSink`] in the
//! order it was produced. The engine never awaits the next delta before the
//! envelopes recognised in the current one have been handed to the sink.

use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::constants::{
    PHASE_MSG_CONNECTING, PHASE_MSG_DONE, PHASE_MSG_DRAFTING, PHASE_MSG_ERROR,
    PHASE_MSG_STARTED, TEXT_FALLBACK_CHARS, TYPE_NAMESPACE,
};
use crate::dedup::DedupRegistry;
use crate::envelope::{self, Envelope, Origin};
use crate::ingress::ResponseMode;
use crate::logging::TurnMetric;
use crate::phase::{Phase, PhaseTracker};
use crate::scanner::{ArrayScanner, LineScanner};
use crate::specs::openai::ResponseFormat;
use crate::str_utils::prefix_chars;
use crate::streaming::OutputSink;
use crate::types::*;
use crate::upstream::{DeltaSource, DeltaStream};

/// Everything a turn needs to know about the request that started it.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub conversation_id: String,
    pub provider: String,
    pub model: String,
    pub response_mode: ResponseMode,
    pub messages: Vec<ChatMessage>,
}

impl TurnContext {
    pub fn origin(&self) -> Origin {
        Origin::new(&self.model, &self.provider)
    }

    /// `{provider, responseMode}` attached to mode-level error envelopes.
    pub fn error_details(&self) -> Map<String, Value> {
        let mut details = Map::new();
        details.insert("provider".into(), Value::String(self.provider.clone()));
        details.insert(
            "responseMode".into(),
            Value::String(self.response_mode.as_str().into()),
        );
        details
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Emitted,
    Duplicate,
    Rejected,
}

/// State of one streamed turn. Nothing here outlives the turn.
pub struct Turn {
    pub(crate) source: Arc<dyn DeltaSource>,
    pub(crate) ctx: TurnContext,
    pub(crate) origin: Origin,
    pub(crate) sink: OutputSink,
    pub(crate) phase: PhaseTracker,
    pub(crate) dedup: DedupRegistry,
    pub(crate) metric: TurnMetric,
    pub(crate) discarded_bytes: usize,
}

impl Turn {
    pub fn new(source: Arc<dyn DeltaSource>, ctx: TurnContext, sink: OutputSink) -> Self {
        Self {
            source,
            origin: ctx.origin(),
            ctx,
            sink,
            phase: PhaseTracker::new(),
            dedup: DedupRegistry::new(),
            metric: TurnMetric::new(),
            discarded_bytes: 0,
        }
    }

    /// Runs the turn to completion. Always ends with a `done` event unless the client left.
    pub async fn run(mut self) {
        tracing::info!(
            conversation_id = %prefix_chars(&self.ctx.conversation_id, 8),
            mode = %self.ctx.response_mode,
            "[🖥️  -> ⚙️ ] turn started"
        );
        let outcome = match self.drive().await {
            Ok(()) => match self.finish().await {
                Ok(()) => "done",
                Err(_) => "disconnected",
            },
            Err(e) if e.is_disconnect() => {
                tracing::debug!("client disconnected, turn abandoned");
                "disconnected"
            }
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] turn failed: {}", e);
                match self.fail(&e).await {
                    Ok(()) => "error",
                    Err(_) => "disconnected",
                }
            }
        };
        self.metric.log_summary(outcome, self.discarded_bytes);
    }

    async fn finish(&mut self) -> Result<()> {
        self.set_phase(Phase::Done, Some(PHASE_MSG_DONE)).await?;
        self.sink.done().await
    }

    async fn fail(&mut self, e: &ObservedError) -> Result<()> {
        self.set_phase(Phase::Error, Some(PHASE_MSG_ERROR)).await?;
        let envelope = Envelope::error(
            ErrorCode::UpstreamError,
            e.inner.to_string(),
            e.inner.details(),
        );
        self.emit(envelope).await?;
        self.sink.done().await
    }

    async fn drive(&mut self) -> Result<()> {
        self.set_phase(Phase::Started, Some(PHASE_MSG_STARTED)).await?;
        match self.ctx.response_mode {
            ResponseMode::Text => self.drive_text().await,
            ResponseMode::AgentToUiJson => self.drive_array().await,
            ResponseMode::AgentToUiJsonl => self.drive_lines().await,
        }
    }

    pub(crate) async fn set_phase(&mut self, phase: Phase, message: Option<&str>) -> Result<()> {
        if let Some(status) = self.phase.advance(phase, message) {
            self.metric.statuses += 1;
            self.sink.emit(status).await?;
        }
        Ok(())
    }

    pub(crate) async fn emit(&mut self, envelope: Envelope) -> Result<()> {
        self.metric.envelopes += 1;
        self.sink.emit(envelope).await
    }

    /// Opens an upstream stream, giving up early if the client goes away.
    pub(crate) async fn open_stream(
        &self,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
    ) -> Result<DeltaStream> {
        tokio::select! {
            biased;
            _ = self.sink.closed() => Err(RelayError::ClientDisconnected.into()),
            opened = self.source.stream_deltas(messages, response_format) => opened,
        }
    }

    /// Next delta, or a disconnect error as soon as the client leaves. Dropping
    /// the stream on disconnect releases the upstream connection.
    pub(crate) async fn next_delta(&self, deltas: &mut DeltaStream) -> Result<Option<String>> {
        tokio::select! {
            biased;
            _ = self.sink.closed() => Err(RelayError::ClientDisconnected.into()),
            next = deltas.next() => next.transpose(),
        }
    }

    /// Dedup, normalize, narrate and emit one accepted object.
    pub(crate) async fn admit(&mut self, obj: Map<String, Value>) -> Result<Admission> {
        if let Some(id) = envelope::claimed_id(&obj) {
            if !self.dedup.claim(id) {
                tracing::debug!(id, "duplicate envelope dropped");
                self.metric.duplicates += 1;
                return Ok(Admission::Duplicate);
            }
        }
        let envelope = envelope::normalize(obj, &self.origin);
        self.dedup.record(&envelope.id, &envelope.kind);
        let (phase, message) = Phase::for_envelope_type(&envelope.kind);
        self.set_phase(phase, Some(message)).await?;
        self.emit(envelope).await?;
        Ok(Admission::Emitted)
    }

    // --- text mode ---

    async fn drive_text(&mut self) -> Result<()> {
        let mut deltas = self.open_stream(self.ctx.messages.clone(), None).await?;
        while let Some(delta) = self.next_delta(&mut deltas).await? {
            if self.metric.deltas == 0 {
                self.set_phase(Phase::Streaming, Some(PHASE_MSG_CONNECTING)).await?;
                self.set_phase(Phase::Writing, Some(PHASE_MSG_DRAFTING)).await?;
            }
            self.metric.record_delta(&delta);
            let envelope = Envelope::text(delta, &self.origin);
            self.dedup.record(&envelope.id, &envelope.kind);
            self.emit(envelope).await?;
        }
        Ok(())
    }

    // --- array mode ---

    async fn admit_array_object(&mut self, obj: Map<String, Value>) -> Result<Admission> {
        if envelope::is_valid_envelope(&obj) || envelope::is_short_form(&obj) {
            return self.admit(obj).await;
        }
        tracing::debug!(
            keys = ?obj.keys().collect::<Vec<_>>(),
            "array element is neither envelope nor short-form, dropped"
        );
        self.metric.rejected += 1;
        Ok(Admission::Rejected)
    }

    async fn drive_array(&mut self) -> Result<()> {
        self.set_phase(Phase::Streaming, Some(PHASE_MSG_CONNECTING)).await?;
        let mut scanner = ArrayScanner::new();
        let mut deltas = self
            .open_stream(self.ctx.messages.clone(), Some(ResponseFormat::JsonObject))
            .await?;

        while let Some(delta) = self.next_delta(&mut deltas).await? {
            self.metric.record_delta(&delta);
            for obj in scanner.feed(&delta) {
                self.admit_array_object(obj).await?;
            }
        }
        self.discarded_bytes = scanner.evicted_bytes();
        self.metric.rejected += scanner.skipped_objects();

        if self.metric.deltas == 0 {
            let envelope = Envelope::error(
                ErrorCode::EmptyContent,
                "model returned empty content in JSON output mode",
                Some(Value::Object(self.ctx.error_details())),
            );
            return self.emit(envelope).await;
        }

        if self.dedup.emitted_count() == 0 {
            let tail = scanner.residue().trim();
            if !tail.is_empty() {
                tracing::warn!(
                    tail_len = tail.len(),
                    array_found = scanner.array_found(),
                    "no envelope extracted, surfacing raw text"
                );
                let envelope = Envelope::text(prefix_chars(tail, TEXT_FALLBACK_CHARS), &self.origin);
                self.dedup.record(&envelope.id, &envelope.kind);
                return self.emit(envelope).await;
            }
        } else if !scanner.is_finished() {
            tracing::warn!(
                residue_len = scanner.residue().len(),
                "envelopes array never closed"
            );
        }
        Ok(())
    }

    // --- line mode ---

    async fn admit_line_object(&mut self, obj: Map<String, Value>) -> Result<Admission> {
        let namespaced_short_form = envelope::is_short_form(&obj)
            && envelope::type_of(&obj).is_some_and(|t| t.starts_with(TYPE_NAMESPACE));
        if envelope::is_valid_envelope(&obj) || namespaced_short_form {
            return self.admit(obj).await;
        }

        tracing::warn!(
            keys = ?obj.keys().collect::<Vec<_>>(),
            "decoded object is not an envelope, reporting instead of forwarding"
        );
        self.metric.rejected += 1;
        let envelope = Envelope::error(
            ErrorCode::UnexpectedJsonShape,
            "model produced a JSON object that is not an envelope; it was ignored",
            Some(Value::Object(self.ctx.error_details())),
        );
        self.emit(envelope).await?;
        Ok(Admission::Rejected)
    }

    /// Feeds a delta stream through the line scanner. Returns how many deltas arrived.
    pub(crate) async fn pump_lines(
        &mut self,
        scanner: &mut LineScanner,
        mut deltas: DeltaStream,
    ) -> Result<usize> {
        let mut count = 0;
        while let Some(delta) = self.next_delta(&mut deltas).await? {
            if count == 0 {
                self.set_phase(Phase::Streaming, Some(PHASE_MSG_CONNECTING)).await?;
            }
            count += 1;
            self.metric.record_delta(&delta);
            for obj in scanner.feed(&delta) {
                self.admit_line_object(obj).await?;
            }
        }
        Ok(count)
    }

    pub(crate) async fn drain_lines(&mut self, scanner: &mut LineScanner) -> Result<()> {
        for obj in scanner.drain() {
            self.admit_line_object(obj).await?;
        }
        Ok(())
    }

    async fn drive_lines(&mut self) -> Result<()> {
        let mut scanner = LineScanner::new();
        let deltas = self.open_stream(self.ctx.messages.clone(), None).await?;
        self.pump_lines(&mut scanner, deltas).await?;
        self.drain_lines(&mut scanner).await?;

        let tail = scanner.residue().to_string();
        if !tail.is_empty() {
            self.repair_line_residue(&mut scanner, tail).await?;
        }
        self.discarded_bytes = scanner.discarded_bytes();
        Ok(())
    }
}

/// Single-shot turn: one upstream completion turned into one assistant envelope.
pub async fn complete_turn(source: &dyn DeltaSource, ctx: &TurnContext) -> Result<Envelope> {
    let origin = ctx.origin();
    let text = source
        .complete_once(ctx.messages.clone(), ctx.response_mode.response_format())
        .await?;

    if ctx.response_mode != ResponseMode::AgentToUiJson {
        return Ok(Envelope::text(text, &origin));
    }
    if text.trim().is_empty() {
        return Err(RelayError::EmptyContent.into());
    }
    let value: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "JSON output mode returned invalid JSON");
            return Err(RelayError::BadJson(text).into());
        }
    };
    let first = value
        .get("envelopes")
        .and_then(Value::as_array)
        .and_then(|envs| envs.first())
        .and_then(Value::as_object);
    match first {
        Some(obj) => Ok(envelope::normalize(obj.clone(), &origin)),
        None => Ok(Envelope::text(text, &origin)),
    }
}
