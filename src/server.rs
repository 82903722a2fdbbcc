//! HTTP surface: conversation creation, single-shot and streamed turns.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

use crate::engine::{complete_turn, Turn, TurnContext};
use crate::envelope::{now_timestamp, Envelope};
use crate::health;
use crate::ingress::{RawChatRequest, ResponseMode};
use crate::logging::turn_id_middleware;
use crate::prompts::build_messages;
use crate::str_utils::prefix_chars;
use crate::streaming::{self, OutputSink};
use crate::types::*;
use crate::upstream::OpenAiDeltaSource;
use crate::AppState;

const ACTION_MESSAGES: &str = "messages";
const ACTION_STREAM: &str = "messages:stream";

pub fn build_router(state: Arc<AppState>) -> Router {
    let chat = Router::new()
        .route("/conversations", post(create_conversation))
        .route("/conversations/:id/:action", post(conversation_action));

    Router::new()
        .merge(chat.clone())
        .nest("/api/chat", chat)
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(turn_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub id: String,
    pub created_at: String,
}

async fn create_conversation() -> Json<ConversationCreated> {
    let created = ConversationCreated {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now_timestamp(),
    };
    tracing::info!(conversation_id = %created.id, "conversation created");
    Json(created)
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SingleShotReply {
    pub conversation_id: String,
    pub assistant: Envelope,
}

// `messages` and `messages:stream` arrive as the `:action` segment.
async fn conversation_action(
    State(state): State<Arc<AppState>>,
    Path((conversation_id, action)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match action.as_str() {
        ACTION_MESSAGES => send_message(state, conversation_id, body).await,
        ACTION_STREAM => stream_message(state, conversation_id, body),
        other => {
            tracing::debug!(action = %other, "unknown conversation action");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Validates the request and resolves the provider. No upstream call happens here.
fn prepare_turn(
    state: &AppState,
    conversation_id: String,
    body: &[u8],
    default_mode: ResponseMode,
) -> Result<(TurnContext, OpenAiDeltaSource)> {
    let request = RawChatRequest::from_body(body).validate(default_mode, &state.provider.name)?;
    let provider = state.provider.resolve(request.model_override.as_deref())?;

    let messages = build_messages(
        &request.content,
        request.context_pack.as_ref(),
        request.response_mode,
        request.viewport.as_ref(),
    );
    let source = OpenAiDeltaSource::new(state.client.clone(), &provider, state.args.upstream_timeout());
    let ctx = TurnContext {
        conversation_id,
        provider: request.provider,
        model: provider.model,
        response_mode: request.response_mode,
        messages,
    };
    Ok((ctx, source))
}

fn error_reply(e: ObservedError, extra: Option<Map<String, Value>>) -> Response {
    match extra {
        Some(extra) => {
            tracing::warn!(code = %e.inner.code(), "{}", e.inner);
            let envelope = e.inner.to_envelope().with_details(extra);
            (e.inner.status(), Json(envelope)).into_response()
        }
        None => e.into_response(),
    }
}

async fn send_message(state: Arc<AppState>, conversation_id: String, body: Bytes) -> Response {
    let (ctx, source) = match prepare_turn(&state, conversation_id, &body, ResponseMode::Text) {
        Ok(prepared) => prepared,
        Err(e) => return e.into_response(),
    };
    let span = tracing::info_span!(
        "turn",
        cid = %prefix_chars(&ctx.conversation_id, 8),
        model = %ctx.model,
        mode = %ctx.response_mode
    );

    match complete_turn(&source, &ctx).instrument(span).await {
        Ok(assistant) => Json(SingleShotReply {
            conversation_id: ctx.conversation_id,
            assistant,
        })
        .into_response(),
        Err(e) => {
            let extra = matches!(e.inner, RelayError::EmptyContent | RelayError::BadJson(_))
                .then(|| ctx.error_details());
            error_reply(e, extra)
        }
    }
}

fn stream_message(state: Arc<AppState>, conversation_id: String, body: Bytes) -> Response {
    let (ctx, source) =
        match prepare_turn(&state, conversation_id, &body, ResponseMode::AgentToUiJsonl) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(code = %e.inner.code(), "stream request rejected: {}", e.inner);
                return streaming::error_response(e.inner.to_envelope());
            }
        };

    let span = tracing::info_span!(
        "turn",
        cid = %prefix_chars(&ctx.conversation_id, 8),
        model = %ctx.model,
        mode = %ctx.response_mode
    );
    let (sink, rx) = OutputSink::channel();
    tokio::spawn(Turn::new(Arc::new(source), ctx, sink).run().instrument(span));

    streaming::channel_response(rx)
}
