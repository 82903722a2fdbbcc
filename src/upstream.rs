//! Delta source: the OpenAI-compatible chat completions client.

use axum::http::StatusCode;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use std::borrow::Cow;
use std::time::Duration;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;

use crate::constants::{
    CHAT_COMPLETIONS_PATH, MAX_UPSTREAM_LINE_BYTES, SSE_DATA_PREFIX, SSE_DONE_MARKER,
};
use crate::main_helper::ResolvedProvider;
use crate::specs::openai::{
    ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ProviderError, ResponseFormat,
};
use crate::str_utils::prefix_chars;
use crate::types::*;

/// Lazy, finite, consume-once sequence of text fragments.
pub type DeltaStream = BoxStream<'static, Result<String>>;

/// Anything that can turn a conversation into model text.
pub trait DeltaSource: Send + Sync {
    fn stream_deltas(
        &self,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
    ) -> BoxFuture<'_, Result<DeltaStream>>;

    fn complete_once(
        &self,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
    ) -> BoxFuture<'_, Result<String>>;
}

#[derive(Debug, PartialEq)]
pub enum LineEvent {
    Delta(String),
    Done,
    Error(String),
    Skip,
}

/// Classifies one line of the upstream event feed.
pub fn parse_delta_line(line: &str) -> LineEvent {
    let Some(data) = line.trim().strip_prefix(SSE_DATA_PREFIX) else {
        return LineEvent::Skip;
    };
    let data = data.trim();
    if data == SSE_DONE_MARKER {
        return LineEvent::Done;
    }
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err.error.message);
    }
    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => match chunk.first_content() {
            Some(text) => LineEvent::Delta(text),
            None => LineEvent::Skip,
        },
        Err(e) => {
            tracing::debug!(error = %e, line = %prefix_chars(data, 200), "skipping malformed stream line");
            LineEvent::Skip
        }
    }
}

pub struct OpenAiDeltaSource {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

impl OpenAiDeltaSource {
    pub fn new(client: reqwest::Client, provider: &ResolvedProvider, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}{}",
                provider.base_url.trim_end_matches('/'),
                CHAT_COMPLETIONS_PATH
            ),
            api_key: provider.api_key.clone(),
            model: provider.model.clone(),
            timeout,
        }
    }

    async fn send(
        &self,
        messages: &[ChatMessage],
        response_format: Option<ResponseFormat>,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            stream,
            response_format,
        };
        let accept = if stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        tracing::debug!(
            endpoint = %self.endpoint,
            model = %self.model,
            stream,
            messages = messages.len(),
            "[⚙️  -> ☁️ ] chat completion request"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, accept)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => format!("Upstream error (body unreadable): {}", e),
        };
        let message = match serde_json::from_str::<ProviderError>(&text) {
            Ok(err) if !err.error.message.is_empty() => err.error.message,
            _ => text,
        };
        tracing::error!(%status, "[☁️  -> ⚙️ ] Upstream Error: {}", prefix_chars(&message, 500));
        Err(RelayError::Upstream(status, message).into())
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> ObservedError {
    if e.is_timeout() {
        RelayError::Timeout(timeout).into()
    } else {
        RelayError::Network(e).into()
    }
}

fn codec_error(e: AnyDelimiterCodecError, timeout: Duration) -> ObservedError {
    match e {
        AnyDelimiterCodecError::Io(io) => {
            let timed_out = io
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
                .is_some_and(reqwest::Error::is_timeout);
            if timed_out {
                RelayError::Timeout(timeout).into()
            } else {
                RelayError::Io(io).into()
            }
        }
        AnyDelimiterCodecError::MaxChunkLengthExceeded => RelayError::Upstream(
            StatusCode::BAD_GATEWAY,
            format!("stream line longer than {} bytes", MAX_UPSTREAM_LINE_BYTES),
        )
        .into(),
    }
}

/// Decodes one framed line; invalid UTF-8 sequences become U+FFFD.
fn decode_line(raw: &[u8]) -> Cow<'_, str> {
    let line = String::from_utf8_lossy(raw);
    if let Cow::Owned(_) = line {
        tracing::debug!(bytes = raw.len(), "stream line is not valid UTF-8, decoding lossily");
    }
    line
}

impl DeltaSource for OpenAiDeltaSource {
    fn stream_deltas(
        &self,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
    ) -> BoxFuture<'_, Result<DeltaStream>> {
        Box::pin(async move {
            let response = self.send(&messages, response_format, true).await?;
            let timeout = self.timeout;

            let bytes_stream = response
                .bytes_stream()
                .map(|r| r.map_err(std::io::Error::other));
            let lines = FramedRead::new(
                StreamReader::new(bytes_stream),
                AnyDelimiterCodec::new_with_max_length(
                    b"\n".to_vec(),
                    Vec::new(),
                    MAX_UPSTREAM_LINE_BYTES,
                ),
            );

            let deltas = stream::unfold(Some(lines), move |state| async move {
                let mut lines = state?;
                loop {
                    match lines.next().await {
                        None => return None,
                        Some(Ok(raw)) => match parse_delta_line(&decode_line(&raw)) {
                            LineEvent::Delta(text) => return Some((Ok(text), Some(lines))),
                            LineEvent::Done => return None,
                            LineEvent::Skip => continue,
                            LineEvent::Error(message) => {
                                let err = RelayError::Upstream(StatusCode::BAD_GATEWAY, message);
                                return Some((Err(err.into()), None));
                            }
                        },
                        Some(Err(e)) => return Some((Err(codec_error(e, timeout)), None)),
                    }
                }
            });
            Ok(deltas.boxed())
        })
    }

    fn complete_once(
        &self,
        messages: Vec<ChatMessage>,
        response_format: Option<ResponseFormat>,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let response = self.send(&messages, response_format, false).await?;
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(e, self.timeout))?;
            let body: ChatCompletion = serde_json::from_str(&text)?;
            Ok(body.into_content())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_lines_yield_content() {
        assert_eq!(
            parse_delta_line(r#"data: {"choices":[{"delta":{"content":"hi"}}]}"#),
            LineEvent::Delta("hi".into())
        );
        assert_eq!(
            parse_delta_line(r#"data:{"choices":[{"delta":{"content":" there"}}]}"#),
            LineEvent::Delta(" there".into())
        );
    }

    #[test]
    fn done_marker_ends() {
        assert_eq!(parse_delta_line("data: [DONE]"), LineEvent::Done);
        assert_eq!(parse_delta_line("data:[DONE]  "), LineEvent::Done);
    }

    #[test]
    fn non_data_and_malformed_lines_are_skipped() {
        assert_eq!(parse_delta_line(""), LineEvent::Skip);
        assert_eq!(parse_delta_line(": keep-alive"), LineEvent::Skip);
        assert_eq!(parse_delta_line("event: message"), LineEvent::Skip);
        assert_eq!(parse_delta_line("data: {not json"), LineEvent::Skip);
        assert_eq!(
            parse_delta_line(r#"data: {"choices":[{"delta":{"content":""}}]}"#),
            LineEvent::Skip
        );
    }

    #[test]
    fn provider_error_objects_are_reported() {
        assert_eq!(
            parse_delta_line(r#"data: {"error":{"message":"rate limited","code":429}}"#),
            LineEvent::Error("rate limited".into())
        );
    }
}
