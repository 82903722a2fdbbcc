//! Output sink and SSE transport for streamed turns.

use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::constants::{KEEPALIVE_INTERVAL_SECS, TURN_CHANNEL_CAPACITY};
use crate::envelope::Envelope;
use crate::types::*;

pub const EVENT_MSG: &str = "msg";
pub const EVENT_DONE: &str = "done";

/// One item on the ordered downstream channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Msg(Envelope),
    Done,
}

impl TurnEvent {
    pub fn into_event(self) -> std::result::Result<Event, axum::Error> {
        match self {
            Self::Msg(envelope) => Event::default().event(EVENT_MSG).json_data(envelope),
            Self::Done => Ok(Event::default().event(EVENT_DONE).data("{}")),
        }
    }
}

/// Writer half of a turn's output channel.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl OutputSink {
    pub fn channel() -> (Self, mpsc::Receiver<TurnEvent>) {
        Self::with_capacity(TURN_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn send(&self, event: TurnEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::ClientDisconnected.into())
    }

    pub async fn emit(&self, envelope: Envelope) -> Result<()> {
        self.send(TurnEvent::Msg(envelope)).await
    }

    pub async fn done(&self) -> Result<()> {
        self.send(TurnEvent::Done).await
    }

    /// Resolves once the reader (the client connection) has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Wraps a stream of turn events into an SSE response with caching and proxy buffering off.
pub fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = TurnEvent> + Send + 'static,
{
    let sse = Sse::new(events.map(TurnEvent::into_event)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
            .text("keepalive"),
    );
    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

/// SSE response draining a turn's output channel.
pub fn channel_response(rx: mpsc::Receiver<TurnEvent>) -> Response {
    sse_response(ReceiverStream::new(rx))
}

/// SSE response that carries one error envelope and ends.
pub fn error_response(envelope: Envelope) -> Response {
    sse_response(futures_util::stream::iter([
        TurnEvent::Msg(envelope),
        TurnEvent::Done,
    ]))
}
