use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub const RELAY_TURN_ID_HEADER: &str = "x-relay-turn-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with a fresh turn id: a `request` span field and a response header.
pub async fn turn_id_middleware(req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!(
        "request",
        turn_id = %turn_id,
        method = %req.method(),
        path = %req.uri().path()
    );

    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&turn_id) {
        response.headers_mut().insert(RELAY_TURN_ID_HEADER, val);
    }
    response
}

/// Counters for one streamed turn, logged once when the turn ends.
#[derive(Debug, Default)]
pub struct TurnMetric {
    pub deltas: usize,
    pub delta_chars: usize,
    pub envelopes: usize,
    pub statuses: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub repair_attempted: bool,
    pub repair_deltas: usize,
}

impl TurnMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_delta(&mut self, delta: &str) {
        self.deltas += 1;
        self.delta_chars += delta.chars().count();
    }

    pub fn log_summary(&self, outcome: &str, discarded_bytes: usize) {
        info!(
            target: "flight_recorder",
            "[TURN END] Outcome: {} | Deltas: {} ({} chars) | Envelopes: {} | Statuses: {} | Dupes: {} | Rejected: {} | Discarded: {} bytes | Repair: {} ({} deltas)",
            outcome,
            self.deltas,
            self.delta_chars,
            self.envelopes,
            self.statuses,
            self.duplicates,
            self.rejected,
            discarded_bytes,
            self.repair_attempted,
            self.repair_deltas
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_chars_count_characters() {
        let mut metric = TurnMetric::new();
        metric.record_delta("héllo");
        metric.record_delta("{}");
        assert_eq!(metric.deltas, 2);
        assert_eq!(metric.delta_chars, 7);
    }
}
