use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::constants::{DISCARD_PREVIEW_CHARS, LINE_BUFFER_CEILING};
use crate::str_utils::{prefix_chars, replace_lone_surrogates};

/// Scanner for newline-delimited envelopes.
///
/// Prose the model leaks between objects is discarded (a bounded preview is kept
/// for diagnostics). An object that does not decode yet stays at the head of the
/// buffer until more text arrives.
#[derive(Debug, Default)]
pub struct LineScanner {
    buf: String,
    discarded_preview: Option<String>,
    flushed_due_to_size: bool,
    discarded_bytes: usize,
}

impl LineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<Map<String, Value>> {
        self.buf.push_str(chunk);
        self.drain()
    }

    /// Cuts as many complete objects off the head of the buffer as possible.
    pub fn drain(&mut self) -> Vec<Map<String, Value>> {
        let mut out = Vec::new();
        loop {
            let ws = self.buf.len() - self.buf.trim_start().len();
            self.buf.drain(..ws);
            if self.buf.is_empty() {
                return out;
            }

            if !self.buf.starts_with('{') {
                match self.buf.find('{') {
                    Some(brace) => {
                        self.discard_prefix(brace);
                        continue;
                    }
                    None => {
                        if self.buf.len() > LINE_BUFFER_CEILING {
                            tracing::warn!(
                                bytes = self.buf.len(),
                                "no object start within ceiling, flushing buffer"
                            );
                            self.discard_prefix(self.buf.len());
                            self.flushed_due_to_size = true;
                        }
                        return out;
                    }
                }
            }

            let Some((obj, end)) = decode_head(&self.buf) else {
                return out;
            };
            self.buf.drain(..end);
            out.push(obj);
        }
    }

    fn discard_prefix(&mut self, end: usize) {
        let dropped = &self.buf[..end];
        tracing::debug!(bytes = end, "discarding text outside any object");
        self.discarded_preview = Some(prefix_chars(dropped, DISCARD_PREVIEW_CHARS).to_string());
        self.discarded_bytes += end;
        self.buf.drain(..end);
    }

    /// Buffered text that has not decoded, trimmed.
    pub fn residue(&self) -> &str {
        self.buf.trim()
    }

    /// Drops buffered text; discard diagnostics are kept.
    pub fn reset_buffer(&mut self) {
        self.buf.clear();
    }

    pub fn discarded_preview(&self) -> Option<&str> {
        self.discarded_preview.as_deref()
    }

    pub fn flushed_due_to_size(&self) -> bool {
        self.flushed_due_to_size
    }

    pub fn discarded_bytes(&self) -> usize {
        self.discarded_bytes
    }
}

/// First object at the head of `text` and the byte offset where it ends.
fn decode_head(text: &str) -> Option<(Map<String, Value>, usize)> {
    let mut stream = serde_json::Deserializer::from_str(text).into_iter::<Map<String, Value>>();
    match stream.next() {
        Some(Ok(value)) => Some((value, stream.byte_offset())),
        Some(Err(e)) if e.is_syntax() => {
            let Cow::Owned(cleaned) = replace_lone_surrogates(text) else {
                return None;
            };
            // Replacement escapes keep their length, so the offset maps back onto `text`.
            let mut stream =
                serde_json::Deserializer::from_str(&cleaned).into_iter::<Map<String, Value>>();
            match stream.next() {
                Some(Ok(value)) => {
                    tracing::debug!("decoded object after replacing unpaired surrogate escapes");
                    Some((value, stream.byte_offset()))
                }
                _ => None,
            }
        }
        _ => None,
    }
}
