use serde_json::{Map, Value};
use std::borrow::Cow;

use crate::constants::{ARRAY_BUFFER_CEILING, ARRAY_BUFFER_KEEP, ENVELOPES_KEY};
use crate::str_utils::{ceil_char_boundary, replace_lone_surrogates, retain_suffix_bytes};

/// Scanner for `{"envelopes":[{...},{...}]}` streamed token by token.
///
/// Objects inside the array are yielded as soon as their closing brace arrives.
/// The buffer is compacted after every decoded object, so it only ever holds
/// the unconsumed tail of the array.
#[derive(Debug, Default)]
pub struct ArrayScanner {
    buf: String,
    /// Where the next search for the `"envelopes"` key starts.
    search_pos: usize,
    array_open: bool,
    scan_pos: usize,
    in_string: bool,
    escape: bool,
    depth: usize,
    obj_start: Option<usize>,
    /// Start of a span that already failed to decode once.
    failed_start: Option<usize>,
    finished: bool,
    evicted_bytes: usize,
    skipped_objects: usize,
}

impl ArrayScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every object completed by it, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<Map<String, Value>> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buf.push_str(chunk);
        if !self.array_open && !self.locate_array() {
            return out;
        }
        self.scan(&mut out);
        out
    }

    /// Finds `"envelopes"` followed by `[`; bounds the buffer while waiting.
    fn locate_array(&mut self) -> bool {
        let from = ceil_char_boundary(&self.buf, self.search_pos);
        let Some(rel) = self.buf[from..].find(ENVELOPES_KEY) else {
            if self.buf.len() > ARRAY_BUFFER_CEILING {
                let dropped = retain_suffix_bytes(&mut self.buf, ARRAY_BUFFER_KEEP);
                self.evicted_bytes += dropped;
                tracing::warn!(
                    dropped,
                    evicted_total = self.evicted_bytes,
                    "envelopes key not seen before buffer ceiling, evicting oldest text"
                );
            }
            // The key may straddle the next chunk boundary.
            self.search_pos = self.buf.len().saturating_sub(ENVELOPES_KEY.len() - 1);
            return false;
        };
        let key_at = from + rel;
        match self.buf[key_at..].find('[') {
            Some(b) => {
                self.array_open = true;
                self.scan_pos = key_at + b + 1;
                true
            }
            None => {
                self.search_pos = key_at;
                false
            }
        }
    }

    fn reset_scan(&mut self) {
        self.scan_pos = 0;
        self.in_string = false;
        self.escape = false;
        self.depth = 0;
        self.obj_start = None;
    }

    fn scan(&mut self, out: &mut Vec<Map<String, Value>>) {
        let mut i = self.scan_pos;
        while i < self.buf.len() {
            let ch = self.buf.as_bytes()[i];
            if self.in_string {
                if self.escape {
                    self.escape = false;
                } else if ch == b'\\' {
                    self.escape = true;
                } else if ch == b'"' {
                    self.in_string = false;
                }
                i += 1;
                continue;
            }
            match ch {
                b'"' => self.in_string = true,
                b'{' => {
                    if self.depth == 0 {
                        self.obj_start = Some(i);
                    }
                    self.depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if let Some(start) = self.obj_start.take() {
                            match decode_element(&self.buf[start..=i]) {
                                Ok(value) => {
                                    if let Value::Object(map) = value {
                                        out.push(map);
                                    } else {
                                        tracing::debug!("non-object array element dropped");
                                    }
                                    self.buf.drain(..=i);
                                    self.failed_start = None;
                                    self.reset_scan();
                                    i = 0;
                                    continue;
                                }
                                Err(e) if self.failed_start == Some(start) => {
                                    // Same span failed again; more data cannot change it.
                                    tracing::warn!(error = %e, "skipping malformed array element");
                                    self.skipped_objects += 1;
                                    self.buf.drain(..=i);
                                    self.failed_start = None;
                                    self.reset_scan();
                                    i = 0;
                                    continue;
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "array element not decodable yet");
                                    self.failed_start = Some(start);
                                    self.scan_pos = start;
                                    self.depth = 0;
                                    self.in_string = false;
                                    self.escape = false;
                                    return;
                                }
                            }
                        }
                    }
                }
                b']' if self.depth == 0 => {
                    self.finished = true;
                    self.scan_pos = i;
                    return;
                }
                _ => {}
            }
            i += 1;
        }
        self.scan_pos = i;
    }

    /// True once the `"envelopes"` array has been located.
    pub fn array_found(&self) -> bool {
        self.array_open
    }

    /// True once the closing `]` of the array has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Unconsumed buffered text.
    pub fn residue(&self) -> &str {
        &self.buf
    }

    pub fn evicted_bytes(&self) -> usize {
        self.evicted_bytes
    }

    pub fn skipped_objects(&self) -> usize {
        self.skipped_objects
    }
}

fn decode_element(span: &str) -> serde_json::Result<Value> {
    match serde_json::from_str(span) {
        Err(e) if e.is_syntax() => match replace_lone_surrogates(span) {
            Cow::Owned(cleaned) => serde_json::from_str(&cleaned).map_err(|_| e),
            Cow::Borrowed(_) => Err(e),
        },
        decoded => decoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DOC: &str = r#"{"envelopes":[{"schemaVersion":1,"type":"agentToUi/chatMessage","id":"a","createdAt":"t","payload":{"content":"brace } and \" quote"}},{"type":"agentToUi/componentTemplate","payload":{"template":{"nodes":[1,2]}}}]}"#;

    fn ids_and_types(objs: &[Map<String, Value>]) -> Vec<(Option<String>, String)> {
        objs.iter()
            .map(|o| {
                (
                    o.get("id").and_then(Value::as_str).map(str::to_owned),
                    o.get("type").and_then(Value::as_str).unwrap_or_default().to_owned(),
                )
            })
            .collect()
    }

    #[test]
    fn one_shot_yields_both_objects() {
        let mut scanner = ArrayScanner::new();
        let objs = scanner.feed(DOC);
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0]["payload"]["content"], json!("brace } and \" quote"));
        assert!(scanner.is_finished());
        assert_eq!(scanner.residue(), "]}");
    }

    #[test]
    fn every_split_point_matches_one_shot() {
        let expected = ids_and_types(&ArrayScanner::new().feed(DOC));
        for cut in 0..=DOC.len() {
            if !DOC.is_char_boundary(cut) {
                continue;
            }
            let mut scanner = ArrayScanner::new();
            let mut objs = scanner.feed(&DOC[..cut]);
            objs.extend(scanner.feed(&DOC[cut..]));
            assert_eq!(ids_and_types(&objs), expected, "split at byte {cut}");
        }
    }

    #[test]
    fn byte_at_a_time_matches_one_shot() {
        let expected = ids_and_types(&ArrayScanner::new().feed(DOC));
        let mut scanner = ArrayScanner::new();
        let mut objs = Vec::new();
        for ch in DOC.chars() {
            objs.extend(scanner.feed(&ch.to_string()));
        }
        assert_eq!(ids_and_types(&objs), expected);
    }

    #[test]
    fn nothing_before_key_and_bracket() {
        let mut scanner = ArrayScanner::new();
        assert!(scanner.feed(r#"{"note":{"x":1},"envel"#).is_empty());
        assert!(!scanner.array_found());
        assert!(scanner.feed(r#"opes" : "#).is_empty());
        assert!(!scanner.array_found());
        let objs = scanner.feed(r#"[{"type":"agentToUi/text","payload":{}}]}"#);
        assert!(scanner.array_found());
        assert_eq!(objs.len(), 1);
    }

    #[test]
    fn stops_at_top_level_array_end() {
        let mut scanner = ArrayScanner::new();
        let objs = scanner.feed(r#"{"envelopes":[{"type":"a","payload":[1]}], "later":[{"type":"b","payload":{}}]}"#);
        assert_eq!(objs.len(), 1);
        assert!(scanner.is_finished());
        assert!(scanner.feed(r#"{"type":"c","payload":{}}"#).is_empty());
    }

    #[test]
    fn malformed_element_is_skipped_after_retry() {
        let mut scanner = ArrayScanner::new();
        assert!(scanner.feed(r#"{"envelopes":[{"type": }"#).is_empty());
        let objs = scanner.feed(r#",{"type":"ok","payload":{}}]}"#);
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0]["type"], "ok");
        assert_eq!(scanner.skipped_objects(), 1);
    }

    #[test]
    fn evicts_when_key_never_arrives() {
        let mut scanner = ArrayScanner::new();
        let filler = "x".repeat(ARRAY_BUFFER_CEILING + 10);
        assert!(scanner.feed(&filler).is_empty());
        assert_eq!(scanner.residue().len(), ARRAY_BUFFER_KEEP);
        assert_eq!(scanner.evicted_bytes(), ARRAY_BUFFER_CEILING + 10 - ARRAY_BUFFER_KEEP);

        let objs = scanner.feed(r#"{"envelopes":[{"type":"late","payload":1}]}"#);
        assert_eq!(objs.len(), 1);
    }

    #[test]
    fn unpaired_surrogate_escape_is_decoded_not_skipped() {
        let mut scanner = ArrayScanner::new();
        let objs = scanner.feed(
            r#"{"envelopes":[{"type":"agentToUi/chatMessage","payload":{"content":"x\ud83d"}},{"type":"ok","payload":{}}]}"#,
        );
        assert_eq!(objs.len(), 2);
        assert_eq!(objs[0]["payload"]["content"], json!("x\u{fffd}"));
        assert_eq!(scanner.skipped_objects(), 0);
    }

    #[test]
    fn text_after_array_end_is_not_buffered() {
        let mut scanner = ArrayScanner::new();
        assert!(scanner.feed(r#"{"envelopes":[]}"#).is_empty());
        assert!(scanner.is_finished());
        let residue = scanner.residue().len();
        for _ in 0..100 {
            assert!(scanner.feed(&"trailing chatter ".repeat(100)).is_empty());
        }
        assert_eq!(scanner.residue().len(), residue);
    }
}
