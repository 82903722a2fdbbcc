use std::borrow::Cow;

/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Smallest char boundary at or after `idx` (clamped to `s.len()`).
pub fn ceil_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Keeps roughly the last `keep_bytes` bytes of `s`, cutting on a char boundary.
/// Returns how many bytes were dropped from the front.
pub fn retain_suffix_bytes(s: &mut String, keep_bytes: usize) -> usize {
    if s.len() <= keep_bytes {
        return 0;
    }
    let cut = ceil_char_boundary(s, s.len() - keep_bytes);
    s.drain(..cut);
    cut
}

const REPLACEMENT_ESCAPE: &str = "\\ufffd";

/// Rewrites `\uXXXX` escapes naming an unpaired UTF-16 surrogate to `\ufffd`.
///
/// Escaped backslashes are skipped pairwise, so `\\ud800` is left alone. Every
/// replacement has the same byte length as the escape it replaces, so byte
/// offsets into the result are valid offsets into `s`.
pub fn replace_lone_surrogates(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            i += 1;
            continue;
        }
        let Some(unit) = hex_escape(bytes, i) else {
            i += 2;
            continue;
        };
        match unit {
            0xD800..=0xDBFF if matches!(hex_escape(bytes, i + 6), Some(0xDC00..=0xDFFF)) => {
                i += 12;
            }
            0xD800..=0xDFFF => {
                let out = out.get_or_insert_with(|| String::with_capacity(s.len()));
                out.push_str(&s[copied..i]);
                out.push_str(REPLACEMENT_ESCAPE);
                i += 6;
                copied = i;
            }
            _ => i += 6,
        }
    }
    match out {
        Some(mut out) => {
            out.push_str(&s[copied..]);
            Cow::Owned(out)
        }
        None => Cow::Borrowed(s),
    }
}

fn hex_escape(bytes: &[u8], at: usize) -> Option<u16> {
    let escape = bytes.get(at..at + 6)?;
    if !escape.starts_with(b"\\u") || !escape[2..].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u16::from_str_radix(std::str::from_utf8(&escape[2..]).ok()?, 16).ok()
}
