use serde::Serialize;
use std::collections::HashSet;

/// `(id, type)` of an envelope already sent downstream this turn.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EmittedRef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Ids emitted during one turn, plus the order they went out in.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    seen: HashSet<String>,
    emitted: Vec<EmittedRef>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `id`; false when it has already been emitted this turn.
    pub fn claim(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    /// Records an envelope that is about to be emitted.
    pub fn record(&mut self, id: &str, kind: &str) {
        self.seen.insert(id.to_string());
        self.emitted.push(EmittedRef {
            id: id.to_string(),
            kind: kind.to_string(),
        });
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }

    /// The last `limit` emitted entries, oldest first.
    pub fn recent(&self, limit: usize) -> &[EmittedRef] {
        let start = self.emitted.len().saturating_sub(limit);
        &self.emitted[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_rejects_repeats() {
        let mut reg = DedupRegistry::new();
        assert!(reg.claim("a"));
        assert!(!reg.claim("a"));
        assert!(reg.claim("b"));
    }

    #[test]
    fn recent_is_bounded_and_ordered() {
        let mut reg = DedupRegistry::new();
        for i in 0..40 {
            reg.record(&format!("id{i}"), "agentToUi/patchNode");
        }
        let recent = reg.recent(30);
        assert_eq!(recent.len(), 30);
        assert_eq!(recent[0].id, "id10");
        assert_eq!(recent[29].id, "id39");
        assert_eq!(reg.emitted_count(), 40);
        assert!(!reg.claim("id0"));
    }
}
