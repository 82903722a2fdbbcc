use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{
    PHASE_MSG_CONTENT, PHASE_MSG_DRAFTING, PHASE_MSG_TEMPLATE, TYPE_CHAT_MESSAGE,
    TYPE_COMPONENT_TEMPLATE, TYPE_TEXT,
};
use crate::envelope::Envelope;

/// Coarse task progress reported to the editor through `agentToUi/taskStatus`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Started,
    Streaming,
    Writing,
    Template,
    Repair,
    RepairWarning,
    Error,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Streaming => "streaming",
            Self::Writing => "writing",
            Self::Template => "template",
            Self::Repair => "repair",
            Self::RepairWarning => "repair_warning",
            Self::Error => "error",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Phase (and narration) implied by emitting an envelope of type `kind`.
    pub fn for_envelope_type(kind: &str) -> (Self, &'static str) {
        match kind {
            TYPE_TEXT | TYPE_CHAT_MESSAGE => (Self::Writing, PHASE_MSG_DRAFTING),
            TYPE_COMPONENT_TEMPLATE => (Self::Template, PHASE_MSG_TEMPLATE),
            _ => (Self::Writing, PHASE_MSG_CONTENT),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emits a status envelope only when the phase actually changes.
#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: Option<Phase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    pub fn advance(&mut self, phase: Phase, message: Option<&str>) -> Option<Envelope> {
        if self.current == Some(phase) {
            return None;
        }
        if let Some(current) = self.current {
            if current.is_terminal() {
                tracing::debug!(%current, ignored = %phase, "phase already terminal");
                return None;
            }
        }
        self.current = Some(phase);
        Some(Envelope::task_status(phase, message))
    }
}
