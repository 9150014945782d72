use rv_ipc::ExtensionMessage;

/// Events that request a highlight pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Load,
    DomMutation,
    Navigation,
    Message(ExtensionMessage),
}

/// Coalesces triggers into at most one pending pass.
///
/// Any number of triggers between two frames collapse into one pass. A
/// trigger that arrives while a pass runs schedules exactly one follow-up.
#[derive(Debug, Default)]
pub struct RecomputeScheduler {
    pending: bool,
    coalesced: u64,
}

impl RecomputeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this trigger scheduled a new pass.
    pub fn trigger(&mut self, _trigger: Trigger) -> bool {
        if self.pending {
            self.coalesced += 1;
            return false;
        }
        self.pending = true;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Claims the pending pass. The slot is cleared before the pass runs.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    /// Triggers absorbed by an already pending pass.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }
}
