/// Silence from the hub longer than this puts the node in standalone mode.
pub const STANDALONE_AFTER_MS: u64 = 300_000;
pub const EVALUATE_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeChange {
    EnteredStandalone,
    Reconnected,
}

/// Tracks when the central hub last talked to this node.
#[derive(Debug, Clone)]
pub struct HubContact {
    last_contact_ms: u64,
    standalone: bool,
}

impl HubContact {
    /// Startup counts as contact so a fresh node is not standalone.
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_contact_ms: now_ms,
            standalone: false,
        }
    }

    pub fn last_contact_ms(&self) -> u64 {
        self.last_contact_ms
    }

    pub fn record_contact(&mut self, now_ms: u64) -> Option<ModeChange> {
        self.last_contact_ms = self.last_contact_ms.max(now_ms);
        if self.standalone {
            self.standalone = false;
            Some(ModeChange::Reconnected)
        } else {
            None
        }
    }

    /// Mode as of the last `evaluate`; contact clears it immediately.
    pub fn standalone(&self) -> bool {
        self.standalone
    }

    pub fn is_standalone(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_contact_ms) > STANDALONE_AFTER_MS
    }

    /// Periodic check; reports a change only on the tick that crosses the threshold.
    pub fn evaluate(&mut self, now_ms: u64) -> Option<ModeChange> {
        let standalone = self.is_standalone(now_ms);
        if standalone == self.standalone {
            return None;
        }
        self.standalone = standalone;
        Some(if standalone {
            ModeChange::EnteredStandalone
        } else {
            ModeChange::Reconnected
        })
    }
}
