//! Key triggers and the pending-trigger inbox
//!
//! The host posts a named trigger with an expiry. Triggers wait in the inbox
//! until the event loop drains it; a trigger still there after its expiry is
//! dropped without effect, and posting the same trigger again before it is
//! drained only refreshes the one already waiting.

use crate::error::EventError;
use crate::lighting::LightingAction;
use log::debug;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// What a key trigger asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerAction {
    /// Force the 2.35 lens preset
    SetScope,
    /// Force the 1.85 lens preset
    SetFlat,
    /// Offer the override menu for the playing title
    ShowMenu,
    Lighting(LightingAction),
}

const TRIGGER_NAMES: &[(&str, TriggerAction)] = &[
    ("aspectratiochanger-set235", TriggerAction::SetScope),
    ("aspectratiochanger-set185", TriggerAction::SetFlat),
    ("aspectratiochanger-showmenu", TriggerAction::ShowMenu),
    ("insteon-allon", TriggerAction::Lighting(LightingAction::AllOn)),
    ("insteon-alldim", TriggerAction::Lighting(LightingAction::AllDim)),
    ("insteon-allbrighter", TriggerAction::Lighting(LightingAction::Brighter)),
    ("insteon-alldimmer", TriggerAction::Lighting(LightingAction::Dimmer)),
];

impl TriggerAction {
    pub fn name(&self) -> &'static str {
        TRIGGER_NAMES
            .iter()
            .find(|(_, action)| action == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }
}

impl FromStr for TriggerAction {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        TRIGGER_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, action)| *action)
            .ok_or_else(|| EventError::UnknownTrigger(s.to_string()))
    }
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PendingTrigger {
    pub action: TriggerAction,
    pub expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct TriggerInbox {
    pending: Vec<PendingTrigger>,
}

impl TriggerInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Post a trigger. A waiting trigger for the same action is replaced.
    pub fn post(&mut self, action: TriggerAction, expiry: Duration, now: Instant) {
        if let Some(pos) = self.pending.iter().position(|p| p.action == action) {
            debug!("Coalescing repeated {}", action);
            self.pending.remove(pos);
        }
        self.pending.push(PendingTrigger {
            action,
            expires_at: now + expiry,
        });
    }

    /// Take every live trigger in posting order; expired ones are dropped
    pub fn drain(&mut self, now: Instant) -> Vec<TriggerAction> {
        self.pending
            .drain(..)
            .filter_map(|p| {
                if p.expires_at > now {
                    Some(p.action)
                } else {
                    debug!(
                        "Dropping {} expired {:?} ago",
                        p.action,
                        now.duration_since(p.expires_at)
                    );
                    None
                }
            })
            .collect()
    }
}
