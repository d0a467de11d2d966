//! Two-phase pointer interaction: a press is held pending until a release
//! arrives, and only a release on the same electrode within the press timeout
//! counts as a click.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

fn default_press_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressConfig {
    /// A release later than this after the press cancels the click.
    #[serde(default = "default_press_timeout_ms")]
    pub press_timeout_ms: u64,
}

impl Default for PressConfig {
    fn default() -> Self {
        Self {
            press_timeout_ms: default_press_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerButton {
    Primary,
    Secondary,
    Auxiliary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    /// Select the clicked electrode as well as toggling it.
    pub shift: bool,
    /// Held presses are left to other tools.
    pub alt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PressOutcome {
    Pending,
    Ignored,
    /// Non-primary button; forwarded as a notification, never toggles.
    SecondaryClick { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPress {
    pub target: String,
    pub select: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    TargetMismatch,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Resolved(ResolvedPress),
    Cancelled(CancelReason),
    /// No press was pending.
    Idle,
}

#[derive(Debug, Clone)]
struct PendingPress {
    target: String,
    modifiers: Modifiers,
    at: Instant,
}

#[derive(Debug, Clone)]
pub struct PressTracker {
    cfg: PressConfig,
    enabled: bool,
    pending: Option<PendingPress>,
}

impl Default for PressTracker {
    fn default() -> Self {
        Self::new(PressConfig::default())
    }
}

impl PressTracker {
    pub fn new(cfg: PressConfig) -> Self {
        Self {
            cfg,
            enabled: true,
            pending: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.pending = None;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// A new press replaces any press still pending.
    pub fn press(
        &mut self,
        target: &str,
        button: PointerButton,
        modifiers: Modifiers,
        at: Instant,
    ) -> PressOutcome {
        if !self.enabled {
            return PressOutcome::Ignored;
        }
        if button != PointerButton::Primary {
            self.pending = None;
            return PressOutcome::SecondaryClick {
                target: target.to_string(),
            };
        }
        if modifiers.alt {
            return PressOutcome::Ignored;
        }
        self.pending = Some(PendingPress {
            target: target.to_string(),
            modifiers,
            at,
        });
        PressOutcome::Pending
    }

    pub fn release(&mut self, target: &str, at: Instant) -> ReleaseOutcome {
        let Some(p) = self.pending.take() else {
            return ReleaseOutcome::Idle;
        };
        if at.saturating_duration_since(p.at) > Duration::from_millis(self.cfg.press_timeout_ms) {
            return ReleaseOutcome::Cancelled(CancelReason::TimedOut);
        }
        if p.target != target {
            return ReleaseOutcome::Cancelled(CancelReason::TargetMismatch);
        }
        ReleaseOutcome::Resolved(ResolvedPress {
            target: p.target,
            select: p.modifiers.shift,
        })
    }

    /// Pointer entered `target`; leaving the pressed electrode ends the press.
    pub fn hover(&mut self, target: &str) -> Option<ReleaseOutcome> {
        match &self.pending {
            Some(p) if p.target != target => {
                self.pending = None;
                Some(ReleaseOutcome::Cancelled(CancelReason::TargetMismatch))
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self) -> ReleaseOutcome {
        match self.pending.take() {
            Some(_) => ReleaseOutcome::Cancelled(CancelReason::Aborted),
            None => ReleaseOutcome::Idle,
        }
    }
}
