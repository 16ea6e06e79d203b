//! Auto-approval ceilings and the consecutive-mistake limit

use serde::{Deserialize, Serialize};

use crate::message::UiMessage;
use crate::state::TaskState;
use crate::tool::ApprovalCategory;

/// Slack allowed when comparing accumulated cost with the ceiling
const COST_EPSILON: f64 = 1e-6;

/// Which tool categories run without asking, and for how long
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoApprovalSettings {
    pub enabled: bool,
    pub read_only: bool,
    pub edit: bool,
    pub command: bool,
    pub other: bool,
    /// API requests allowed since the last reset (0 = unlimited)
    pub max_requests: u32,
    /// Spend allowed since the last reset
    pub max_cost: Option<f64>,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            read_only: true,
            edit: false,
            command: false,
            other: false,
            max_requests: 20,
            max_cost: None,
        }
    }
}

impl AutoApprovalSettings {
    /// Whether a tool of this category may run without an explicit ask
    pub fn allows(&self, category: ApprovalCategory) -> bool {
        self.enabled
            && match category {
                ApprovalCategory::ReadOnly => self.read_only,
                ApprovalCategory::Edit => self.edit,
                ApprovalCategory::Command => self.command,
                ApprovalCategory::Other => self.other,
            }
    }
}

/// Result of checking the request and cost ceilings
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitCheck {
    WithinLimits,
    RequestsExceeded { count: u32, max: u32 },
    CostExceeded { cost: f64, max: f64 },
}

impl LimitCheck {
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, Self::WithinLimits)
    }

    /// Prompt shown to the user when a ceiling is hit
    pub fn prompt(&self) -> Option<String> {
        match self {
            Self::WithinLimits => None,
            Self::RequestsExceeded { max, .. } => Some(format!(
                "Auto-approved requests limit reached ({max}). Approve to reset the count and continue."
            )),
            Self::CostExceeded { max, .. } => Some(format!(
                "Auto-approved cost limit reached (${max:.2}). Approve to reset the count and continue."
            )),
        }
    }
}

/// Request/cost ceilings measured from the last reset point
#[derive(Debug, Clone)]
pub struct AutoApprovalGuard {
    settings: AutoApprovalSettings,
    /// Index into the UI message list where counting starts
    reset_index: usize,
}

impl AutoApprovalGuard {
    pub fn new(settings: AutoApprovalSettings) -> Self {
        Self {
            settings,
            reset_index: 0,
        }
    }

    pub fn settings(&self) -> &AutoApprovalSettings {
        &self.settings
    }

    pub fn reset_index(&self) -> usize {
        self.reset_index
    }

    /// Start counting afresh from `index` (the current UI message count)
    pub fn reset(&mut self, index: usize) {
        self.reset_index = index;
    }

    /// Count requests and cost in `messages[reset_index..]` against the ceilings.
    ///
    /// Only relevant while auto-approval is enabled; otherwise every action
    /// is asked for anyway.
    pub fn check_limits(&self, messages: &[UiMessage]) -> LimitCheck {
        if !self.settings.enabled {
            return LimitCheck::WithinLimits;
        }
        let window = messages.get(self.reset_index..).unwrap_or_default();
        let (count, cost) = window
            .iter()
            .filter_map(UiMessage::api_req_info)
            .fold((0u32, 0.0f64), |(n, c), info| {
                (n + 1, c + info.cost.unwrap_or(0.0))
            });

        if self.settings.max_requests > 0 && count >= self.settings.max_requests {
            return LimitCheck::RequestsExceeded {
                count,
                max: self.settings.max_requests,
            };
        }
        if let Some(max) = self.settings.max_cost {
            if cost > max + COST_EPSILON {
                return LimitCheck::CostExceeded { cost, max };
            }
        }
        LimitCheck::WithinLimits
    }
}

/// Consecutive-mistake ceiling
#[derive(Debug, Clone, Copy)]
pub struct MistakeLimit {
    limit: u32,
}

impl MistakeLimit {
    /// `0` disables the limit
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }

    /// Count a failed attempt. Failures on a still-streaming block are not
    /// counted; the final attempt is. Returns whether the counter moved.
    pub fn record_failure(&self, state: &mut TaskState, partial: bool) -> bool {
        if partial {
            return false;
        }
        state.consecutive_mistake_count += 1;
        tracing::debug!(count = state.consecutive_mistake_count, "mistake recorded");
        true
    }

    /// Reset after a fully successful operation
    pub fn record_success(&self, state: &mut TaskState) {
        state.consecutive_mistake_count = 0;
    }

    pub fn is_reached(&self, state: &TaskState) -> bool {
        self.limit > 0 && state.consecutive_mistake_count >= self.limit
    }
}
