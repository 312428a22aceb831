//! Workflow policy parameters
//!
//! The tunables the engine consults: consent windows, the recognized grade
//! range, the screening SLA, and the required checklist per closure type.
//! Plain data with defaults; the hosting application decides where the
//! numbers come from.

use crate::case::ClosureType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowPolicy {
    /// Days a Pending consent waits before auto-resolving to Granted.
    pub auto_consent_window_days: i64,
    /// Validity period stamped onto a consent when it becomes Granted.
    pub consent_valid_days: i64,
    /// Recognized grade range, inclusive. Kindergarten is 0.
    pub grade_min: i32,
    pub grade_max: i32,
    /// Days an InProgress screening may sit before it counts as overdue.
    pub screening_sla_days: i64,
}

impl Default for WorkflowPolicy {
    fn default() -> Self {
        Self {
            auto_consent_window_days: 7,
            consent_valid_days: 365,
            grade_min: 0,
            grade_max: 12,
            screening_sla_days: 30,
        }
    }
}

/// Required checklist items per closure type. Finalization is gated on every
/// listed item being checked.
pub fn closure_checklist(closure_type: ClosureType) -> &'static [&'static str] {
    match closure_type {
        ClosureType::Success => &["final_report_filed", "goals_met", "guardian_notified"],
        ClosureType::Transfer => &[
            "guardian_notified",
            "receiving_provider_confirmed",
            "records_transferred",
        ],
        ClosureType::Discontinue => &["discontinue_reason_documented", "guardian_notified"],
    }
}

/// Parse a raw grade field into the numeric scale. `"K"` is kindergarten.
pub fn parse_grade(raw: &str) -> Option<i32> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("k") {
        return Some(0);
    }
    trimmed.parse::<i32>().ok()
}
