use crate::transport::ParseIssue;

pub const FAILURE_NO_TOOLS: &str = "no_tools";
pub const FAILURE_FINAL_REPORT_MISSING: &str = "final_report_missing";
pub const FAILURE_FINAL_REPORT_INVALID: &str = "final_report_invalid";
pub const FAILURE_UNKNOWN_TOOL: &str = "unknown_tool";
pub const FAILURE_FINAL_TURN_NO_REPORT: &str = "final_turn_no_report";
pub const FAILURE_EMPTY_OUTPUT: &str = "empty_output";
pub const FAILURE_UNEXPECTED_STOP_REASON: &str = "unexpected_stop_reason";

/// Priority only influences which failures are surfaced to the model in the
/// corrective message, never whether the turn is retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailurePriority {
    Normal,
    High,
    Critical,
}

/// One named reason a turn could not be accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnFailure {
    pub slug: String,
    pub priority: FailurePriority,
    pub detail: String,
    /// Fatal failures terminate the session instead of retrying.
    pub fatal: bool,
}

impl TurnFailure {
    pub fn new(
        slug: impl Into<String>,
        priority: FailurePriority,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            slug: slug.into(),
            priority,
            detail: detail.into(),
            fatal: false,
        }
    }

    pub fn fatal(
        slug: impl Into<String>,
        priority: FailurePriority,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            fatal: true,
            ..Self::new(slug, priority, detail)
        }
    }

    /// Parse issues surface as retryable turn failures at normal priority.
    pub fn from_issue(issue: &ParseIssue) -> Self {
        Self::new(issue.slug, FailurePriority::Normal, issue.detail.clone())
    }
}

/// Pick the failures worth telling the model about: top two by priority,
/// stable within a priority, deduplicated by slug.
pub fn select_corrective(failures: &[TurnFailure]) -> Vec<TurnFailure> {
    let mut ordered: Vec<&TurnFailure> = failures.iter().collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut selected: Vec<TurnFailure> = Vec::new();
    for failure in ordered {
        if selected.iter().any(|chosen| chosen.slug == failure.slug) {
            continue;
        }
        selected.push(failure.clone());
        if selected.len() == 2 {
            break;
        }
    }
    selected
}

/// Corrective guidance appended as a user message before the retry attempt.
pub fn corrective_message(failures: &[TurnFailure]) -> String {
    let selected = select_corrective(failures);
    let mut out = String::from(
        "Your previous response could not be accepted for the following reasons:\n",
    );
    for failure in &selected {
        out.push_str(&format!("- [{}] {}\n", failure.slug, failure.detail));
    }
    out.push_str("Correct these problems and respond again.");
    out
}
