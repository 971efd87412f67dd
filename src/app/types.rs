use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }

    /// Sort key for display and widget ordering, most severe first.
    pub fn rank(self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    pub fn penalty(self) -> u32 {
        match self {
            Severity::Critical => 10,
            Severity::High => 5,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    MissingTitle,
    ShortTitle,
    LongTitle,
    MissingDescription,
    ShortDescription,
    LongDescription,
    MissingH1,
    MultipleH1,
    MissingCanonical,
    MultipleCanonical,
    MissingAltText,
    Noindex,
}

impl IssueType {
    pub const ALL: [IssueType; 12] = [
        IssueType::MissingTitle,
        IssueType::ShortTitle,
        IssueType::LongTitle,
        IssueType::MissingDescription,
        IssueType::ShortDescription,
        IssueType::LongDescription,
        IssueType::MissingH1,
        IssueType::MultipleH1,
        IssueType::MissingCanonical,
        IssueType::MultipleCanonical,
        IssueType::MissingAltText,
        IssueType::Noindex,
    ];

    pub fn label(self) -> &'static str {
        match self {
            IssueType::MissingTitle => "missing_title",
            IssueType::ShortTitle => "short_title",
            IssueType::LongTitle => "long_title",
            IssueType::MissingDescription => "missing_description",
            IssueType::ShortDescription => "short_description",
            IssueType::LongDescription => "long_description",
            IssueType::MissingH1 => "missing_h1",
            IssueType::MultipleH1 => "multiple_h1",
            IssueType::MissingCanonical => "missing_canonical",
            IssueType::MultipleCanonical => "multiple_canonical",
            IssueType::MissingAltText => "missing_alt_text",
            IssueType::Noindex => "noindex",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        Self::ALL.into_iter().find(|kind| kind.label() == label)
    }

    pub fn severity(self) -> Severity {
        match self {
            IssueType::MissingTitle => Severity::Critical,
            IssueType::ShortTitle => Severity::High,
            IssueType::LongTitle => Severity::Medium,
            IssueType::MissingDescription => Severity::High,
            IssueType::ShortDescription => Severity::Medium,
            IssueType::LongDescription => Severity::Medium,
            IssueType::MissingH1 => Severity::Critical,
            IssueType::MultipleH1 => Severity::High,
            IssueType::MissingCanonical => Severity::Medium,
            IssueType::MultipleCanonical => Severity::High,
            IssueType::MissingAltText => Severity::High,
            IssueType::Noindex => Severity::Critical,
        }
    }

    /// Whether a single safe patch exists for this defect. Multi-element
    /// defects are never fixable: there is no unambiguous element to remove.
    pub fn fixable(self) -> bool {
        !matches!(
            self,
            IssueType::ShortTitle
                | IssueType::ShortDescription
                | IssueType::MultipleH1
                | IssueType::MultipleCanonical
        )
    }

    pub fn title(self) -> &'static str {
        match self {
            IssueType::MissingTitle => "Missing page title",
            IssueType::ShortTitle => "Title too short",
            IssueType::LongTitle => "Title too long",
            IssueType::MissingDescription => "Missing meta description",
            IssueType::ShortDescription => "Meta description too short",
            IssueType::LongDescription => "Meta description too long",
            IssueType::MissingH1 => "Missing H1 heading",
            IssueType::MultipleH1 => "Multiple H1 headings",
            IssueType::MissingCanonical => "Missing canonical link",
            IssueType::MultipleCanonical => "Multiple canonical links",
            IssueType::MissingAltText => "Images missing alt text",
            IssueType::Noindex => "Page blocked from indexing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Crawling,
    Scanning,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn label(self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Crawling => "crawling",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "queued" => Some(ScanStatus::Queued),
            "crawling" => Some(ScanStatus::Crawling),
            "scanning" => Some(ScanStatus::Scanning),
            "completed" => Some(ScanStatus::Completed),
            "failed" => Some(ScanStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, ScanStatus::Crawling | ScanStatus::Scanning)
    }

    /// Forward-only transitions; no state is ever re-entered.
    pub fn can_transition_to(self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Queued, ScanStatus::Crawling)
                | (ScanStatus::Crawling, ScanStatus::Scanning)
                | (ScanStatus::Scanning, ScanStatus::Completed)
                | (ScanStatus::Crawling, ScanStatus::Failed)
                | (ScanStatus::Scanning, ScanStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStatus {
    Pending,
    Applied,
}

impl FixStatus {
    pub fn label(self) -> &'static str {
        match self {
            FixStatus::Pending => "pending",
            FixStatus::Applied => "applied",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "pending" => Some(FixStatus::Pending),
            "applied" => Some(FixStatus::Applied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Success,
    NoChanges,
}

impl VerificationStatus {
    pub fn label(self) -> &'static str {
        match self {
            VerificationStatus::Success => "success",
            VerificationStatus::NoChanges => "no_changes",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "success" => Some(VerificationStatus::Success),
            "no_changes" => Some(VerificationStatus::NoChanges),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scan {
    pub id: String,
    pub account_id: String,
    pub target_url: String,
    pub domain: String,
    pub status: ScanStatus,
    pub max_pages: usize,
    pub pages_visited: usize,
    pub score: Option<u8>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A defect as produced by the detector, before it belongs to a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedIssue {
    pub page_url: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub current_value: Option<String>,
    pub fixable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub scan_id: String,
    pub page_url: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub current_value: Option<String>,
    pub fixable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub id: String,
    pub issue_id: String,
    pub scan_id: String,
    pub patch: String,
    pub status: FixStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

/// An applied fix joined with the issue it remedies, as read by the widget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedFix {
    pub fix_id: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub page_url: String,
    pub patch: String,
    pub applied_at: DateTime<Utc>,
}

/// SEO-visible DOM fields captured before and after the widget runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomSnapshot {
    pub title: String,
    pub meta_description: String,
    pub h1_count: usize,
    pub canonical: String,
    pub og_title: String,
    pub structured_data_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldChange {
    Text {
        field: String,
        before_length: usize,
        after_length: usize,
    },
    Count {
        field: String,
        before: usize,
        after: usize,
    },
}

impl FieldChange {
    pub fn field(&self) -> &str {
        match self {
            FieldChange::Text { field, .. } | FieldChange::Count { field, .. } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub id: String,
    pub scan_id: String,
    pub url: String,
    pub before: DomSnapshot,
    pub after: DomSnapshot,
    pub changes: Vec<FieldChange>,
    pub change_count: usize,
    pub status: VerificationStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopIssue {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub count: usize,
}

/// Finished-scan summary handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub domain: String,
    pub score: u8,
    pub critical_count: usize,
    pub warning_count: usize,
    pub top_issues: Vec<TopIssue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyAllOutcome {
    pub applied: usize,
    pub unsupported: usize,
}

/// Score is 100 minus the summed severity penalties, floored at 0.
pub fn compute_scan_score<'a>(severities: impl IntoIterator<Item = &'a Severity>) -> u8 {
    let penalty = severities
        .into_iter()
        .map(|severity| severity.penalty())
        .fold(0u32, u32::saturating_add);
    100u32.saturating_sub(penalty) as u8
}

/// Host used to scope widget scripts; a leading `www.` is not significant.
pub fn normalize_domain(host: &str) -> String {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}
