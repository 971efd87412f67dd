//! Outbound collaborators: the page quota owner and the notification
//! channel that receives finished-scan summaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::error::{NotifyError, QuotaError};
use super::store::{Store, usage_month};
use super::types::{Issue, IssueType, ScanSummary, Severity, TopIssue};

const TOP_ISSUE_LIMIT: usize = 5;

#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn remaining_pages(&self, account_id: &str) -> Result<u64, QuotaError>;
    async fn record_pages_consumed(&self, account_id: &str, pages: u64) -> Result<(), QuotaError>;
}

/// Monthly page allowance kept next to the scans, one usage row per
/// account and calendar month.
pub struct StoreQuota {
    store: Arc<Store>,
    monthly_pages: u64,
}

impl StoreQuota {
    pub fn new(store: Arc<Store>, monthly_pages: u64) -> Self {
        Self {
            store,
            monthly_pages,
        }
    }
}

#[async_trait]
impl QuotaService for StoreQuota {
    async fn remaining_pages(&self, account_id: &str) -> Result<u64, QuotaError> {
        let used = self
            .store
            .pages_used(account_id, &usage_month(Utc::now()))
            .await?;
        Ok(self.monthly_pages.saturating_sub(used))
    }

    async fn record_pages_consumed(&self, account_id: &str, pages: u64) -> Result<(), QuotaError> {
        if pages == 0 {
            return Ok(());
        }
        self.store
            .add_pages_used(account_id, &usage_month(Utc::now()), pages)
            .await?;
        Ok(())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, summary: &ScanSummary) -> Result<(), NotifyError>;
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, summary: &ScanSummary) -> Result<(), NotifyError> {
        info!(
            scan_id = %summary.scan_id,
            domain = %summary.domain,
            score = summary.score,
            critical = summary.critical_count,
            warnings = summary.warning_count,
            "scan completed"
        );
        Ok(())
    }
}

/// POSTs the JSON summary to a webhook; the mail gateway listens there.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, summary: &ScanSummary) -> Result<(), NotifyError> {
        let res = self
            .client
            .post(&self.url)
            .json(summary)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        if !res.status().is_success() {
            return Err(NotifyError::Status(res.status().as_u16()));
        }
        Ok(())
    }
}

/// Deliver a summary; failures are logged and never propagate.
pub async fn deliver(notifier: &dyn Notifier, summary: &ScanSummary) {
    if let Err(e) = notifier.notify(summary).await {
        warn!(scan_id = %summary.scan_id, error = %e, "scan summary notification failed");
    }
}

pub fn build_summary(scan_id: &str, domain: &str, score: u8, issues: &[Issue]) -> ScanSummary {
    let critical_count = issues
        .iter()
        .filter(|i| i.severity == Severity::Critical)
        .count();
    let warning_count = issues
        .iter()
        .filter(|i| matches!(i.severity, Severity::High | Severity::Medium))
        .count();

    let mut counts: HashMap<IssueType, usize> = HashMap::new();
    for issue in issues {
        *counts.entry(issue.issue_type).or_default() += 1;
    }
    let mut top_issues = counts
        .into_iter()
        .map(|(issue_type, count)| TopIssue {
            issue_type,
            severity: issue_type.severity(),
            count,
        })
        .collect::<Vec<_>>();
    top_issues.sort_by(|a, b| {
        a.severity
            .rank()
            .cmp(&b.severity.rank())
            .then(b.count.cmp(&a.count))
            .then(a.issue_type.label().cmp(b.issue_type.label()))
    });
    top_issues.truncate(TOP_ISSUE_LIMIT);

    ScanSummary {
        scan_id: scan_id.to_string(),
        domain: domain.to_string(),
        score,
        critical_count,
        warning_count,
        top_issues,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use std::sync::Mutex;

    /// Fixed allowance that records what it was charged.
    pub(crate) struct FakeQuota {
        pub remaining: u64,
        pub charged: Mutex<Vec<(String, u64)>>,
    }

    impl FakeQuota {
        pub fn new(remaining: u64) -> Self {
            Self {
                remaining,
                charged: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl QuotaService for FakeQuota {
        async fn remaining_pages(&self, _account_id: &str) -> Result<u64, QuotaError> {
            Ok(self.remaining)
        }

        async fn record_pages_consumed(&self, account_id: &str, pages: u64) -> Result<(), QuotaError> {
            self.charged
                .lock()
                .unwrap()
                .push((account_id.to_string(), pages));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<ScanSummary>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, summary: &ScanSummary) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    fn issue(issue_type: IssueType) -> Issue {
        Issue {
            id: String::new(),
            scan_id: "scn-1".to_string(),
            page_url: "https://example.com/".to_string(),
            issue_type,
            severity: issue_type.severity(),
            title: String::new(),
            description: String::new(),
            current_value: None,
            fixable: issue_type.fixable(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_counts_and_ranks_top_issues() {
        let issues = vec![
            issue(IssueType::MissingCanonical),
            issue(IssueType::MissingCanonical),
            issue(IssueType::MissingCanonical),
            issue(IssueType::MissingTitle),
            issue(IssueType::MissingDescription),
            issue(IssueType::MissingAltText),
            issue(IssueType::MissingAltText),
            issue(IssueType::LongTitle),
            issue(IssueType::Noindex),
            issue(IssueType::ShortDescription),
        ];
        let summary = build_summary("scn-1", "example.com", 42, &issues);

        assert_eq!(summary.critical_count, 2);
        assert_eq!(summary.warning_count, 8);
        let top: Vec<(IssueType, usize)> = summary
            .top_issues
            .iter()
            .map(|t| (t.issue_type, t.count))
            .collect();
        assert_eq!(
            top,
            vec![
                (IssueType::MissingTitle, 1),
                (IssueType::Noindex, 1),
                (IssueType::MissingAltText, 2),
                (IssueType::MissingDescription, 1),
                (IssueType::MissingCanonical, 3),
            ]
        );
    }

    #[tokio::test]
    async fn store_quota_counts_down_within_the_month() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let quota = StoreQuota::new(Arc::clone(&store), 100);

        assert_eq!(quota.remaining_pages("acct").await.unwrap(), 100);
        quota.record_pages_consumed("acct", 30).await.unwrap();
        quota.record_pages_consumed("acct", 0).await.unwrap();
        assert_eq!(quota.remaining_pages("acct").await.unwrap(), 70);
        quota.record_pages_consumed("acct", 500).await.unwrap();
        assert_eq!(quota.remaining_pages("acct").await.unwrap(), 0);
        assert_eq!(quota.remaining_pages("other").await.unwrap(), 100);
    }

    #[tokio::test]
    async fn webhook_posts_json_summary() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind webhook");
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .expect("ip listener");
        let handle = std::thread::spawn(move || {
            let mut request = server.recv().expect("one request");
            let mut body = String::new();
            request.as_reader().read_to_string(&mut body).unwrap();
            let _ = request.respond(tiny_http::Response::from_string("ok"));
            body
        });

        let notifier = WebhookNotifier::new(&format!("http://127.0.0.1:{port}/hook")).unwrap();
        let summary = build_summary("scn-9", "example.com", 77, &[issue(IssueType::MissingH1)]);
        notifier.notify(&summary).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&handle.join().unwrap()).unwrap();
        assert_eq!(body["scan_id"], "scn-9");
        assert_eq!(body["score"], 77);
        assert_eq!(body["top_issues"][0]["issue_type"], "missing_h1");
    }

    #[tokio::test]
    async fn webhook_rejection_reports_the_status() {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind webhook");
        let port = server
            .server_addr()
            .to_ip()
            .map(|addr| addr.port())
            .expect("ip listener");
        let handle = std::thread::spawn(move || {
            let request = server.recv().expect("one request");
            let _ = request.respond(tiny_http::Response::from_string("down").with_status_code(503));
        });

        let notifier = WebhookNotifier::new(&format!("http://127.0.0.1:{port}/hook")).unwrap();
        let summary = build_summary("scn-9", "example.com", 77, &[]);
        let err = notifier.notify(&summary).await.unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, NotifyError::Status(503)), "{err:?}");
        assert_eq!(err.to_string(), "webhook answered HTTP 503");
        deliver(&notifier, &summary).await;
    }
}
