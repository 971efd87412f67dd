use std::time::Duration;

use thiserror::Error;

/// Single-page retrieval failure. Always recovered by the crawler.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} is not HTML ({content_type})")]
    NotHtml { url: String, content_type: String },

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Timeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("invalid start URL '{0}'")]
    InvalidUrl(String),

    #[error("start URL {0} timed out")]
    FetchTimeout(String),

    #[error("start URL unreachable: {0}")]
    SeedUnreachable(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("no result returned")]
    NoResult,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("render timed out after {0:?}")]
    RenderTimeout(Duration),

    #[error("widget script threw: {0}")]
    ScriptExecution(String),

    #[error("webdriver: {0}")]
    WebDriver(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Summary delivery failure. Logged by the caller, never propagated.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook client build failed: {0}")]
    Client(String),

    #[error("webhook request failed: {0}")]
    Request(String),

    #[error("webhook answered HTTP {0}")]
    Status(u16),
}

/// Errors surfaced by the inbound audit operations.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("page budget must be at least 1")]
    InvalidPageBudget,

    #[error("page budget exhausted for account {account_id}")]
    BudgetExceeded { account_id: String },

    #[error("scan {0} not found")]
    ScanNotFound(String),

    #[error("issue {issue_id} not found in scan {scan_id}")]
    IssueNotFound { scan_id: String, issue_id: String },

    #[error("no auto-fix available for {0}")]
    SynthesisUnsupported(String),

    #[error("scan {scan_id} cannot move from {from} to {to}")]
    InvalidTransition {
        scan_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Crawl(#[from] CrawlError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Quota(#[from] QuotaError),
}
