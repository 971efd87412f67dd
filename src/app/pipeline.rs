//! The inbound audit operations and the scan state machine that drives
//! crawl, detection, scoring and notification.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::collab::{Notifier, QuotaService, build_summary, deliver};
use super::config::AppConfig;
use super::crawl::{CrawlEvent, CrawlSettings, Crawler};
use super::detect::detect;
use super::error::AuditError;
use super::fetch::{PageFetcher, host_of, normalize_crawl_url};
use super::store::Store;
use super::synth::synthesize_patch;
use super::types::{
    ApplyAllOutcome, DetectedIssue, Fix, FixStatus, Issue, Scan, ScanStatus, Verification,
    compute_scan_score, normalize_domain,
};
use super::verify::{RenderEngine, VerificationResult, Verifier};
use super::widget::WidgetCache;

const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const ABORT_REASON: &str = "aborted by operator";

/// Raises the crawl's stop flag and aborts its task when dropped.
struct StopCrawlOnDrop {
    stop: Arc<AtomicBool>,
    task: AbortHandle,
}

impl Drop for StopCrawlOnDrop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct AuditService {
    store: Arc<Store>,
    fetcher: Arc<dyn PageFetcher>,
    quota: Arc<dyn QuotaService>,
    notifier: Arc<dyn Notifier>,
    engine: Arc<dyn RenderEngine>,
    widgets: Arc<WidgetCache>,
    config: AppConfig,
}

impl AuditService {
    pub fn new(
        store: Arc<Store>,
        fetcher: Arc<dyn PageFetcher>,
        quota: Arc<dyn QuotaService>,
        notifier: Arc<dyn Notifier>,
        engine: Arc<dyn RenderEngine>,
        config: AppConfig,
    ) -> Self {
        let widgets = Arc::new(WidgetCache::new(config.widget.cache_ttl()));
        Self {
            store,
            fetcher,
            quota,
            notifier,
            engine,
            widgets,
            config,
        }
    }

    async fn require_scan(&self, scan_id: &str) -> Result<Scan, AuditError> {
        self.store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| AuditError::ScanNotFound(scan_id.to_string()))
    }

    async fn require_issue(&self, scan_id: &str, issue_id: &str) -> Result<Issue, AuditError> {
        self.store
            .get_issue(scan_id, issue_id)
            .await?
            .ok_or_else(|| AuditError::IssueNotFound {
                scan_id: scan_id.to_string(),
                issue_id: issue_id.to_string(),
            })
    }

    /// Record a queued scan for `url` without running it.
    pub async fn create_scan(
        &self,
        url: &str,
        account_id: &str,
        max_pages: Option<usize>,
    ) -> Result<Scan, AuditError> {
        let target =
            normalize_crawl_url(url).ok_or_else(|| AuditError::InvalidUrl(url.to_string()))?;
        let host = host_of(&target).ok_or_else(|| AuditError::InvalidUrl(url.to_string()))?;
        let max_pages = max_pages.unwrap_or(self.config.crawler.default_max_pages);
        if max_pages == 0 {
            return Err(AuditError::InvalidPageBudget);
        }

        let scan = self
            .store
            .create_scan(account_id, &target, &normalize_domain(&host), max_pages)
            .await?;
        info!(scan_id = %scan.id, url = %scan.target_url, pages = max_pages, "scan queued");
        Ok(scan)
    }

    /// Queue a scan and run it in the background. Progress is read back
    /// with [`AuditService::get_scan_status`].
    pub async fn start_scan(
        &self,
        url: &str,
        account_id: &str,
        max_pages: Option<usize>,
    ) -> Result<String, AuditError> {
        let scan = self.create_scan(url, account_id, max_pages).await?;
        let service = self.clone();
        let scan_id = scan.id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.run_scan(&scan_id).await {
                warn!(scan_id = %scan_id, error = %e, "scan failed");
            }
        });
        Ok(scan.id)
    }

    /// Drive a queued scan to a terminal state. Any failure after the scan
    /// left `queued` marks it `failed` with the error as reason.
    pub async fn run_scan(&self, scan_id: &str) -> Result<Scan, AuditError> {
        let scan = self.require_scan(scan_id).await?;
        if !self
            .store
            .transition_scan(scan_id, ScanStatus::Queued, ScanStatus::Crawling, None)
            .await?
        {
            return Err(AuditError::InvalidTransition {
                scan_id: scan_id.to_string(),
                from: scan.status.label(),
                to: ScanStatus::Crawling.label(),
            });
        }
        info!(scan_id = %scan_id, url = %scan.target_url, "crawl started");

        if let Err(err) = self.drive_scan(&scan).await {
            self.fail_scan(scan_id, &err.to_string()).await;
            return Err(err);
        }
        self.require_scan(scan_id).await
    }

    async fn drive_scan(&self, scan: &Scan) -> Result<(), AuditError> {
        let remaining = self.quota.remaining_pages(&scan.account_id).await?;
        let budget = scan
            .max_pages
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if budget == 0 {
            return Err(AuditError::BudgetExceeded {
                account_id: scan.account_id.clone(),
            });
        }
        if budget < scan.max_pages {
            debug!(scan_id = %scan.id, requested = scan.max_pages, budget, "page budget clamped by quota");
            self.store.set_page_budget(&scan.id, budget).await?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_abort_watcher(scan.id.clone(), Arc::clone(&stop));
        let result = self.crawl_and_detect(scan, budget, stop).await;
        watcher.abort();
        let visited = result?;

        let current = self.require_scan(&scan.id).await?;
        if current.status == ScanStatus::Failed {
            info!(scan_id = %scan.id, "scan was aborted, keeping partial results");
            return Ok(());
        }
        if current.status == ScanStatus::Crawling {
            self.store
                .transition_scan(&scan.id, ScanStatus::Crawling, ScanStatus::Scanning, None)
                .await?;
        }

        let issues = self.store.list_issues(&scan.id).await?;
        let score = compute_scan_score(issues.iter().map(|issue| &issue.severity));
        if !self.store.complete_scan(&scan.id, score, visited).await? {
            info!(scan_id = %scan.id, "scan left scanning before completion");
            return Ok(());
        }
        info!(scan_id = %scan.id, pages = visited, score, issues = issues.len(), "scan completed");

        if let Err(e) = self
            .quota
            .record_pages_consumed(&scan.account_id, visited as u64)
            .await
        {
            warn!(scan_id = %scan.id, error = %e, "failed to record page usage");
        }
        let summary = build_summary(&scan.id, &scan.domain, score, &issues);
        deliver(self.notifier.as_ref(), &summary).await;
        Ok(())
    }

    /// Crawler task feeding a detection stage over a channel. Detection
    /// runs on the blocking pool, one job per page; results are persisted
    /// as they finish. Returns the number of pages the crawler visited.
    async fn crawl_and_detect(
        &self,
        scan: &Scan,
        budget: usize,
        stop: Arc<AtomicBool>,
    ) -> Result<usize, AuditError> {
        let settings = CrawlSettings {
            concurrency: self.config.crawler.concurrency(),
            request_delay: self.config.crawler.request_delay(),
        };
        let crawler = Crawler::new(Arc::clone(&self.fetcher), settings);
        let (tx, mut rx) = mpsc::channel::<CrawlEvent>(settings.concurrency * 2);
        let target = scan.target_url.clone();
        let crawl_stop = Arc::clone(&stop);
        let crawl_task =
            tokio::spawn(async move { crawler.crawl(&target, budget, crawl_stop, Some(tx)).await });
        // Any early return below stops the crawler instead of detaching it.
        let _crawl_guard = StopCrawlOnDrop {
            stop,
            task: crawl_task.abort_handle(),
        };

        let mut detect_set: JoinSet<(String, Vec<DetectedIssue>)> = JoinSet::new();
        let mut channel_open = true;
        let mut scanning = false;
        let mut detected_pages = 0usize;

        loop {
            tokio::select! {
                event = rx.recv(), if channel_open => match event {
                    Some(CrawlEvent::Page(page)) => {
                        detect_set.spawn_blocking(move || {
                            let issues = detect(&page.html, &page.url);
                            (page.url, issues)
                        });
                    }
                    Some(CrawlEvent::Failed { url, reason }) => {
                        debug!(scan_id = %scan.id, url = %url, reason = %reason, "page skipped");
                    }
                    None => channel_open = false,
                },
                joined = detect_set.join_next(), if !detect_set.is_empty() => {
                    let (url, issues) = match joined {
                        Some(Ok(done)) => done,
                        Some(Err(e)) => {
                            warn!(scan_id = %scan.id, error = %e, "detection worker failed");
                            continue;
                        }
                        None => continue,
                    };
                    if !scanning {
                        scanning = self
                            .store
                            .transition_scan(&scan.id, ScanStatus::Crawling, ScanStatus::Scanning, None)
                            .await?;
                        if scanning {
                            info!(scan_id = %scan.id, "detection started");
                        }
                    }
                    detected_pages += 1;
                    if !self.store.record_progress(&scan.id, detected_pages).await? {
                        debug!(scan_id = %scan.id, url = %url, "scan no longer active, dropping page results");
                        continue;
                    }
                    self.store.insert_issues(&scan.id, &issues).await?;
                    debug!(scan_id = %scan.id, url = %url, issues = issues.len(), "page scanned");
                },
                else => break,
            }
        }

        let report = crawl_task
            .await
            .map_err(|e| AuditError::Task(format!("crawler: {e}")))??;
        debug!(
            scan_id = %scan.id,
            pages = report.pages.len(),
            visited = report.visited,
            failed = report.failed,
            "crawl finished"
        );
        Ok(report.visited)
    }

    fn spawn_abort_watcher(&self, scan_id: String, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ABORT_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                match store.get_scan(&scan_id).await {
                    Ok(Some(scan)) if scan.status.is_active() => {}
                    Ok(_) => {
                        debug!(scan_id = %scan_id, "scan left active state, stopping crawl");
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => warn!(scan_id = %scan_id, error = %e, "scan status poll failed"),
                }
            }
        })
    }

    /// Move an active scan to `failed`, whichever active state it is in.
    async fn fail_scan(&self, scan_id: &str, reason: &str) {
        for from in [ScanStatus::Scanning, ScanStatus::Crawling] {
            match self
                .store
                .transition_scan(scan_id, from, ScanStatus::Failed, Some(reason))
                .await
            {
                Ok(true) => {
                    warn!(scan_id = %scan_id, reason = %reason, "scan failed");
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(scan_id = %scan_id, error = %e, "could not mark scan failed");
                    return;
                }
            }
        }
    }

    pub async fn get_scan_status(&self, scan_id: &str) -> Result<Scan, AuditError> {
        self.require_scan(scan_id).await
    }

    pub async fn active_scans(&self) -> Result<Vec<Scan>, AuditError> {
        Ok(self.store.list_active_scans().await?)
    }

    /// Operator abort: `crawling`/`scanning` to `failed`. The running crawl
    /// notices on its next status poll and stops dispatching.
    pub async fn abort_scan(&self, scan_id: &str) -> Result<Scan, AuditError> {
        for _ in 0..3 {
            let scan = self.require_scan(scan_id).await?;
            if !scan.status.can_transition_to(ScanStatus::Failed) {
                return Err(AuditError::InvalidTransition {
                    scan_id: scan_id.to_string(),
                    from: scan.status.label(),
                    to: ScanStatus::Failed.label(),
                });
            }
            if self
                .store
                .transition_scan(scan_id, scan.status, ScanStatus::Failed, Some(ABORT_REASON))
                .await?
            {
                info!(scan_id = %scan_id, "scan aborted");
                return self.require_scan(scan_id).await;
            }
        }
        let scan = self.require_scan(scan_id).await?;
        Err(AuditError::InvalidTransition {
            scan_id: scan_id.to_string(),
            from: scan.status.label(),
            to: ScanStatus::Failed.label(),
        })
    }

    pub async fn list_issues(&self, scan_id: &str) -> Result<Vec<Issue>, AuditError> {
        self.require_scan(scan_id).await?;
        Ok(self.store.list_issues(scan_id).await?)
    }

    pub async fn count_issues(&self, scan_id: &str) -> Result<usize, AuditError> {
        self.require_scan(scan_id).await?;
        Ok(self.store.count_issues(scan_id).await?)
    }

    pub async fn list_fixes(&self, scan_id: &str) -> Result<Vec<Fix>, AuditError> {
        self.require_scan(scan_id).await?;
        Ok(self.store.list_fixes(scan_id).await?)
    }

    /// Synthesize, store and apply the fix for one issue. Applying an
    /// already applied fix leaves the single row as it is.
    pub async fn apply_fix(&self, scan_id: &str, issue_id: &str) -> Result<Fix, AuditError> {
        let scan = self.require_scan(scan_id).await?;
        let issue = self.require_issue(scan_id, issue_id).await?;
        let fix = self.apply_issue(&issue).await?;
        self.widgets.invalidate(&scan.domain).await;
        Ok(fix)
    }

    async fn apply_issue(&self, issue: &Issue) -> Result<Fix, AuditError> {
        let patch = synthesize_patch(issue)
            .ok_or_else(|| AuditError::SynthesisUnsupported(issue.issue_type.label().to_string()))?;

        if let Some(existing) = self.store.get_fix_for_issue(&issue.id).await?
            && existing.status == FixStatus::Applied
            && existing.patch == patch
        {
            return Ok(existing);
        }

        let fix = self.store.upsert_fix(&issue.scan_id, &issue.id, &patch).await?;
        let fix = self.store.mark_fix_applied(&fix.id).await?;
        info!(scan_id = %issue.scan_id, issue_id = %issue.id, fix_id = %fix.id, "fix applied");
        Ok(fix)
    }

    pub async fn apply_all_fixes(&self, scan_id: &str) -> Result<ApplyAllOutcome, AuditError> {
        let scan = self.require_scan(scan_id).await?;
        let mut outcome = ApplyAllOutcome::default();
        for issue in self.store.list_issues(scan_id).await? {
            match self.apply_issue(&issue).await {
                Ok(_) => outcome.applied += 1,
                Err(AuditError::SynthesisUnsupported(_)) => outcome.unsupported += 1,
                Err(e) => return Err(e),
            }
        }
        self.widgets.invalidate(&scan.domain).await;
        info!(
            scan_id = %scan_id,
            applied = outcome.applied,
            unsupported = outcome.unsupported,
            "fixes applied"
        );
        Ok(outcome)
    }

    /// Replace an issue's fix with a freshly synthesized pending one.
    pub async fn regenerate_fix(&self, scan_id: &str, issue_id: &str) -> Result<Fix, AuditError> {
        let scan = self.require_scan(scan_id).await?;
        let issue = self.require_issue(scan_id, issue_id).await?;
        let patch = synthesize_patch(&issue)
            .ok_or_else(|| AuditError::SynthesisUnsupported(issue.issue_type.label().to_string()))?;

        self.store.delete_fix_for_issue(issue_id).await?;
        let fix = self.store.upsert_fix(scan_id, issue_id, &patch).await?;
        self.widgets.invalidate(&scan.domain).await;
        info!(scan_id = %scan_id, issue_id = %issue_id, fix_id = %fix.id, "fix regenerated");
        Ok(fix)
    }

    pub async fn get_widget_script(&self, domain: &str) -> Result<String, AuditError> {
        Ok(self.widgets.get_or_assemble(&self.store, domain).await?)
    }

    /// Render `url`, run the domain's widget in it and persist the
    /// before/after comparison. Failed runs persist nothing.
    pub async fn verify_autofix(
        &self,
        scan_id: &str,
        url: &str,
        domain: Option<&str>,
    ) -> Result<VerificationResult, AuditError> {
        let scan = self.require_scan(scan_id).await?;
        let url = normalize_crawl_url(url).ok_or_else(|| AuditError::InvalidUrl(url.to_string()))?;
        let domain = domain.map(normalize_domain).unwrap_or(scan.domain);

        let script = self.get_widget_script(&domain).await?;
        let verifier = Verifier::new(
            Arc::clone(&self.engine),
            self.config.verifier.timeout(),
            self.config.verifier.settle(),
        );
        let outcome = verifier
            .render_and_diff(&url, &script)
            .await
            .inspect_err(|e| warn!(scan_id = %scan_id, url = %url, error = %e, "verification failed"))?;

        let record = self
            .store
            .insert_verification(scan_id, &url, &outcome.before, &outcome.after, &outcome.changes)
            .await?;
        info!(
            scan_id = %scan_id,
            url = %url,
            changes = record.change_count,
            status = record.status.label(),
            "verification recorded"
        );
        Ok(record.into())
    }

    pub async fn list_verifications(&self, scan_id: &str) -> Result<Vec<Verification>, AuditError> {
        self.require_scan(scan_id).await?;
        Ok(self.store.list_verifications(scan_id).await?)
    }
}
