//! Widget assembly: every applied fix for a domain, combined into one
//! domain-gated script.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use url::Url;

use super::error::StoreError;
use super::store::Store;
use super::types::{AppliedFix, normalize_domain};

pub const WIDGET_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";
pub const WIDGET_CACHE_CONTROL: &str = "public, max-age=3600";

/// Path plus query of a page URL, the form `location.pathname +
/// location.search` takes in the browser.
fn page_path(page_url: &str) -> Option<String> {
    let url = Url::parse(page_url).ok()?;
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    Some(path)
}

fn js_literal(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

fn indent(body: &str, by: &str) -> String {
    body.lines()
        .map(|line| {
            if line.is_empty() {
                String::new()
            } else {
                format!("{by}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the combined script for `domain` from fixes already in display
/// order. Each patch runs only on its own page and inside its own error
/// boundary, so one throwing patch never stops the rest.
pub fn assemble_script(domain: &str, fixes: &[AppliedFix]) -> String {
    let target = normalize_domain(domain);
    let mut out = String::new();
    out.push_str("(function () {\n");
    out.push_str(&format!("  var target = {};\n", js_literal(&target)));
    out.push_str(
        "  var host = String(location.hostname || '').toLowerCase().replace(/\\.$/, '').replace(/^www\\./, '');\n",
    );
    out.push_str("  if (host !== target) return;\n");
    out.push_str(&format!(
        "  var result = {{ domain: target, total: {}, applied: 0, failed: 0, skipped: 0, errors: [] }};\n",
        fixes.len()
    ));
    out.push_str("  window.__sitemend = result;\n");
    out.push_str("  var page = location.pathname + location.search;\n");

    for fix in fixes {
        let Some(path) = page_path(&fix.page_url) else {
            continue;
        };
        out.push_str(&format!(
            "  // {} {}\n",
            fix.fix_id,
            fix.issue_type.label()
        ));
        out.push_str(&format!("  if (page !== {}) {{\n", js_literal(&path)));
        out.push_str("    result.skipped++;\n");
        out.push_str("  } else {\n");
        out.push_str("    try {\n");
        out.push_str("      (function () {\n");
        out.push_str(&indent(&fix.patch, "        "));
        out.push('\n');
        out.push_str("      })();\n");
        out.push_str("      result.applied++;\n");
        out.push_str("    } catch (e) {\n");
        out.push_str("      result.failed++;\n");
        out.push_str(&format!(
            "      result.errors.push({{ fix: {}, message: String(e && e.message || e) }});\n",
            js_literal(&fix.fix_id)
        ));
        out.push_str("    }\n");
        out.push_str("  }\n");
    }

    out.push_str("  return result;\n");
    out.push_str("})();\n");
    out
}

/// Read the ledger and assemble the script for `domain`.
pub async fn assemble(store: &Store, domain: &str) -> Result<String, StoreError> {
    let domain = normalize_domain(domain);
    let fixes = store.applied_fixes_for_domain(&domain).await?;
    Ok(assemble_script(&domain, &fixes))
}

struct CachedScript {
    script: String,
    built_at: Instant,
}

/// Per-domain script cache with a fixed time-to-live.
pub struct WidgetCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedScript>>,
}

impl WidgetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, domain: &str) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(&normalize_domain(domain))?;
        (entry.built_at.elapsed() < self.ttl).then(|| entry.script.clone())
    }

    pub async fn put(&self, domain: &str, script: String) {
        self.entries.write().await.insert(
            normalize_domain(domain),
            CachedScript {
                script,
                built_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, domain: &str) {
        self.entries.write().await.remove(&normalize_domain(domain));
    }

    /// Cached script for `domain`, assembling and caching it on a miss.
    pub async fn get_or_assemble(&self, store: &Store, domain: &str) -> Result<String, StoreError> {
        if let Some(script) = self.get(domain).await {
            return Ok(script);
        }
        let script = assemble(store, domain).await?;
        self.put(domain, script.clone()).await;
        Ok(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::types::{IssueType, Severity};
    use chrono::Utc;

    fn applied(id: &str, issue_type: IssueType, page_url: &str, patch: &str) -> AppliedFix {
        AppliedFix {
            fix_id: id.to_string(),
            issue_type,
            severity: issue_type.severity(),
            page_url: page_url.to_string(),
            patch: patch.to_string(),
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn script_is_domain_gated_and_isolates_each_patch() {
        let script = assemble_script(
            "WWW.Example.com",
            &[
                applied("fix-1", IssueType::MissingTitle, "https://example.com/", "document.title = 'A';"),
                applied("fix-2", IssueType::MissingH1, "https://example.com/about?x=1", "throw new Error('boom');"),
            ],
        );

        assert!(script.starts_with("(function () {"));
        assert!(script.contains("var target = \"example.com\";"));
        assert!(script.contains("if (host !== target) return;"));
        assert!(script.contains("window.__sitemend = result;"));
        assert_eq!(script.matches("try {").count(), 2);
        assert_eq!(script.matches("} catch (e) {").count(), 2);
        assert!(script.contains("if (page !== \"/\") {"));
        assert!(script.contains("if (page !== \"/about?x=1\") {"));

        let first = script.find("document.title = 'A';").unwrap();
        let second = script.find("throw new Error('boom');").unwrap();
        assert!(first < second, "fixes keep the order they were given in");
    }

    #[test]
    fn empty_ledger_still_yields_a_valid_wrapper() {
        let script = assemble_script("example.com", &[]);
        assert!(script.contains("total: 0"));
        assert!(!script.contains("try {"));
        assert!(script.trim_end().ends_with("})();"));
    }

    #[test]
    fn domain_literal_is_escaped() {
        let script = assemble_script("evil.test\"</script>", &[]);
        assert!(!script.contains("</script>"));
    }

    #[tokio::test]
    async fn cache_honours_ttl_and_invalidation() {
        let cache = WidgetCache::new(Duration::from_secs(3600));
        assert_eq!(cache.get("example.com").await, None);

        cache.put("www.example.com", "one".to_string()).await;
        assert_eq!(cache.get("example.com").await.as_deref(), Some("one"));

        cache.invalidate("example.com").await;
        assert_eq!(cache.get("example.com").await, None);

        let expired = WidgetCache::new(Duration::ZERO);
        expired.put("example.com", "stale".to_string()).await;
        assert_eq!(expired.get("example.com").await, None);
    }

    #[tokio::test]
    async fn assemble_reads_applied_fixes_from_the_ledger() {
        let store = Store::open_in_memory().await.unwrap();
        let scan = store
            .create_scan("acct", "https://example.com/", "example.com", 5)
            .await
            .unwrap();
        let issues = store
            .insert_issues(
                &scan.id,
                &[crate::app::types::DetectedIssue {
                    page_url: "https://example.com/".to_string(),
                    issue_type: IssueType::MissingCanonical,
                    severity: Severity::Medium,
                    title: String::new(),
                    description: String::new(),
                    current_value: None,
                    fixable: true,
                }],
            )
            .await
            .unwrap();

        let cache = WidgetCache::new(Duration::from_secs(60));
        let before = cache.get_or_assemble(&store, "example.com").await.unwrap();
        assert!(!before.contains("canonical-patch"));

        let fix = store
            .upsert_fix(&scan.id, &issues[0].id, "/* canonical-patch */")
            .await
            .unwrap();
        store.mark_fix_applied(&fix.id).await.unwrap();

        let cached = cache.get_or_assemble(&store, "example.com").await.unwrap();
        assert_eq!(cached, before, "served from cache until invalidated");

        cache.invalidate("example.com").await;
        let fresh = cache.get_or_assemble(&store, "example.com").await.unwrap();
        assert!(fresh.contains("canonical-patch"));
    }
}
