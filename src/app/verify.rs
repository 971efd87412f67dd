//! Closed-loop verification: render the live page, snapshot its SEO fields,
//! run the widget inside the same page, snapshot again and diff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, warn};

use super::error::VerifyError;
use super::types::{DomSnapshot, FieldChange, Verification, VerificationStatus};

/// Reads the fixed set of SEO-visible fields from the rendered DOM.
pub const SNAPSHOT_SCRIPT: &str = r#"
    var text = function (v) { return String(v || '').replace(/\s+/g, ' ').trim(); };
    var attr = function (sel, name) {
        var el = document.querySelector(sel);
        return el ? text(el.getAttribute(name)) : '';
    };
    return {
        title: text(document.title),
        meta_description: attr('meta[name="description" i]', 'content'),
        h1_count: document.querySelectorAll('h1').length,
        canonical: attr('link[rel~="canonical" i]', 'href'),
        og_title: attr('meta[property="og:title" i]', 'content'),
        structured_data_count: document.querySelectorAll('script[type="application/ld+json" i]').length
    };
"#;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Start a fresh browser session.
    async fn open(&self) -> Result<Box<dyn RenderSession>, VerifyError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), VerifyError>;
    /// Run `script` as a function body in the page and return its value.
    async fn execute(&mut self, script: &str) -> Result<Value, VerifyError>;
    async fn close(&mut self) -> Result<(), VerifyError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutcome {
    pub before: DomSnapshot,
    pub after: DomSnapshot,
    pub changes: Vec<FieldChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub verification_id: String,
    pub verified: bool,
    pub status: VerificationStatus,
    pub url: String,
    pub before: DomSnapshot,
    pub after: DomSnapshot,
    pub changes: Vec<FieldChange>,
    pub change_count: usize,
    pub reason: Option<String>,
}

impl From<Verification> for VerificationResult {
    fn from(record: Verification) -> Self {
        let verified = record.status == VerificationStatus::Success;
        Self {
            verification_id: record.id,
            verified,
            status: record.status,
            url: record.url,
            before: record.before,
            after: record.after,
            change_count: record.change_count,
            changes: record.changes,
            reason: (!verified).then(|| "widget made no changes to the page".to_string()),
        }
    }
}

fn count_field(value: &Value, key: &str) -> usize {
    value
        .get(key)
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .unwrap_or(0) as usize
}

fn text_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

pub fn parse_snapshot(value: &Value) -> Result<DomSnapshot, VerifyError> {
    if !value.is_object() {
        return Err(VerifyError::ScriptExecution(format!(
            "snapshot returned {value} instead of an object"
        )));
    }
    Ok(DomSnapshot {
        title: text_field(value, "title"),
        meta_description: text_field(value, "meta_description"),
        h1_count: count_field(value, "h1_count"),
        canonical: text_field(value, "canonical"),
        og_title: text_field(value, "og_title"),
        structured_data_count: count_field(value, "structured_data_count"),
    })
}

fn text_change(field: &str, before: &str, after: &str, out: &mut Vec<FieldChange>) {
    if before != after {
        out.push(FieldChange::Text {
            field: field.to_string(),
            before_length: before.chars().count(),
            after_length: after.chars().count(),
        });
    }
}

fn count_change(field: &str, before: usize, after: usize, out: &mut Vec<FieldChange>) {
    if before != after {
        out.push(FieldChange::Count {
            field: field.to_string(),
            before,
            after,
        });
    }
}

/// Field-by-field comparison in snapshot field order.
pub fn diff_snapshots(before: &DomSnapshot, after: &DomSnapshot) -> Vec<FieldChange> {
    let mut out = Vec::new();
    text_change("title", &before.title, &after.title, &mut out);
    text_change(
        "meta_description",
        &before.meta_description,
        &after.meta_description,
        &mut out,
    );
    count_change("h1_count", before.h1_count, after.h1_count, &mut out);
    text_change("canonical", &before.canonical, &after.canonical, &mut out);
    text_change("og_title", &before.og_title, &after.og_title, &mut out);
    count_change(
        "structured_data_count",
        before.structured_data_count,
        after.structured_data_count,
        &mut out,
    );
    out
}

pub struct Verifier {
    engine: Arc<dyn RenderEngine>,
    timeout: Duration,
    settle: Duration,
}

impl Verifier {
    pub fn new(engine: Arc<dyn RenderEngine>, timeout: Duration, settle: Duration) -> Self {
        Self {
            engine,
            timeout,
            settle,
        }
    }

    /// Render `url`, run `widget_script` in it and diff the two snapshots.
    /// The whole render shares one deadline, and the session is closed on
    /// every exit path, including a session that only arrives after the
    /// deadline passed.
    pub async fn render_and_diff(
        &self,
        url: &str,
        widget_script: &str,
    ) -> Result<RenderOutcome, VerifyError> {
        let deadline = Instant::now() + self.timeout;

        let engine = Arc::clone(&self.engine);
        let mut opening = tokio::spawn(async move { engine.open().await });
        let mut session = match timeout_at(deadline, &mut opening).await {
            Ok(joined) => joined
                .map_err(|e| VerifyError::WebDriver(format!("session open task failed: {e}")))??,
            Err(_) => {
                let url = url.to_string();
                tokio::spawn(async move {
                    if let Ok(Ok(mut late)) = opening.await {
                        debug!(url = %url, "closing session opened after the deadline");
                        close_session(late.as_mut(), &url).await;
                    }
                });
                return Err(VerifyError::RenderTimeout(self.timeout));
            }
        };

        let outcome = timeout_at(
            deadline,
            run_in_session(session.as_mut(), url, widget_script, self.settle),
        )
        .await;

        close_session(session.as_mut(), url).await;

        outcome.map_err(|_| VerifyError::RenderTimeout(self.timeout))?
    }
}

async fn close_session(session: &mut dyn RenderSession, url: &str) {
    match timeout(CLOSE_TIMEOUT, session.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(url = %url, error = %e, "failed to close render session"),
        Err(_) => warn!(url = %url, "timed out closing render session"),
    }
}

async fn run_in_session(
    session: &mut dyn RenderSession,
    url: &str,
    widget_script: &str,
    settle: Duration,
) -> Result<RenderOutcome, VerifyError> {
    session.navigate(url).await?;
    let before = parse_snapshot(&session.execute(SNAPSHOT_SCRIPT).await?)?;

    let report = session
        .execute(&format!(
            "{widget_script}\nreturn window.__sitemend || null;"
        ))
        .await?;
    debug!(url = %url, report = %report, "widget executed");

    tokio::time::sleep(settle).await;
    let after = parse_snapshot(&session.execute(SNAPSHOT_SCRIPT).await?)?;
    let changes = diff_snapshots(&before, &after);
    Ok(RenderOutcome {
        before,
        after,
        changes,
    })
}
