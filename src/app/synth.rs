//! Fix synthesis.
//!
//! A fixable issue maps to one [`PatchKind`], a typed description of the DOM
//! change. Rendering to executable script happens only in [`PatchKind::render`],
//! and the output depends on nothing but the kind's fields, so a stored patch
//! can always be reproduced from the issue type and current value.

use super::detect::{DESCRIPTION_MAX_CHARS, TITLE_MAX_CHARS};
use super::types::{Issue, IssueType};

pub const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchKind {
    InsertTitleFromHeading { max_len: usize },
    TruncateTitle {
        original: String,
        max_len: usize,
        suffix: &'static str,
    },
    InsertDescriptionFromContent { max_len: usize },
    TruncateDescription {
        original: String,
        max_len: usize,
        suffix: &'static str,
    },
    InsertH1FromTitle,
    InsertCanonical,
    FillMissingAlt,
    RemoveNoindex,
}

/// Dispatch table from issue type to patch. Unknown or unfixable types, and
/// truncations without a recorded current value, have no patch.
pub fn synthesize(issue_type: IssueType, current_value: Option<&str>) -> Option<PatchKind> {
    if !issue_type.fixable() {
        return None;
    }
    match issue_type {
        IssueType::MissingTitle => Some(PatchKind::InsertTitleFromHeading {
            max_len: TITLE_MAX_CHARS,
        }),
        IssueType::LongTitle => current_value.map(|original| PatchKind::TruncateTitle {
            original: original.to_string(),
            max_len: TITLE_MAX_CHARS,
            suffix: ELLIPSIS,
        }),
        IssueType::MissingDescription => Some(PatchKind::InsertDescriptionFromContent {
            max_len: DESCRIPTION_MAX_CHARS,
        }),
        IssueType::LongDescription => current_value.map(|original| PatchKind::TruncateDescription {
            original: original.to_string(),
            max_len: DESCRIPTION_MAX_CHARS,
            suffix: ELLIPSIS,
        }),
        IssueType::MissingH1 => Some(PatchKind::InsertH1FromTitle),
        IssueType::MissingCanonical => Some(PatchKind::InsertCanonical),
        IssueType::MissingAltText => Some(PatchKind::FillMissingAlt),
        IssueType::Noindex => Some(PatchKind::RemoveNoindex),
        IssueType::ShortTitle
        | IssueType::ShortDescription
        | IssueType::MultipleH1
        | IssueType::MultipleCanonical => None,
    }
}

/// Patch body for a stored issue, `None` when no auto-fix exists.
pub fn synthesize_patch(issue: &Issue) -> Option<String> {
    synthesize(issue.issue_type, issue.current_value.as_deref()).map(|kind| kind.render())
}

/// Cut `original` so that it plus `suffix` fits in `max_len` characters.
pub fn truncate_with_suffix(original: &str, max_len: usize, suffix: &str) -> String {
    if original.chars().count() <= max_len {
        return original.to_string();
    }
    let keep = max_len.saturating_sub(suffix.chars().count());
    let mut out = original.chars().take(keep).collect::<String>().trim_end().to_string();
    out.push_str(suffix);
    out
}

/// JSON string escaping is valid JS; `</` is split so the literal can never
/// close an enclosing script element.
fn js_string(value: &str) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace("</", "<\\/")
}

impl PatchKind {
    /// Literal value the patch installs, when it is fixed at synthesis time.
    pub fn installs(&self) -> Option<String> {
        match self {
            PatchKind::TruncateTitle {
                original,
                max_len,
                suffix,
            }
            | PatchKind::TruncateDescription {
                original,
                max_len,
                suffix,
            } => Some(truncate_with_suffix(original, *max_len, suffix)),
            _ => None,
        }
    }

    /// Executable body. Each body returns early when its precondition no
    /// longer holds, so running it again after success changes nothing.
    pub fn render(&self) -> String {
        match self {
            PatchKind::InsertTitleFromHeading { max_len } => {
                let keep = max_len.saturating_sub(ELLIPSIS.len());
                format!(
                    r#"if (document.title && document.title.trim()) return;
var heading = document.querySelector('h1');
var text = heading ? heading.textContent.replace(/\s+/g, ' ').trim() : '';
if (!text) text = location.hostname.replace(/^www\./, '');
if (text.length > {max_len}) text = text.slice(0, {keep}).trim() + {suffix};
document.title = text;"#,
                    suffix = js_string(ELLIPSIS),
                )
            }
            PatchKind::TruncateTitle { original, .. } => {
                let target = self.installs().unwrap_or_default();
                format!(
                    r#"var target = {target};
var current = (document.title || '').replace(/\s+/g, ' ').trim();
if (current === target || current !== {original}) return;
document.title = target;"#,
                    target = js_string(&target),
                    original = js_string(original),
                )
            }
            PatchKind::InsertDescriptionFromContent { max_len } => {
                let keep = max_len.saturating_sub(ELLIPSIS.len());
                format!(
                    r#"var meta = document.querySelector('meta[name="description" i]');
if (meta && (meta.getAttribute('content') || '').trim()) return;
var source = document.querySelector('main p, article p, p');
var text = source ? source.textContent.replace(/\s+/g, ' ').trim() : '';
if (!text) text = (document.title || '').trim();
if (!text) return;
if (text.length > {max_len}) text = text.slice(0, {keep}).trim() + {suffix};
if (!meta) {{
  meta = document.createElement('meta');
  meta.setAttribute('name', 'description');
  document.head.appendChild(meta);
}}
meta.setAttribute('content', text);"#,
                    suffix = js_string(ELLIPSIS),
                )
            }
            PatchKind::TruncateDescription { original, .. } => {
                let target = self.installs().unwrap_or_default();
                format!(
                    r#"var meta = document.querySelector('meta[name="description" i]');
if (!meta) return;
var target = {target};
var current = (meta.getAttribute('content') || '').replace(/\s+/g, ' ').trim();
if (current === target || current !== {original}) return;
meta.setAttribute('content', target);"#,
                    target = js_string(&target),
                    original = js_string(original),
                )
            }
            PatchKind::InsertH1FromTitle => r#"if (document.querySelector('h1')) return;
var text = (document.title || '').replace(/\s+/g, ' ').trim();
var container = document.querySelector('main') || document.body;
if (!text || !container) return;
var heading = document.createElement('h1');
heading.textContent = text;
container.insertBefore(heading, container.firstChild);"#
                .to_string(),
            PatchKind::InsertCanonical => r#"if (document.querySelector('link[rel~="canonical" i]')) return;
var link = document.createElement('link');
link.setAttribute('rel', 'canonical');
link.setAttribute('href', location.origin + location.pathname);
document.head.appendChild(link);"#
                .to_string(),
            PatchKind::FillMissingAlt => r#"var images = document.querySelectorAll('img');
for (var i = 0; i < images.length; i++) {
  var img = images[i];
  if ((img.getAttribute('alt') || '').trim()) continue;
  var file = (img.getAttribute('src') || '').split(/[?#]/)[0].split('/').pop() || '';
  var label = file.replace(/\.[a-z0-9]+$/i, '').replace(/[-_]+/g, ' ').trim();
  img.setAttribute('alt', label || (document.title || '').trim() || 'Image');
}"#
            .to_string(),
            PatchKind::RemoveNoindex => r#"var metas = document.querySelectorAll('meta[name="robots" i], meta[name="googlebot" i]');
for (var i = 0; i < metas.length; i++) {
  var meta = metas[i];
  var content = meta.getAttribute('content') || '';
  if (!/noindex/i.test(content)) continue;
  var kept = content.split(',').map(function (t) { return t.trim(); }).filter(function (t) {
    return t && t.toLowerCase() !== 'noindex';
  });
  if (kept.length) meta.setAttribute('content', kept.join(', '));
  else if (meta.parentNode) meta.parentNode.removeChild(meta);
}"#
            .to_string(),
        }
    }
}
