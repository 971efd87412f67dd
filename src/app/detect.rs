//! Structural SEO defect detection over raw HTML.
//!
//! Every rule reads the same [`PageSignals`] and returns zero or more
//! issues. Rules run in a fixed order (title, description, H1, canonical,
//! image alt text, indexing) and the output keeps that order, so identical
//! input always yields an identical list.

use scraper::{Html, Selector};

use super::types::{DetectedIssue, IssueType};

pub const TITLE_MIN_CHARS: usize = 30;
pub const TITLE_MAX_CHARS: usize = 60;
pub const DESCRIPTION_MIN_CHARS: usize = 120;
pub const DESCRIPTION_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    pub title: Option<String>,
    pub description: Option<String>,
    pub h1_count: usize,
    pub canonical_count: usize,
    pub images_missing_alt: usize,
    /// Content of the first robots meta that carries `noindex`.
    pub noindex: Option<String>,
}

impl PageSignals {
    pub fn extract(html: &str) -> Self {
        let doc = Html::parse_document(html);
        Self {
            title: non_empty(extract_first_text(&doc, "title")),
            description: non_empty(extract_meta_content(&doc, "description")),
            h1_count: count_elements(&doc, "h1"),
            canonical_count: count_canonical_links(&doc),
            images_missing_alt: count_images_missing_alt(&doc),
            noindex: noindex_directive(&doc),
        }
    }
}

type Rule = fn(&PageSignals, &str) -> Vec<DetectedIssue>;

const RULES: [Rule; 6] = [
    title_rule,
    description_rule,
    h1_rule,
    canonical_rule,
    alt_text_rule,
    indexing_rule,
];

/// Detect every structural defect of one page. Pure: no I/O, no shared state.
pub fn detect(html: &str, page_url: &str) -> Vec<DetectedIssue> {
    let signals = PageSignals::extract(html);
    RULES
        .iter()
        .flat_map(|rule| rule(&signals, page_url))
        .collect()
}

fn issue(
    page_url: &str,
    issue_type: IssueType,
    description: String,
    current_value: Option<String>,
) -> DetectedIssue {
    DetectedIssue {
        page_url: page_url.to_string(),
        issue_type,
        severity: issue_type.severity(),
        title: issue_type.title().to_string(),
        description,
        current_value,
        fixable: issue_type.fixable(),
    }
}

fn title_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    let Some(title) = signals.title.as_ref() else {
        return vec![issue(
            page_url,
            IssueType::MissingTitle,
            "The page has no <title>; search results will show an auto-generated one.".to_string(),
            None,
        )];
    };

    let len = char_len(title);
    if len < TITLE_MIN_CHARS {
        vec![issue(
            page_url,
            IssueType::ShortTitle,
            format!("Title is {len} characters; aim for {TITLE_MIN_CHARS}-{TITLE_MAX_CHARS}."),
            Some(title.clone()),
        )]
    } else if len > TITLE_MAX_CHARS {
        vec![issue(
            page_url,
            IssueType::LongTitle,
            format!("Title is {len} characters and will be cut off after {TITLE_MAX_CHARS}."),
            Some(title.clone()),
        )]
    } else {
        Vec::new()
    }
}

fn description_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    let Some(description) = signals.description.as_ref() else {
        return vec![issue(
            page_url,
            IssueType::MissingDescription,
            "No meta description; search engines will pick a snippet from the page body."
                .to_string(),
            None,
        )];
    };

    let len = char_len(description);
    if len < DESCRIPTION_MIN_CHARS {
        vec![issue(
            page_url,
            IssueType::ShortDescription,
            format!(
                "Meta description is {len} characters; aim for {DESCRIPTION_MIN_CHARS}-{DESCRIPTION_MAX_CHARS}."
            ),
            Some(description.clone()),
        )]
    } else if len > DESCRIPTION_MAX_CHARS {
        vec![issue(
            page_url,
            IssueType::LongDescription,
            format!(
                "Meta description is {len} characters and will be truncated after {DESCRIPTION_MAX_CHARS}."
            ),
            Some(description.clone()),
        )]
    } else {
        Vec::new()
    }
}

fn h1_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    match signals.h1_count {
        0 => vec![issue(
            page_url,
            IssueType::MissingH1,
            "The page has no <h1> heading.".to_string(),
            None,
        )],
        1 => Vec::new(),
        count => vec![issue(
            page_url,
            IssueType::MultipleH1,
            format!("The page has {count} <h1> headings; keep exactly one."),
            Some(count.to_string()),
        )],
    }
}

fn canonical_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    match signals.canonical_count {
        0 => vec![issue(
            page_url,
            IssueType::MissingCanonical,
            "No canonical link; duplicate URLs may split ranking signals.".to_string(),
            None,
        )],
        1 => Vec::new(),
        count => vec![issue(
            page_url,
            IssueType::MultipleCanonical,
            format!("The page declares {count} canonical links; search engines may ignore all of them."),
            Some(count.to_string()),
        )],
    }
}

fn alt_text_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    if signals.images_missing_alt == 0 {
        return Vec::new();
    }
    let count = signals.images_missing_alt;
    vec![issue(
        page_url,
        IssueType::MissingAltText,
        format!("{count} image(s) have no alt text."),
        Some(count.to_string()),
    )]
}

fn indexing_rule(signals: &PageSignals, page_url: &str) -> Vec<DetectedIssue> {
    match signals.noindex.as_ref() {
        Some(content) => vec![issue(
            page_url,
            IssueType::Noindex,
            "A robots meta tag tells search engines not to index this page.".to_string(),
            Some(content.clone()),
        )],
        None => Vec::new(),
    }
}

fn char_len(input: &str) -> usize {
    input.chars().count()
}

fn non_empty(input: String) -> Option<String> {
    if input.is_empty() { None } else { Some(input) }
}

fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_first_text(doc: &Html, selector: &str) -> String {
    let Ok(selector) = Selector::parse(selector) else {
        return String::new();
    };

    doc.select(&selector)
        .map(|el| normalize_text(&el.text().collect::<Vec<_>>().join(" ")))
        .find(|text| !text.is_empty())
        .unwrap_or_default()
}

/// Content of the first `<meta>` whose `name` matches, ignoring ASCII case.
fn extract_meta_content(doc: &Html, name: &str) -> String {
    let Ok(selector) = Selector::parse("meta[name]") else {
        return String::new();
    };

    doc.select(&selector)
        .filter(|el| {
            el.value()
                .attr("name")
                .map(|value| value.trim().eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
        .find_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .unwrap_or_default()
}

fn count_elements(doc: &Html, selector: &str) -> usize {
    Selector::parse(selector)
        .ok()
        .map(|sel| doc.select(&sel).count())
        .unwrap_or(0)
}

fn count_canonical_links(doc: &Html) -> usize {
    let Ok(selector) = Selector::parse("link[rel]") else {
        return 0;
    };
    doc.select(&selector)
        .filter(|el| {
            el.value()
                .attr("rel")
                .map(|rel| {
                    rel.split_whitespace()
                        .any(|token| token.eq_ignore_ascii_case("canonical"))
                })
                .unwrap_or(false)
        })
        .count()
}

fn count_images_missing_alt(doc: &Html) -> usize {
    let Ok(selector) = Selector::parse("img") else {
        return 0;
    };
    doc.select(&selector)
        .filter(|el| el.value().attr("alt").unwrap_or_default().trim().is_empty())
        .count()
}

fn noindex_directive(doc: &Html) -> Option<String> {
    let selector = Selector::parse("meta[name]").ok()?;
    doc.select(&selector)
        .filter(|el| {
            el.value()
                .attr("name")
                .map(|name| {
                    name.eq_ignore_ascii_case("robots") || name.eq_ignore_ascii_case("googlebot")
                })
                .unwrap_or(false)
        })
        .filter_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .find(|content| content.to_ascii_lowercase().contains("noindex"))
}
