//! Issue export to CSV or JSON.

use std::collections::HashMap;
use std::io::{self, Write};

use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::types::{Fix, Issue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataFormat {
    Csv,
    Json,
}

const CSV_HEADERS: [&str; 12] = [
    "scan_id",
    "issue_id",
    "page_url",
    "issue_type",
    "severity",
    "title",
    "description",
    "current_value",
    "fixable",
    "fix_id",
    "fix_status",
    "detected_at",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub scan_id: String,
    pub issue_id: String,
    pub page_url: String,
    pub issue_type: String,
    pub severity: String,
    pub title: String,
    pub description: String,
    pub current_value: String,
    pub fixable: bool,
    pub fix_id: String,
    /// `pending`, `applied`, or `none` when no fix exists.
    pub fix_status: String,
    pub detected_at: String,
}

fn issue_to_export_record(issue: &Issue, fix: Option<&Fix>) -> ExportRecord {
    ExportRecord {
        scan_id: issue.scan_id.clone(),
        issue_id: issue.id.clone(),
        page_url: issue.page_url.clone(),
        issue_type: issue.issue_type.label().to_string(),
        severity: issue.severity.label().to_string(),
        title: issue.title.clone(),
        description: issue.description.clone(),
        current_value: issue.current_value.clone().unwrap_or_default(),
        fixable: issue.fixable,
        fix_id: fix.map(|f| f.id.clone()).unwrap_or_default(),
        fix_status: fix
            .map(|f| f.status.label())
            .unwrap_or("none")
            .to_string(),
        detected_at: issue.created_at.to_rfc3339(),
    }
}

struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    fn new(out: W) -> io::Result<Self> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_row(&mut self, rec: ExportRecord) -> io::Result<()> {
        self.writer.write_record([
            rec.scan_id,
            rec.issue_id,
            rec.page_url,
            rec.issue_type,
            rec.severity,
            rec.title,
            rec.description,
            rec.current_value,
            rec.fixable.to_string(),
            rec.fix_id,
            rec.fix_status,
            rec.detected_at,
        ])?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink<W: Write> {
    out: W,
    first: bool,
}

impl<W: Write> JsonSink<W> {
    fn new(mut out: W) -> io::Result<Self> {
        out.write_all(b"[\n")?;
        Ok(Self { out, first: true })
    }

    fn write_row(&mut self, rec: ExportRecord) -> io::Result<()> {
        if !self.first {
            self.out.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.out, &rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        if self.first {
            self.out.write_all(b"]\n")?;
        } else {
            self.out.write_all(b"\n]\n")?;
        }
        self.out.flush()
    }
}

enum OutputSink<W: Write> {
    Csv(CsvSink<W>),
    Json(JsonSink<W>),
}

impl<W: Write> OutputSink<W> {
    fn new(out: W, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(out)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(out)?)),
        }
    }

    fn write_row(&mut self, rec: ExportRecord) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_row(rec),
            OutputSink::Json(sink) => sink.write_row(rec),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.finalize(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

/// Write `issues` with the status of their fix, one row each. Returns the
/// number of rows written.
pub fn export_issues<W: Write>(
    out: W,
    format: DataFormat,
    issues: &[Issue],
    fixes: &[Fix],
) -> io::Result<usize> {
    let by_issue = fixes
        .iter()
        .map(|fix| (fix.issue_id.as_str(), fix))
        .collect::<HashMap<_, _>>();

    let mut sink = OutputSink::new(out, format)?;
    for issue in issues {
        sink.write_row(issue_to_export_record(issue, by_issue.get(issue.id.as_str()).copied()))?;
    }
    sink.finalize()?;
    Ok(issues.len())
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn default_output_path(domain: &str, format: DataFormat) -> String {
    let host = domain
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let host = if host.is_empty() { "scan".to_string() } else { host };
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("{host}_issues_{ts}.csv"),
        DataFormat::Json => format!("{host}_issues_{ts}.json"),
    }
}
