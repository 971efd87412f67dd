use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::collab::{LogNotifier, Notifier, StoreQuota, WebhookNotifier};
use super::config::AppConfig;
use super::data_io::{DataFormat, default_output_path, detect_data_format, export_issues};
use super::fetch::HttpFetcher;
use super::pipeline::AuditService;
use super::store::Store;
use super::types::ScanStatus;
use super::webdriver::WebDriverEngine;
use super::widget::{WIDGET_CACHE_CONTROL, WIDGET_CONTENT_TYPE};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(
    name = "sitemend",
    version,
    about = "Site audit crawler with fix generation and browser verification"
)]
struct Cli {
    /// Configuration file used instead of ./sitemend.toml.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Crawl and audit a site, waiting until the scan finishes.
    Scan {
        #[arg(value_name = "URL")]
        url: String,
        #[arg(long, value_name = "ID")]
        account: String,
        #[arg(long, value_name = "N")]
        max_pages: Option<usize>,
    },
    /// Show one scan.
    Status { scan: String },
    /// List scans that are crawling or scanning.
    Active,
    /// Stop a running scan and mark it failed.
    Abort { scan: String },
    /// Export a scan's issues with the status of their fixes to a file.
    Issues {
        scan: String,
        #[arg(long, value_enum, default_value_t = DataFormat::Csv)]
        format: DataFormat,
        #[arg(short, long, value_name = "FILE")]
        output: Option<String>,
    },
    /// Apply the auto-fix for one issue, or for every fixable issue.
    Apply {
        scan: String,
        #[arg(long, value_name = "ID", conflicts_with = "all", required_unless_present = "all")]
        issue: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Replace an issue's fix with a freshly synthesized pending one.
    Regenerate { scan: String, issue: String },
    /// Print the combined fix script for a domain.
    Widget {
        domain: String,
        #[arg(short, long, value_name = "FILE")]
        output: Option<String>,
    },
    /// Render a page, run the widget in it and record what changed.
    Verify {
        scan: String,
        #[arg(value_name = "URL")]
        url: String,
        #[arg(long)]
        domain: Option<String>,
    },
    /// List recorded verifications for a scan.
    Verifications { scan: String },
}

fn init_tracing(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("SITEMEND_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|error| anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

async fn build_service(config: AppConfig) -> anyhow::Result<AuditService> {
    let store = Store::open(&config.store.path)
        .await
        .with_context(|| format!("failed to open store at '{}'", config.store.path))?;
    let store = Arc::new(store);

    let fetcher = HttpFetcher::new(&config.crawler.user_agent, config.crawler.timeout())
        .context("failed to build HTTP client")?;
    let quota = StoreQuota::new(Arc::clone(&store), config.quota.monthly_pages);
    let notifier: Arc<dyn Notifier> = match config.notify.webhook_url.as_deref() {
        Some(url) => Arc::new(WebhookNotifier::new(url).context("failed to build webhook notifier")?),
        None => Arc::new(LogNotifier),
    };
    let engine = WebDriverEngine::new(&config.verifier).context("failed to build WebDriver client")?;

    Ok(AuditService::new(
        store,
        Arc::new(fetcher),
        Arc::new(quota),
        notifier,
        Arc::new(engine),
        config,
    ))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{text}");
    Ok(())
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    debug!(store = %config.store.path, webdriver = %config.verifier.webdriver_url, "configuration loaded");
    let service = build_service(config).await?;

    match cli.command {
        Command::Scan {
            url,
            account,
            max_pages,
        } => run_scan(&service, &url, &account, max_pages).await,
        Command::Status { scan } => {
            let status = service.get_scan_status(&scan).await?;
            let issue_count = service.count_issues(&scan).await?;
            print_json(&json!({ "scan": status, "issue_count": issue_count }))
        }
        Command::Active => print_json(&service.active_scans().await?),
        Command::Abort { scan } => print_json(&service.abort_scan(&scan).await?),
        Command::Issues {
            scan,
            format,
            output,
        } => {
            let issues = service.list_issues(&scan).await?;
            let fixes = service.list_fixes(&scan).await?;
            let path = match output {
                Some(path) => path,
                None => default_output_path(&service.get_scan_status(&scan).await?.domain, format),
            };
            let format = detect_data_format(&path, format);
            let file = File::create(&path).with_context(|| format!("failed to create '{path}'"))?;
            let rows = export_issues(BufWriter::new(file), format, &issues, &fixes)
                .with_context(|| format!("failed to write '{path}'"))?;
            eprintln!("exported {rows} issues to {path}");
            Ok(())
        }
        Command::Apply { scan, issue, all } => {
            if all {
                print_json(&service.apply_all_fixes(&scan).await?)
            } else {
                let issue = issue.ok_or_else(|| anyhow!("either --issue or --all is required"))?;
                print_json(&service.apply_fix(&scan, &issue).await?)
            }
        }
        Command::Regenerate { scan, issue } => print_json(&service.regenerate_fix(&scan, &issue).await?),
        Command::Widget { domain, output } => {
            let script = service.get_widget_script(&domain).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &script)
                        .with_context(|| format!("failed to write '{path}'"))?;
                    eprintln!(
                        "wrote widget for {domain} to {path} (Content-Type: {WIDGET_CONTENT_TYPE}; Cache-Control: {WIDGET_CACHE_CONTROL})"
                    );
                }
                None => {
                    let mut out = io::stdout().lock();
                    out.write_all(script.as_bytes())?;
                    out.flush()?;
                }
            }
            Ok(())
        }
        Command::Verify { scan, url, domain } => {
            match service.verify_autofix(&scan, &url, domain.as_deref()).await {
                Ok(result) => print_json(&result),
                Err(err) => {
                    print_json(&json!({ "verified": false, "reason": err.to_string() }))?;
                    Err(err.into())
                }
            }
        }
        Command::Verifications { scan } => print_json(&service.list_verifications(&scan).await?),
    }
}

async fn run_scan(
    service: &AuditService,
    url: &str,
    account: &str,
    max_pages: Option<usize>,
) -> anyhow::Result<()> {
    let scan_id = service.start_scan(url, account, max_pages).await?;
    eprintln!("started scan {scan_id}");

    let mut last = None;
    loop {
        tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        let scan = service.get_scan_status(&scan_id).await?;
        let progress = (scan.status, scan.pages_visited);
        if last != Some(progress) {
            eprintln!(
                "scan {}: {} ({}/{} pages)",
                scan.id,
                scan.status.label(),
                scan.pages_visited,
                scan.max_pages
            );
            last = Some(progress);
        }
        if scan.status.is_terminal() {
            print_json(&scan)?;
            if scan.status == ScanStatus::Failed {
                let reason = scan.failure_reason.as_deref().unwrap_or("unknown");
                return Err(anyhow!("scan {} failed: {reason}", scan.id));
            }
            return Ok(());
        }
    }
}
