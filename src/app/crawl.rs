use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc::Sender;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::error::{CrawlError, FetchError};
use super::fetch::{FetchedPage, PageFetcher, extract_links, host_of, is_same_host, normalize_crawl_url};

#[derive(Debug)]
pub enum CrawlEvent {
    Page(FetchedPage),
    Failed { url: String, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct CrawlSettings {
    pub concurrency: usize,
    pub request_delay: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlReport {
    /// Successfully fetched pages, in completion order.
    pub pages: Vec<String>,
    /// Every URL a fetch was dispatched for, failures included.
    pub visited: usize,
    pub failed: usize,
}

type FetchOutcome = (String, Result<(FetchedPage, Vec<String>), FetchError>);

pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, settings: CrawlSettings) -> Self {
        Self { fetcher, settings }
    }

    /// Breadth-first walk from `start_url`, dispatching at most `max_pages`
    /// fetches. The budget is reserved before each dispatch so concurrent
    /// completion cannot overshoot it. Fetched pages are forwarded on `tx`.
    pub async fn crawl(
        &self,
        start_url: &str,
        max_pages: usize,
        stop: Arc<AtomicBool>,
        tx: Option<Sender<CrawlEvent>>,
    ) -> Result<CrawlReport, CrawlError> {
        let seed = normalize_crawl_url(start_url)
            .ok_or_else(|| CrawlError::InvalidUrl(start_url.to_string()))?;
        let mut root_host =
            host_of(&seed).ok_or_else(|| CrawlError::InvalidUrl(start_url.to_string()))?;

        let concurrency = self.settings.concurrency.max(1);
        let mut report = CrawlReport::default();
        let mut visited = HashSet::<String>::new();
        let mut queued = HashSet::<String>::new();
        let mut frontier = VecDeque::<String>::new();
        let mut fetch_set: JoinSet<FetchOutcome> = JoinSet::new();
        let mut seed_error: Option<FetchError> = None;
        let mut receiver_gone = false;

        queued.insert(seed.clone());
        frontier.push_back(seed.clone());

        loop {
            while fetch_set.len() < concurrency && visited.len() < max_pages {
                if receiver_gone || stop.load(Ordering::Relaxed) {
                    break;
                }
                let Some(url) = frontier.pop_front() else {
                    break;
                };
                if !visited.insert(url.clone()) {
                    continue;
                }
                if visited.len() > 1 && !self.settings.request_delay.is_zero() {
                    tokio::time::sleep(self.settings.request_delay).await;
                }
                debug!(url = %url, "dispatching fetch");
                let fetcher = self.fetcher.clone();
                fetch_set.spawn(async move {
                    let result = fetcher.fetch(&url).await.map(|page| {
                        let base = if page.final_url.is_empty() {
                            page.url.clone()
                        } else {
                            page.final_url.clone()
                        };
                        let links = extract_links(&page.html, &base);
                        (page, links)
                    });
                    (url, result)
                });
            }

            let Some(joined) = fetch_set.join_next().await else {
                break;
            };
            let (url, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "fetch worker failed");
                    report.failed += 1;
                    continue;
                }
            };

            match result {
                Ok((page, links)) => {
                    if url == seed
                        && let Some(final_host) = host_of(&page.final_url)
                        && final_host != root_host
                    {
                        debug!(from = %root_host, to = %final_host, "start URL redirected, following host");
                        root_host = final_host;
                    }
                    for link in links {
                        if !is_same_host(&link, &root_host) {
                            continue;
                        }
                        if !visited.contains(&link) && queued.insert(link.clone()) {
                            frontier.push_back(link);
                        }
                    }
                    report.pages.push(url);
                    if let Some(tx) = tx.as_ref()
                        && tx.send(CrawlEvent::Page(page)).await.is_err()
                    {
                        receiver_gone = true;
                    }
                }
                Err(err) => {
                    warn!(url = %url, error = %err, "page fetch failed, continuing crawl");
                    report.failed += 1;
                    if let Some(tx) = tx.as_ref()
                        && tx
                            .send(CrawlEvent::Failed {
                                url: url.clone(),
                                reason: err.to_string(),
                            })
                            .await
                            .is_err()
                    {
                        receiver_gone = true;
                    }
                    if url == seed {
                        seed_error = Some(err);
                    }
                }
            }
        }

        if receiver_gone {
            debug!(url = %seed, "event receiver closed, crawl stopped early");
        }
        report.visited = visited.len();

        if report.pages.is_empty()
            && let Some(err) = seed_error
        {
            return Err(if err.is_timeout() {
                CrawlError::FetchTimeout(seed)
            } else {
                CrawlError::SeedUnreachable(err.to_string())
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use super::*;

    /// In-memory site keyed by absolute URL. URLs in `failing` answer 500,
    /// URLs in `timeouts` time out.
    #[derive(Default)]
    pub(crate) struct FakeSite {
        pub pages: HashMap<String, String>,
        pub failing: HashSet<String>,
        pub timeouts: HashSet<String>,
        pub hits: Mutex<HashMap<String, usize>>,
    }

    impl FakeSite {
        pub(crate) fn from_graph(graph: Vec<(&str, Vec<&str>)>) -> Self {
            let pages = graph
                .into_iter()
                .map(|(path, links)| {
                    let anchors = links
                        .iter()
                        .map(|link| format!("<a href=\"{link}\">{link}</a>"))
                        .collect::<String>();
                    let html = format!(
                        "<html><head><title>Page {path}</title></head><body><h1>{path}</h1>{anchors}</body></html>"
                    );
                    (format!("https://example.com{path}"), html)
                })
                .collect();
            Self {
                pages,
                ..Self::default()
            }
        }

        pub(crate) fn hits(&self, url: &str) -> usize {
            self.hits
                .lock()
                .map(|hits| hits.get(url).copied().unwrap_or(0))
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl PageFetcher for FakeSite {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            if let Ok(mut hits) = self.hits.lock() {
                *hits.entry(url.to_string()).or_insert(0) += 1;
            }
            if self.timeouts.contains(url) {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                });
            }
            if self.failing.contains(url) {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: 500,
                });
            }
            match self.pages.get(url) {
                Some(html) => Ok(FetchedPage {
                    url: url.to_string(),
                    final_url: url.to_string(),
                    status: 200,
                    html: html.clone(),
                }),
                None => Err(FetchError::Status {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }

    fn settings(concurrency: usize) -> CrawlSettings {
        CrawlSettings {
            concurrency,
            request_delay: Duration::ZERO,
        }
    }

    /// Fifteen pages: the home page links to p1..p14 and every page links
    /// back home and to its neighbour.
    pub(crate) fn fifteen_page_site() -> FakeSite {
        let paths = (1..=14).map(|i| format!("/p{i}")).collect::<Vec<_>>();
        let mut graph = vec![("/", paths.iter().map(String::as_str).collect::<Vec<_>>())];
        for (i, path) in paths.iter().enumerate() {
            let next = paths[(i + 1) % paths.len()].as_str();
            graph.push((path.as_str(), vec!["/", next]));
        }
        FakeSite::from_graph(graph)
    }

    fn no_stop() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn budget_caps_a_larger_site() {
        let site = Arc::new(fifteen_page_site());
        let crawler = Crawler::new(site.clone(), settings(3));

        let report = crawler
            .crawl("https://example.com/", 10, no_stop(), None)
            .await
            .expect("crawl succeeds");

        assert_eq!(report.pages.len(), 10);
        assert_eq!(report.visited, 10);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn never_exceeds_budget_and_never_revisits() {
        for max_pages in 1..=20 {
            let site = Arc::new(fifteen_page_site());
            let crawler = Crawler::new(site.clone(), settings(4));
            let report = crawler
                .crawl("https://example.com/", max_pages, no_stop(), None)
                .await
                .expect("crawl succeeds");

            assert!(report.pages.len() <= max_pages, "budget {max_pages}");
            assert_eq!(report.pages.len(), max_pages.min(15));
            let distinct = report.pages.iter().collect::<HashSet<_>>();
            assert_eq!(distinct.len(), report.pages.len());
            for url in site.pages.keys() {
                assert!(site.hits(url) <= 1, "{url} fetched twice");
            }
        }
    }

    #[tokio::test]
    async fn shared_link_is_visited_once() {
        let site = Arc::new(FakeSite::from_graph(vec![
            ("/", vec!["/a", "/b", "/c", "/shared"]),
            ("/a", vec!["/shared", "/shared#top"]),
            ("/b", vec!["/shared"]),
            ("/c", vec!["/shared?x=1"]),
            ("/shared", vec!["/a"]),
            ("/shared?x=1", vec![]),
        ]));
        let crawler = Crawler::new(site.clone(), settings(2));

        let report = crawler
            .crawl("https://example.com/", 50, no_stop(), None)
            .await
            .expect("crawl succeeds");

        assert_eq!(report.pages.len(), 6);
        assert_eq!(site.hits("https://example.com/shared"), 1);
        assert_eq!(site.hits("https://example.com/shared?x=1"), 1);
    }

    #[tokio::test]
    async fn single_page_failure_does_not_stop_the_crawl() {
        let mut site = FakeSite::from_graph(vec![
            ("/", vec!["/broken", "/ok"]),
            ("/broken", vec![]),
            ("/ok", vec!["/deeper"]),
            ("/deeper", vec![]),
        ]);
        site.failing.insert("https://example.com/broken".to_string());
        let crawler = Crawler::new(Arc::new(site), settings(1));
        let (tx, mut rx) = mpsc::channel(16);

        let report = crawler
            .crawl("https://example.com/", 10, no_stop(), Some(tx))
            .await
            .expect("crawl succeeds");

        assert_eq!(report.pages.len(), 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.visited, 4);

        let mut pages = 0;
        let mut failures = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                CrawlEvent::Page(_) => pages += 1,
                CrawlEvent::Failed { url, .. } => failures.push(url),
            }
        }
        assert_eq!(pages, 3);
        assert_eq!(failures, vec!["https://example.com/broken".to_string()]);
    }

    #[tokio::test]
    async fn unreachable_seed_fails_the_crawl() {
        let mut site = FakeSite::from_graph(vec![("/", vec![])]);
        site.timeouts.insert("https://example.com/".to_string());
        let crawler = Crawler::new(Arc::new(site), settings(2));

        let err = crawler
            .crawl("https://example.com/", 10, no_stop(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::FetchTimeout(_)));
    }

    #[tokio::test]
    async fn invalid_start_url_is_rejected() {
        let crawler = Crawler::new(Arc::new(FakeSite::default()), settings(2));
        let err = crawler
            .crawl("mailto:someone@example.com", 10, no_stop(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn closed_receiver_stops_dispatch() {
        let site = Arc::new(fifteen_page_site());
        let crawler = Crawler::new(site.clone(), settings(1));
        let (tx, rx) = mpsc::channel(4);
        drop(rx);

        let report = crawler
            .crawl("https://example.com/", 10, no_stop(), Some(tx))
            .await
            .expect("crawl ends without error");

        let fetched: usize = site.hits.lock().unwrap().values().sum();
        assert_eq!(fetched, 1);
        assert_eq!(report.visited, 1);
    }

    #[tokio::test]
    async fn raised_stop_flag_prevents_dispatch() {
        let site = Arc::new(fifteen_page_site());
        let crawler = Crawler::new(site.clone(), settings(2));
        let stop = Arc::new(AtomicBool::new(true));

        let report = crawler
            .crawl("https://example.com/", 10, stop, None)
            .await
            .expect("stopped crawl is not an error");
        assert!(report.pages.is_empty());
        assert_eq!(site.hits("https://example.com/"), 0);
    }
}
