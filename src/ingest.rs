//! Assorted-links feed ingestion.
//!
//! Pulls an RSS/Atom feed, keeps the "assorted links" posts, extracts each
//! post's outbound links, and drives the cycle lifecycle: every new post
//! settles the currently open cycle with the post's links as winners and
//! opens the next one. Page fetching sits behind a trait so tests inject
//! canned responses.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{info, warn};
use url::Url;

use crate::market::error::MarketResult;
use crate::market::service::MarketService;
use crate::market::storage::MarketStore;
use crate::urls::canonicalize_url;

const USER_AGENT: &str = "link-market/1.0";
const DEFAULT_FEED_URL: &str = "https://marginalrevolution.com/feed";

/// Fetches page text over some transport. The reqwest implementation is the
/// only networked code in the crate.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        response
            .text()
            .await
            .with_context(|| format!("Failed to read body of {url}"))
    }
}

/// One "assorted links" post with its extracted outbound links.
#[derive(Debug, Clone)]
pub struct AssortedLinksPost {
    pub title: String,
    pub url: String,
    pub published_at: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
struct FeedEntry {
    title: String,
    link: String,
    published: String,
}

/// Settlement triggered by one ingested post.
#[derive(Debug, Clone)]
pub struct SyncSettlement {
    pub cycle_id: String,
    pub post_url: String,
    pub winner_count: usize,
}

/// Result of one ingestion sync.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub processed: usize,
    pub settlements: Vec<SyncSettlement>,
    pub bootstrap_mode: bool,
}

pub struct FeedIngestor {
    feed_url: String,
    fetcher: Arc<dyn PageFetcher>,
}

impl FeedIngestor {
    pub fn new(feed_url: Option<String>, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            feed_url: feed_url.unwrap_or_else(|| DEFAULT_FEED_URL.to_string()),
            fetcher,
        }
    }

    /// Feed URL for a given page; page 1 is the feed itself, later pages add
    /// a `paged` query param, keeping existing params intact.
    pub fn feed_url_for_page(&self, page: usize) -> String {
        if page <= 1 {
            return self.feed_url.clone();
        }
        match Url::parse(&self.feed_url) {
            Ok(mut parsed) => {
                parsed
                    .query_pairs_mut()
                    .append_pair("paged", &page.to_string());
                parsed.to_string()
            }
            Err(_) => self.feed_url.clone(),
        }
    }

    fn extract_post_entries(feed_xml: &str) -> Vec<FeedEntry> {
        let item_re = Regex::new(r"(?is)<item[^>]*>.*?</item>").unwrap();
        let entry_re = Regex::new(r"(?is)<entry[^>]*>.*?</entry>").unwrap();
        let title_re = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
        let link_text_re = Regex::new(r"(?is)<link[^>]*>(.*?)</link>").unwrap();
        let link_href_re = Regex::new(r#"(?i)<link[^>]*href=["']([^"']+)["']"#).unwrap();
        let pub_date_re = Regex::new(r"(?is)<pubDate>(.*?)</pubDate>").unwrap();
        let published_re =
            Regex::new(r"(?is)<published>(.*?)</published>|<updated>(.*?)</updated>").unwrap();

        let mut entries = Vec::new();

        for block in item_re.find_iter(feed_xml) {
            let block = block.as_str();
            let title = title_re
                .captures(block)
                .map(|c| strip_cdata(&c[1]))
                .unwrap_or_default();
            let link = link_text_re
                .captures(block)
                .map(|c| strip_cdata(&c[1]))
                .unwrap_or_default();
            let published = pub_date_re
                .captures(block)
                .map(|c| c[1].trim().to_string())
                .unwrap_or_default();
            if !title.is_empty() && !link.is_empty() {
                entries.push(FeedEntry {
                    title,
                    link,
                    published,
                });
            }
        }

        if entries.is_empty() {
            for block in entry_re.find_iter(feed_xml) {
                let block = block.as_str();
                let title = title_re
                    .captures(block)
                    .map(|c| strip_cdata(&c[1]))
                    .unwrap_or_default();
                let link = link_href_re
                    .captures(block)
                    .map(|c| c[1].trim().to_string())
                    .unwrap_or_default();
                let published = published_re
                    .captures(block)
                    .and_then(|c| c.get(1).or_else(|| c.get(2)))
                    .map(|m| m.as_str().trim().to_string())
                    .unwrap_or_default();
                if !title.is_empty() && !link.is_empty() {
                    entries.push(FeedEntry {
                        title,
                        link,
                        published,
                    });
                }
            }
        }

        entries
    }

    /// Canonicalized off-host links from a post body, deduplicated in order.
    fn extract_outbound_links(post_url: &str, html: &str) -> Vec<String> {
        let href_re = Regex::new(r#"(?i)href=["'](https?://[^"'#]+)"#).unwrap();
        let post_host = Url::parse(post_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();

        let mut seen = std::collections::HashSet::new();
        let mut links = Vec::new();

        for capture in href_re.captures_iter(html) {
            let Ok(canonical) = canonicalize_url(&capture[1]) else {
                continue;
            };
            let host = Url::parse(&canonical)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
                .unwrap_or_default();
            if host.is_empty() || host == post_host {
                continue;
            }
            if host.contains("marginalrevolution.com") {
                continue;
            }
            if seen.insert(canonical.clone()) {
                links.push(canonical);
            }
        }

        links
    }

    /// Normalize RSS/Atom publication stamps to RFC3339 UTC; unrecognized
    /// values pass through unchanged so sorting stays deterministic per feed.
    fn normalize_published(value: &str) -> String {
        let value = value.trim();
        if value.is_empty() {
            return Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        }
        if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
            return parsed
                .with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string();
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return parsed
                .with_timezone(&Utc)
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string();
        }
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
            return format!("{}Z", parsed.format("%Y-%m-%dT%H:%M:%S"));
        }
        value.to_string()
    }

    /// Fetch assorted-links posts across up to `max_feed_pages` feed pages,
    /// oldest first. `limit` of zero means unlimited.
    pub async fn fetch_recent_assorted_posts(
        &self,
        limit: usize,
        max_feed_pages: usize,
    ) -> Result<Vec<AssortedLinksPost>> {
        let mut entries: Vec<FeedEntry> = Vec::new();
        for page in 1..=max_feed_pages.max(1) {
            let page_url = self.feed_url_for_page(page);
            let feed_xml = match self.fetcher.fetch_text(&page_url).await {
                Ok(xml) => xml,
                Err(err) => {
                    if page == 1 {
                        return Err(err);
                    }
                    warn!("Skipping feed page {page_url}: {err:#}");
                    break;
                }
            };
            let page_entries = Self::extract_post_entries(&feed_xml);
            if page_entries.is_empty() {
                break;
            }
            entries.extend(page_entries);
        }

        let mut filtered: Vec<FeedEntry> = entries
            .into_iter()
            .filter(|entry| entry.title.to_ascii_lowercase().contains("assorted links"))
            .collect();
        if limit > 0 {
            filtered.truncate(limit);
        }

        let mut posts = Vec::with_capacity(filtered.len());
        for entry in filtered {
            let html = self.fetcher.fetch_text(&entry.link).await?;
            let links = Self::extract_outbound_links(&entry.link, &html);
            posts.push(AssortedLinksPost {
                title: entry.title,
                url: entry.link,
                published_at: Self::normalize_published(&entry.published),
                links,
            });
        }

        posts.sort_by(|a, b| a.published_at.cmp(&b.published_at));
        Ok(posts)
    }

    /// Process new posts: archive their links, settle the open cycle with
    /// each post's links as winners and open the next cycle. With no open
    /// cycle (bootstrap) only the latest cycle is opened.
    pub async fn sync(
        &self,
        market: &MarketService,
        limit: usize,
        max_feed_pages: usize,
    ) -> MarketResult<SyncReport> {
        let posts = self
            .fetch_recent_assorted_posts(limit, max_feed_pages)
            .await?;
        if posts.is_empty() {
            if market.open_cycle().await?.is_none() {
                market.create_cycle(Utc::now().date_naive()).await?;
            }
            return Ok(SyncReport {
                processed: 0,
                settlements: Vec::new(),
                bootstrap_mode: false,
            });
        }

        let mut unseen = Vec::new();
        for post in posts.iter() {
            if !market.store().source_post_seen(&post.url).await? {
                unseen.push(post.clone());
            }
        }
        if unseen.is_empty() {
            if market.open_cycle().await?.is_none() {
                // Bootstrapped from historical data only; make sure an
                // active market exists.
                let latest = post_date(&posts[posts.len() - 1]);
                market.create_cycle(latest).await?;
            }
            return Ok(SyncReport {
                processed: 0,
                settlements: Vec::new(),
                bootstrap_mode: false,
            });
        }

        let mut current_open = market.open_cycle().await?;
        let bootstrap_mode = current_open.is_none();
        let mut settlements = Vec::new();

        for post in &unseen {
            let date = post_date(post);

            for link in &post.links {
                market
                    .store()
                    .upsert_archive_link(&date.to_string(), link, &post.title, &post.url)
                    .await?;
            }

            if !bootstrap_mode {
                if let Some(open) = &current_open {
                    let summary = market.settle_cycle(&open.id, &post.links).await?;
                    info!(
                        "Post {} settled cycle {} with {} winners",
                        post.url, open.id, summary.winner_count
                    );
                    settlements.push(SyncSettlement {
                        cycle_id: open.id.clone(),
                        post_url: post.url.clone(),
                        winner_count: summary.winner_count,
                    });
                    current_open = Some(market.create_cycle(date).await?);
                }
            }

            market
                .store()
                .mark_source_post_processed(&post.url, &post.title, &post.published_at, &post.links)
                .await?;
        }

        if bootstrap_mode {
            let latest = post_date(&unseen[unseen.len() - 1]);
            market.create_cycle(latest).await?;
        }

        Ok(SyncReport {
            processed: unseen.len(),
            settlements,
            bootstrap_mode,
        })
    }
}

fn post_date(post: &AssortedLinksPost) -> chrono::NaiveDate {
    post.published_at
        .get(..10)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| Utc::now().date_naive())
}

fn strip_cdata(value: &str) -> String {
    let trimmed = value.trim();
    trimmed
        .strip_prefix("<![CDATA[")
        .and_then(|s| s.strip_suffix("]]>"))
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rss_items() {
        let feed = r#"
            <rss version="2.0"><channel>
              <item><title>Assorted Links A</title><link>https://example.org/assorted-1</link><pubDate>Fri, 06 Feb 2026 12:00:00 +0000</pubDate></item>
              <item><title>Not Assorted</title><link>https://example.org/other</link><pubDate>Fri, 06 Feb 2026 11:00:00 +0000</pubDate></item>
            </channel></rss>
        "#;
        let entries = FeedIngestor::extract_post_entries(feed);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].title, "Assorted Links A");
        assert_eq!(entries[0].link, "https://example.org/assorted-1");
    }

    #[test]
    fn outbound_links_skip_same_host_and_duplicates() {
        let html = r#"
            <a href="https://example.com/a?utm_source=x">a</a>
            <a href="https://example.com/a">a again</a>
            <a href="https://blog.example.org/self">self</a>
            <a href="https://marginalrevolution.com/post">mr</a>
            <a href="https://other.net/b">b</a>
        "#;
        let links =
            FeedIngestor::extract_outbound_links("https://blog.example.org/assorted-1", html);
        assert_eq!(
            links,
            vec![
                "https://example.com/a".to_string(),
                "https://other.net/b".to_string()
            ]
        );
    }

    #[test]
    fn normalizes_rfc2822_dates() {
        assert_eq!(
            FeedIngestor::normalize_published("Fri, 06 Feb 2026 12:00:00 +0000"),
            "2026-02-06T12:00:00Z"
        );
    }

    #[test]
    fn paged_feed_url_preserves_query_params() {
        let ingestor = FeedIngestor::new(
            Some("https://marginalrevolution.com/feed?foo=bar".to_string()),
            Arc::new(NoopFetcher),
        );
        assert_eq!(
            ingestor.feed_url_for_page(3),
            "https://marginalrevolution.com/feed?foo=bar&paged=3"
        );
        assert_eq!(
            ingestor.feed_url_for_page(1),
            "https://marginalrevolution.com/feed?foo=bar"
        );
    }

    struct NoopFetcher;

    #[async_trait]
    impl PageFetcher for NoopFetcher {
        async fn fetch_text(&self, _url: &str) -> Result<String> {
            Ok(String::new())
        }
    }
}
