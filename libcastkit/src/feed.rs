//! RSS/Atom/JSON Feed ingestion for cast-feed

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use scraper::{Html, Node};
use std::time::Duration;

use crate::db::Database;
use crate::error::{FeedError, Result};
use crate::http::HttpClient;

pub const DEFAULT_TEMPLATE: &str = "{title} {link}";

#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub id: String,
    pub title: String,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Feed {
    pub url: String,
    pub title: Option<String>,
    pub items: Vec<FeedItem>,
}

pub struct FeedManager {
    http: HttpClient,
}

impl FeedManager {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    pub async fn fetch(&self, url: &str) -> Result<Feed> {
        let response = self
            .http
            .inner()
            .get(url)
            .send()
            .await
            .map_err(|e| FeedError::Fetch(url.to_string(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Fetch(url.to_string(), format!("HTTP {}", response.status())).into());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| FeedError::Fetch(url.to_string(), e.to_string()))?;
        Self::parse(url, &body)
    }

    /// Parse a feed document of any format feed-rs understands
    pub fn parse(url: &str, body: &[u8]) -> Result<Feed> {
        let parsed = feed_rs::parser::parse(body)
            .map_err(|e| FeedError::Parse(url.to_string(), e.to_string()))?;

        let items = parsed
            .entries
            .into_iter()
            .map(|entry| {
                let link = entry.links.first().map(|l| l.href.clone());
                let id = if entry.id.is_empty() {
                    link.clone().unwrap_or_default()
                } else {
                    entry.id
                };
                let summary = entry
                    .summary
                    .map(|t| t.content)
                    .or_else(|| entry.content.and_then(|c| c.body))
                    .map(|s| strip_html(&s))
                    .filter(|s| !s.is_empty());
                FeedItem {
                    id,
                    title: entry
                        .title
                        .map(|t| strip_html(&t.content))
                        .unwrap_or_default(),
                    link,
                    summary,
                    published: entry.published.or(entry.updated),
                }
            })
            .collect();

        Ok(Feed {
            url: url.to_string(),
            title: parsed.title.map(|t| t.content),
            items,
        })
    }

    /// Dated items newer than `max_age`, newest first
    ///
    /// Without `max_age` every item is kept; undated items sort last.
    pub fn recent(feed: &Feed, max_age: Option<Duration>, now: DateTime<Utc>) -> Vec<FeedItem> {
        let cutoff = max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| now - age);

        let mut items: Vec<FeedItem> = feed
            .items
            .iter()
            .filter(|item| match (cutoff, item.published) {
                (Some(cutoff), Some(published)) => published >= cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| b.published.cmp(&a.published));
        items
    }

    pub fn latest(items: &[FeedItem]) -> Option<&FeedItem> {
        items.first()
    }

    pub fn random(items: &[FeedItem]) -> Option<&FeedItem> {
        items.choose(&mut rand::thread_rng())
    }

    /// Fill `{title}`, `{link}` and `{summary}`; collapses the whitespace left by empty fields
    pub fn render(item: &FeedItem, template: &str) -> String {
        let rendered = template
            .replace("{title}", &item.title)
            .replace("{link}", item.link.as_deref().unwrap_or(""))
            .replace("{summary}", item.summary.as_deref().unwrap_or(""));
        rendered
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    /// Items whose id has not been posted from this feed yet
    pub async fn unseen(db: &Database, url: &str, items: Vec<FeedItem>) -> Result<Vec<FeedItem>> {
        let seen = db.seen_feed_items(url).await?;
        Ok(items.into_iter().filter(|i| !seen.contains(&i.id)).collect())
    }

    pub async fn mark_seen(db: &Database, url: &str, item: &FeedItem) -> Result<()> {
        db.mark_feed_item_seen(url, &item.id, Utc::now().timestamp())
            .await
    }
}

/// Elements whose boundaries separate words in the extracted text
const BLOCK_ELEMENTS: &[&str] = &[
    "p", "br", "div", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre",
    "tr", "td", "th", "hr", "figure", "figcaption",
];

/// Plain text of an HTML fragment with entities decoded and whitespace collapsed
fn strip_html(input: &str) -> String {
    let fragment = Html::parse_fragment(input);
    let mut out = String::with_capacity(input.len());
    for node in fragment.tree.root().descendants() {
        match node.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) if BLOCK_ELEMENTS.contains(&element.name()) => out.push(' '),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}
