//! Story set queries.
//!
//! A [`StorySet`] describes a filtered, ordered, paginated walk over the
//! publication index. Every backend must produce the same results for the
//! same query:
//!
//! - `topics`: only stories in these topics (`None` = all).
//! - `tags`: every plain tag must be present; a `!tag` must not be.
//! - `content`: case-insensitive substring of the raw story content.
//! - `from` / `to`: `date > to` skips the story; `date <= from` ends a
//!   date-ordered scan (a hit-ordered scan just skips it).
//! - unless `private`: no future stories, no stories past their unpublish
//!   date, no stories from missing or internal topics.
//! - `offset` counts matching stories only; `num` caps the results.
//! - `timeout` bounds the scan; running out truncates, it does not fail.

use crate::index::StoryEntry;
use crate::types::Date;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Scan order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Order {
    /// Publication index order, newest first.
    #[default]
    Date,
    /// Hit ranking index order, most read first.
    Hits,
}

/// Query parameters for [`crate::Store::story_set`].
#[derive(Clone, Debug, Default)]
pub struct StorySet {
    pub topics: Option<Vec<String>>,
    pub tags: Vec<String>,
    pub content: Option<String>,
    pub order: Order,
    pub from: Option<Date>,
    pub to: Option<Date>,
    pub num: Option<usize>,
    pub offset: usize,
    pub private: bool,
    pub timeout: Option<Duration>,
    /// Reference time for the visibility rules (defaults to now).
    pub now: Option<Date>,
}

impl StorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = Some(topics.into_iter().map(Into::into).collect());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn content(mut self, needle: impl Into<String>) -> Self {
        self.content = Some(needle.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    /// Exclusive lower date bound.
    pub fn from(mut self, date: Date) -> Self {
        self.from = Some(date);
        self
    }

    /// Inclusive upper date bound.
    pub fn to(mut self, date: Date) -> Self {
        self.to = Some(date);
        self
    }

    pub fn num(mut self, num: usize) -> Self {
        self.num = Some(num);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn as_of(mut self, now: Date) -> Self {
        self.now = Some(now);
        self
    }

    /// The "today" the visibility rules compare against.
    pub fn reference_date(&self) -> Date {
        self.now.clone().unwrap_or_else(Date::now)
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }

    pub(crate) fn wants_topic(&self, topic_id: &str) -> bool {
        self.topics
            .as_ref()
            .map_or(true, |topics| topics.iter().any(|t| t == topic_id))
    }
}

/// Tag filter: every plain tag present, every `!tag` absent.
///
/// An empty filter matches everything.
pub fn matches_tags(filter: &[String], tags: &[String]) -> bool {
    filter.iter().all(|wanted| match wanted.strip_prefix('!') {
        Some(banned) => !tags.iter().any(|t| t == banned),
        None => tags.iter().any(|t| t == wanted),
    })
}

pub(crate) fn contains_ignore_case(haystack: &str, needle_lower: &str) -> bool {
    haystack.to_lowercase().contains(needle_lower)
}

/// Record lookups a scan needs beyond the index itself.
pub(crate) trait Catalog {
    /// The topic exists and is not internal.
    fn topic_is_public(&self, topic_id: &str) -> bool;

    /// Raw content of a story, if it exists.
    fn story_content(&self, topic_id: &str, id: &str) -> Option<String>;
}

/// Offset, limit and deadline bookkeeping shared by every backend.
pub(crate) struct Window {
    offset: usize,
    num: Option<usize>,
    deadline: Option<Instant>,
    matched: usize,
    yielded: usize,
}

impl Window {
    pub(crate) fn new(query: &StorySet) -> Self {
        Self {
            offset: query.offset,
            num: query.num,
            deadline: query.deadline(),
            matched: 0,
            yielded: 0,
        }
    }

    /// Whether the scan must stop before looking at another candidate.
    pub(crate) fn exhausted(&self) -> bool {
        if self.num.is_some_and(|n| self.yielded >= n) {
            return true;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            tracing::debug!(yielded = self.yielded, "story set scan timed out");
            return true;
        }
        false
    }

    /// Count a matching candidate; true when it falls inside the window.
    pub(crate) fn accept(&mut self) -> bool {
        self.matched += 1;
        if self.matched <= self.offset {
            return false;
        }
        self.yielded += 1;
        true
    }
}

/// Lazy scan of index entries applying the full query semantics.
pub(crate) struct Scan<'a, I> {
    entries: I,
    query: StorySet,
    catalog: &'a dyn Catalog,
    today: String,
    needle: Option<String>,
    window: Window,
    public_topics: HashMap<String, bool>,
    finished: bool,
}

impl<'a, I: Iterator<Item = StoryEntry>> Scan<'a, I> {
    pub(crate) fn new(entries: I, query: &StorySet, catalog: &'a dyn Catalog) -> Self {
        Self {
            entries,
            today: query.reference_date().as_str().to_string(),
            needle: query.content.as_ref().map(|c| c.to_lowercase()),
            window: Window::new(query),
            query: query.clone(),
            catalog,
            public_topics: HashMap::new(),
            finished: false,
        }
    }

    fn topic_is_public(&mut self, topic_id: &str) -> bool {
        if let Some(&public) = self.public_topics.get(topic_id) {
            return public;
        }
        let public = self.catalog.topic_is_public(topic_id);
        self.public_topics.insert(topic_id.to_string(), public);
        public
    }

    fn is_visible(&mut self, entry: &StoryEntry) -> bool {
        if entry.date.as_str() > self.today.as_str() {
            return false;
        }
        if !entry.udate.is_empty() && entry.udate.as_str() < self.today.as_str() {
            return false;
        }
        self.topic_is_public(&entry.topic_id)
    }
}

impl<I: Iterator<Item = StoryEntry>> Iterator for Scan<'_, I> {
    type Item = StoryEntry;

    fn next(&mut self) -> Option<StoryEntry> {
        while !self.finished {
            if self.window.exhausted() {
                break;
            }

            let Some(entry) = self.entries.next() else {
                break;
            };

            if !self.query.wants_topic(&entry.topic_id) {
                continue;
            }

            if let Some(to) = &self.query.to {
                if entry.date.as_str() > to.as_str() {
                    continue;
                }
            }

            if let Some(from) = &self.query.from {
                if entry.date.as_str() <= from.as_str() {
                    if self.query.order == Order::Date {
                        break;
                    }
                    continue;
                }
            }

            if !self.query.private && !self.is_visible(&entry) {
                continue;
            }

            if !matches_tags(&self.query.tags, &entry.tags) {
                continue;
            }

            if let Some(needle) = &self.needle {
                let found = self
                    .catalog
                    .story_content(&entry.topic_id, &entry.id)
                    .is_some_and(|content| contains_ignore_case(&content, needle));
                if !found {
                    continue;
                }
            }

            if self.window.accept() {
                return Some(entry);
            }
        }

        self.finished = true;
        None
    }
}
