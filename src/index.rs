//! Publication index.
//!
//! One entry per existing story, sorted descending by `(date, topic_id, id)`.
//! The flat-file backend keeps it as text lines, the snapshot backend as a
//! list; both maintain it with the same merge-insert.

use crate::records::{join_list, split_list, Story};
use crate::types::Date;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;

/// A story as seen by the publication index and by query results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoryEntry {
    pub date: String,
    pub topic_id: String,
    pub id: String,
    pub tags: Vec<String>,
    /// Unpublish date, empty if none.
    pub udate: String,
}

impl StoryEntry {
    /// Index entry for a story. Undated stories sort as the oldest.
    pub fn from_story(story: &Story) -> Self {
        let date = if story.date().is_empty() {
            Date::zero().as_str().to_string()
        } else {
            story.date().to_string()
        };

        Self {
            date,
            topic_id: story.topic_id().to_string(),
            id: story.id().to_string(),
            tags: story.tags().to_vec(),
            udate: story.udate().to_string(),
        }
    }

    /// `date:topic:id:tags:udate`, without the newline.
    pub fn to_line(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.date,
            self.topic_id,
            self.id,
            join_list(&self.tags),
            self.udate
        )
    }

    /// Parse an index line. Short lines are padded with empty fields.
    pub fn parse_line(line: &str) -> Self {
        let mut parts = line.trim_end_matches(['\n', '\r']).split(':');
        let mut next = || parts.next().unwrap_or("").to_string();

        let date = next();
        let topic_id = next();
        let id = next();
        let tags = split_list(&next());
        let udate = next();

        Self {
            date,
            topic_id,
            id,
            tags,
            udate,
        }
    }

    pub fn is_story(&self, topic_id: &str, id: &str) -> bool {
        self.topic_id == topic_id && self.id == id
    }

    fn key(&self) -> (&str, &str, &str) {
        (&self.date, &self.topic_id, &self.id)
    }

    /// Descending index order: newer first, ties broken by topic then id,
    /// both descending.
    pub fn index_order(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl Serialize for StoryEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_line())
    }
}

impl<'de> Deserialize<'de> for StoryEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let line = String::deserialize(deserializer)?;
        Ok(StoryEntry::parse_line(&line))
    }
}

/// Sort a full set of entries into index order.
pub fn sort_entries(entries: &mut [StoryEntry]) {
    entries.sort_by(StoryEntry::index_order);
}

/// Sort entries into hit ranking order: most hits first, ties in index order.
pub fn rank_entries(mut ranked: Vec<(u64, StoryEntry)>) -> Vec<StoryEntry> {
    ranked.sort_by(|(ha, a), (hb, b)| hb.cmp(ha).then_with(|| a.index_order(b)));
    ranked.into_iter().map(|(_, entry)| entry).collect()
}

/// Streaming merge-insert over an index in order.
///
/// Drops any entry for the target story and, when a replacement is given,
/// emits it right before the first entry that sorts after it. A delete is a
/// merge without replacement.
pub struct Merge<I> {
    current: I,
    topic_id: String,
    id: String,
    pending: Option<StoryEntry>,
    held: Option<StoryEntry>,
}

impl<I: Iterator<Item = StoryEntry>> Merge<I> {
    pub fn insert(current: I, entry: StoryEntry) -> Self {
        Self {
            current,
            topic_id: entry.topic_id.clone(),
            id: entry.id.clone(),
            pending: Some(entry),
            held: None,
        }
    }

    pub fn remove(current: I, topic_id: &str, id: &str) -> Self {
        Self {
            current,
            topic_id: topic_id.to_string(),
            id: id.to_string(),
            pending: None,
            held: None,
        }
    }
}

impl<I: Iterator<Item = StoryEntry>> Iterator for Merge<I> {
    type Item = StoryEntry;

    fn next(&mut self) -> Option<StoryEntry> {
        if let Some(entry) = self.held.take() {
            return Some(entry);
        }

        for entry in self.current.by_ref() {
            if entry.is_story(&self.topic_id, &self.id) {
                continue;
            }

            let goes_first = self
                .pending
                .as_ref()
                .is_some_and(|p| p.index_order(&entry) == Ordering::Less);

            if goes_first {
                self.held = Some(entry);
                return self.pending.take();
            }

            return Some(entry);
        }

        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(date: &str, topic: &str, id: &str) -> StoryEntry {
        StoryEntry {
            date: date.to_string(),
            topic_id: topic.to_string(),
            id: id.to_string(),
            tags: Vec::new(),
            udate: String::new(),
        }
    }

    #[test]
    fn test_line_format() {
        let mut e = entry("20200101000000", "news", "hello");
        e.tags = vec!["a".into(), "b".into()];
        assert_eq!(e.to_line(), "20200101000000:news:hello:a,b:");

        let parsed = StoryEntry::parse_line("20200101000000:news:hello:a,b:\n");
        assert_eq!(parsed, e);
    }

    #[test]
    fn test_short_line_is_padded() {
        let parsed = StoryEntry::parse_line("20200101000000:news:hello");
        assert_eq!(parsed.id, "hello");
        assert!(parsed.tags.is_empty());
        assert_eq!(parsed.udate, "");
    }

    #[test]
    fn test_merge_inserts_in_date_order() {
        let current = vec![
            entry("20200301000000", "t", "c"),
            entry("20200101000000", "t", "a"),
        ];
        let merged: Vec<_> =
            Merge::insert(current.into_iter(), entry("20200201000000", "t", "b")).collect();
        let ids: Vec<_> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn test_merge_replaces_existing_entry() {
        let current = vec![
            entry("20200301000000", "t", "c"),
            entry("20200201000000", "t", "b"),
            entry("20200101000000", "t", "a"),
        ];
        let merged: Vec<_> =
            Merge::insert(current.into_iter(), entry("20200401000000", "t", "a")).collect();
        let ids: Vec<_> = merged.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "c", "b"]);
    }

    #[test]
    fn test_merge_appends_oldest() {
        let current = vec![entry("20200301000000", "t", "c")];
        let merged: Vec<_> =
            Merge::insert(current.into_iter(), entry("19000101000000", "t", "z")).collect();
        assert_eq!(merged.last().unwrap().id, "z");
    }

    #[test]
    fn test_remove() {
        let current = vec![
            entry("20200301000000", "t", "c"),
            entry("20200201000000", "t", "b"),
        ];
        let merged: Vec<_> = Merge::remove(current.into_iter(), "t", "c").collect();
        assert_eq!(merged, vec![entry("20200201000000", "t", "b")]);
    }

    #[test]
    fn test_equal_dates_break_ties_by_topic_then_id() {
        let mut entries = vec![
            entry("20200101000000", "a", "x"),
            entry("20200101000000", "b", "a"),
            entry("20200101000000", "a", "y"),
        ];
        sort_entries(&mut entries);
        let keys: Vec<_> = entries
            .iter()
            .map(|e| format!("{}/{}", e.topic_id, e.id))
            .collect();
        assert_eq!(keys, ["b/a", "a/y", "a/x"]);
    }

    #[test]
    fn test_rank_entries() {
        let ranked = rank_entries(vec![
            (3, entry("20200101000000", "t", "a")),
            (10, entry("20190101000000", "t", "b")),
            (3, entry("20210101000000", "t", "c")),
        ]);
        let ids: Vec<_> = ranked.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[test]
    fn test_serde_as_line() {
        let e = entry("20200101000000", "news", "x");
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, "\"20200101000000:news:x::\"");
        let back: StoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    proptest! {
        #[test]
        fn prop_merge_keeps_index_sorted_and_unique(
            ops in proptest::collection::vec((0u8..8, 2000u32..2030, any::<bool>()), 1..60)
        ) {
            let mut index: Vec<StoryEntry> = Vec::new();

            for (id, year, delete) in ops {
                let id = format!("s{id}");
                index = if delete {
                    Merge::remove(index.into_iter(), "t", &id).collect()
                } else {
                    let e = entry(&format!("{year}0101000000"), "t", &id);
                    Merge::insert(index.into_iter(), e).collect()
                };
            }

            for pair in index.windows(2) {
                prop_assert_ne!(pair[0].index_order(&pair[1]), Ordering::Greater);
            }

            let mut ids: Vec<_> = index.iter().map(|e| e.id.clone()).collect();
            ids.sort();
            ids.dedup();
            prop_assert_eq!(ids.len(), index.len());
        }
    }
}
