//! In-memory snapshot backend.
//!
//! The whole store lives in one [`Snapshot`] that is written to a JSON file
//! on flush, and only when something changed since the last one.

use super::{Backend, Entries};
use crate::error::Result;
use crate::index::{rank_entries, Merge, StoryEntry};
use crate::query::{Catalog, Order, Scan, StorySet};
use crate::records::{Follower, Kind, Record, Story, Topic, User};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

type Fields = BTreeMap<String, String>;

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct Snapshot {
    topics: BTreeMap<String, Fields>,
    /// Stories by topic, then by id.
    stories: BTreeMap<String, BTreeMap<String, Fields>>,
    users: BTreeMap<String, Fields>,
    /// Followers by user, then by id.
    followers: BTreeMap<String, BTreeMap<String, Fields>>,
    templates: BTreeMap<String, String>,
    /// Base64 encoded.
    images: BTreeMap<String, String>,
    /// Short url id to target.
    urls: BTreeMap<String, String>,
    #[serde(rename = ".INDEX")]
    index: Vec<StoryEntry>,
    #[serde(rename = ".top_ten")]
    top_ten: Vec<StoryEntry>,
}

fn to_fields<K: Kind>(record: &Record<K>) -> Fields {
    record
        .persisted()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn from_fields<K: Kind>(fields: &Fields) -> Record<K> {
    Record::from_persisted(fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
}

/// In-memory backend mirrored to a JSON file.
pub struct MemBackend {
    path: PathBuf,
    db: Snapshot,
    pending: usize,
}

impl MemBackend {
    /// Load the snapshot at `path`. A missing or corrupt file gives an empty
    /// store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let db = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt snapshot, starting empty"
                );
                Snapshot::default()
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no snapshot yet");
                Snapshot::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "unreadable snapshot, starting empty"
                );
                Snapshot::default()
            }
        };

        Self {
            path,
            db,
            pending: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of modifications since the last flush.
    pub fn pending(&self) -> usize {
        self.pending
    }

    fn touch(&mut self) {
        self.pending += 1;
    }

    fn write_snapshot(&self) -> Result<()> {
        let json = serde_json::to_string(&self.db)?;

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".new");
        let tmp = PathBuf::from(tmp_name);

        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Catalog for MemBackend {
    fn topic_is_public(&self, topic_id: &str) -> bool {
        self.db
            .topics
            .get(topic_id)
            .is_some_and(|t| t.get("internal").map(String::as_str) != Some("1"))
    }

    fn story_content(&self, topic_id: &str, id: &str) -> Option<String> {
        let story = self.db.stories.get(topic_id)?.get(id)?;
        Some(story.get("content").cloned().unwrap_or_default())
    }
}

impl Backend for MemBackend {
    fn describe(&self) -> String {
        format!("MEM ({})", self.path.display())
    }

    fn create(&mut self) -> Result<()> {
        self.touch();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }

        self.write_snapshot()?;
        tracing::info!(path = %self.path.display(), writes = self.pending, "flushed snapshot");
        self.pending = 0;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }

    fn load_topic(&self, id: &str) -> Result<Option<Topic>> {
        Ok(self.db.topics.get(id).map(from_fields))
    }

    fn save_topic(&mut self, topic: &Topic) -> Result<()> {
        let id = topic.id().to_string();
        self.db.stories.entry(id.clone()).or_default();
        self.db.topics.insert(id, to_fields(topic));
        self.touch();
        Ok(())
    }

    fn topic_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.topics.keys().cloned().collect())
    }

    fn load_story(&self, topic_id: &str, id: &str) -> Result<Option<Story>> {
        Ok(self
            .db
            .stories
            .get(topic_id)
            .and_then(|stories| stories.get(id))
            .map(from_fields))
    }

    fn save_story(&mut self, story: &Story) -> Result<()> {
        self.db
            .stories
            .entry(story.topic_id().to_string())
            .or_default()
            .insert(story.id().to_string(), to_fields(story));

        let index = std::mem::take(&mut self.db.index);
        self.db.index = Merge::insert(index.into_iter(), StoryEntry::from_story(story)).collect();

        self.touch();
        Ok(())
    }

    fn delete_story(&mut self, topic_id: &str, id: &str) -> Result<()> {
        if let Some(stories) = self.db.stories.get_mut(topic_id) {
            stories.remove(id);
        }

        let index = std::mem::take(&mut self.db.index);
        self.db.index = Merge::remove(index.into_iter(), topic_id, id).collect();
        self.db.top_ten.retain(|e| !e.is_story(topic_id, id));

        self.touch();
        Ok(())
    }

    fn story_ids(&self, topic_id: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .stories
            .get(topic_id)
            .map(|stories| stories.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn load_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.db.users.get(id).map(from_fields))
    }

    fn save_user(&mut self, user: &User) -> Result<()> {
        let id = user.id().to_string();
        self.db.followers.entry(id.clone()).or_default();
        self.db.users.insert(id, to_fields(user));
        self.touch();
        Ok(())
    }

    fn user_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.users.keys().cloned().collect())
    }

    fn load_follower(&self, user_id: &str, id: &str) -> Result<Option<Follower>> {
        Ok(self
            .db
            .followers
            .get(user_id)
            .and_then(|followers| followers.get(id))
            .map(from_fields))
    }

    fn save_follower(&mut self, follower: &Follower) -> Result<()> {
        self.db
            .followers
            .entry(follower.user_id().to_string())
            .or_default()
            .insert(follower.id().to_string(), to_fields(follower));
        self.touch();
        Ok(())
    }

    fn delete_follower(&mut self, user_id: &str, id: &str) -> Result<()> {
        let removed = self
            .db
            .followers
            .get_mut(user_id)
            .and_then(|followers| followers.remove(id));

        if removed.is_some() {
            self.touch();
        }
        Ok(())
    }

    fn follower_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .db
            .followers
            .get(user_id)
            .map(|followers| followers.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn template(&self, id: &str) -> Result<Option<String>> {
        Ok(self.db.templates.get(id).cloned())
    }

    fn save_template(&mut self, id: &str, content: &str) -> Result<()> {
        self.db.templates.insert(id.to_string(), content.to_string());
        self.touch();
        Ok(())
    }

    fn template_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.templates.keys().cloned().collect())
    }

    fn image(&self, id: &str) -> Result<Option<Vec<u8>>> {
        match self.db.images.get(id) {
            Some(encoded) => Ok(Some(BASE64.decode(encoded)?)),
            None => Ok(None),
        }
    }

    fn save_image(&mut self, id: &str, content: &[u8]) -> Result<()> {
        self.db.images.insert(id.to_string(), BASE64.encode(content));
        self.touch();
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.images.keys().cloned().collect())
    }

    fn url(&self, id: &str) -> Result<Option<String>> {
        Ok(self.db.urls.get(id).cloned())
    }

    fn save_url(&mut self, id: &str, url: &str) -> Result<()> {
        self.db.urls.insert(id.to_string(), url.to_string());
        self.touch();
        Ok(())
    }

    fn url_ids(&self) -> Result<Vec<String>> {
        Ok(self.db.urls.keys().cloned().collect())
    }

    fn story_set<'a>(&'a self, query: &StorySet) -> Result<Entries<'a>> {
        let entries = match query.order {
            Order::Date => &self.db.index,
            Order::Hits => &self.db.top_ten,
        };
        Ok(Box::new(Scan::new(entries.iter().cloned(), query, self)))
    }

    fn update_ranking(&mut self) -> Result<()> {
        let ranked = self
            .db
            .index
            .iter()
            .map(|entry| {
                let hits = self
                    .db
                    .stories
                    .get(&entry.topic_id)
                    .and_then(|stories| stories.get(&entry.id))
                    .and_then(|fields| fields.get("hits"))
                    .and_then(|h| h.trim().parse().ok())
                    .unwrap_or(0u64);
                (hits, entry.clone())
            })
            .collect();

        self.db.top_ten = rank_entries(ranked);
        self.touch();
        Ok(())
    }
}
